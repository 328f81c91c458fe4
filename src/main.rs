use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::error::GateError;
use tollgate::ratelimit::{
    ActionDescriptor, ActionKind, ApiKeyId, Clock, EndpointLimit, HttpMethod, LimitBehaviour, ManualClock,
    ProcessOutcome, RateLimitEvent, RateLimitGate, Sleeper, SystemClock, TokioSleeper, WindowAlgorithm,
};

/// Replay recorded outbound actions through a rate limit gate.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Gate configuration (YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Actions to replay, one JSON object per line
    #[arg(short, long)]
    actions: PathBuf,

    /// Override the configured behaviour
    #[arg(long, value_enum)]
    behaviour: Option<BehaviourArg>,

    /// Use a simulated clock so waits complete instantly
    #[arg(long)]
    simulated: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BehaviourArg {
    Wait,
    Fail,
}

impl From<BehaviourArg> for LimitBehaviour {
    fn from(arg: BehaviourArg) -> Self {
        match arg {
            BehaviourArg::Wait => LimitBehaviour::Wait,
            BehaviourArg::Fail => LimitBehaviour::Fail,
        }
    }
}

/// One line of the actions file.
#[derive(Debug, Deserialize)]
struct ActionRecord {
    #[serde(default = "default_kind")]
    kind: ActionKind,
    host: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    method: Option<HttpMethod>,
    #[serde(default = "default_weight")]
    weight: u32,
    #[serde(default)]
    signed: bool,
    /// Raw credential; only its hash is kept
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    endpoint_limit: Option<EndpointLimitRecord>,
    /// Pause before sending this action
    #[serde(default)]
    delay_ms: u64,
    /// Simulate a Retry-After response to this action
    #[serde(default)]
    retry_after_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EndpointLimitRecord {
    limit: u32,
    period_ms: u64,
    #[serde(default)]
    window: Option<WindowAlgorithm>,
}

fn default_kind() -> ActionKind {
    ActionKind::Request
}

fn default_weight() -> u32 {
    1
}

impl ActionRecord {
    fn to_descriptor(&self) -> ActionDescriptor {
        let mut action = match self.kind {
            ActionKind::Request => ActionDescriptor::request(
                self.host.clone(),
                self.path.clone(),
                self.method.unwrap_or(HttpMethod::Get),
            ),
            ActionKind::Connection => ActionDescriptor::connection(self.host.clone(), self.path.clone()),
        }
        .with_weight(self.weight);

        if let Some(secret) = &self.api_key {
            let id = ApiKeyId::from_secret(secret);
            action = if self.signed {
                action.signed_with(id)
            } else {
                action.with_api_key(id)
            };
        } else {
            action.signed = self.signed;
        }

        if let Some(declared) = &self.endpoint_limit {
            let limit = EndpointLimit::new(declared.limit, Duration::from_millis(declared.period_ms));
            action = action.with_endpoint_limit(match declared.window {
                Some(window) => limit.with_algorithm(window),
                None => limit,
            });
        }
        action
    }
}

/// One line of output per replayed action.
#[derive(Debug, Serialize)]
struct Outcome {
    line: usize,
    action: String,
    status: &'static str,
    waited_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    usage: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Outcome {
    fn new(line: usize, action: &ActionDescriptor, result: &Result<ProcessOutcome, GateError>) -> Self {
        match result {
            Ok(outcome) => Self {
                line,
                action: action.to_string(),
                status: "admitted",
                waited_ms: outcome.waited.as_millis() as u64,
                usage: outcome
                    .snapshots
                    .iter()
                    .map(|s| format!("{} {}/{} per {:?}", s.guard, s.current, s.limit, s.period))
                    .collect(),
                error: None,
            },
            Err(err) => Self {
                line,
                action: action.to_string(),
                status: match err {
                    GateError::Canceled => "canceled",
                    GateError::Unsatisfiable { .. } => "unsatisfiable",
                    _ => "rejected",
                },
                waited_ms: 0,
                usage: Vec::new(),
                error: Some(err.to_string()),
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Starting Tollgate replay");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TollgateConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    if let Some(behaviour) = cli.behaviour {
        config.gate.behaviour = behaviour.into();
    }

    let (clock, sleeper): (Arc<dyn Clock>, Arc<dyn Sleeper>) = if cli.simulated {
        let clock = ManualClock::starting_now();
        (Arc::new(clock.clone()), Arc::new(clock))
    } else {
        (Arc::new(SystemClock), Arc::new(TokioSleeper))
    };

    let gate = config.build_gate(clock, Arc::clone(&sleeper))?;
    info!(gate = %gate.name(), simulated = cli.simulated, "Configuration loaded");
    for line in gate.describe() {
        info!("{}", line);
    }

    tokio::spawn(log_events(gate.subscribe()));
    let shutdown = shutdown_signal();

    let file = tokio::fs::File::open(&cli.actions)
        .await
        .with_context(|| format!("failed to open {}", cli.actions.display()))?;
    let mut lines = BufReader::new(file).lines();

    let (mut admitted, mut refused) = (0usize, 0usize);
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let record: ActionRecord = serde_json::from_str(line)
            .with_context(|| format!("invalid action record on line {}", line_no))?;
        if record.delay_ms > 0 {
            sleeper.sleep(Duration::from_millis(record.delay_ms)).await;
        }

        let action = record.to_descriptor();
        let result = replay(&gate, &action, shutdown.clone()).await;
        println!("{}", serde_json::to_string(&Outcome::new(line_no, &action, &result))?);

        match result {
            Ok(_) => admitted += 1,
            Err(GateError::Canceled) => {
                warn!(line = line_no, "Replay interrupted");
                break;
            }
            Err(_) => refused += 1,
        }

        if let Some(delay) = record.retry_after_ms {
            gate.register_retry_after_in(Duration::from_millis(delay));
        }
        gate.evict_idle();
    }

    info!(admitted = admitted, refused = refused, "Tollgate replay finished");
    Ok(())
}

async fn replay(
    gate: &RateLimitGate,
    action: &ActionDescriptor,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ProcessOutcome, GateError> {
    gate.process_with_cancel(action, async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    })
    .await
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn log_events(mut events: broadcast::Receiver<RateLimitEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => info!(
                guard = %event.guard,
                action = %event.action,
                current = event.current,
                limit = event.limit,
                wait_ms = event.wait.as_millis() as u64,
                "Rate limit hit"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "Dropped rate limit events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Flip the returned flag on Ctrl+C so pending waits are canceled.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, canceling pending waits");
                let _ = tx.send(true);
            }
            Err(err) => {
                warn!(error = %err, "Failed to install Ctrl+C handler");
                // Keep the sender alive so waits are never canceled.
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_action_record() {
        let record: ActionRecord = serde_json::from_str(
            r#"{"host":"api.ex.com","path":"/api/v3/order","method":"POST","weight":2,"signed":true,"api_key":"secret"}"#,
        )
        .unwrap();
        let action = record.to_descriptor();

        assert_eq!(action.kind, ActionKind::Request);
        assert_eq!(action.method, Some(HttpMethod::Post));
        assert_eq!(action.weight, 2);
        assert!(action.signed);
        assert_eq!(action.api_key, Some(ApiKeyId::from_secret("secret")));
    }

    #[test]
    fn test_parse_connection_with_declared_limit() {
        let record: ActionRecord = serde_json::from_str(
            r#"{"kind":"connection","host":"stream.ex.com","path":"/ws","endpoint_limit":{"limit":5,"period_ms":1000,"window":"sliding"}}"#,
        )
        .unwrap();
        let action = record.to_descriptor();

        assert_eq!(action.kind, ActionKind::Connection);
        assert_eq!(action.method, None);
        let declared = action.endpoint_limit.unwrap();
        assert_eq!(declared.limit, 5);
        assert_eq!(declared.period, Duration::from_secs(1));
        assert_eq!(declared.algorithm, WindowAlgorithm::Sliding);
    }

    #[test]
    fn test_outcome_for_error() {
        let action = ActionDescriptor::request("h", "/x", HttpMethod::Get);
        let result = Err(GateError::Unsatisfiable {
            guard: "total".to_string(),
            limit: 1,
            weight: 2,
        });
        let outcome = Outcome::new(3, &action, &result);
        assert_eq!(outcome.status, "unsatisfiable");
        assert!(outcome.error.is_some());
    }
}
