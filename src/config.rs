//! Configuration management for Tollgate.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GateError, Result};
use crate::ratelimit::{build_guards, Clock, GuardRule, LimitBehaviour, RateLimitGate, Sleeper};

/// Prefix of environment variables overriding file values, e.g.
/// `TOLLGATE__GATE__BEHAVIOUR=fail`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration: gate settings plus the ordered guard rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TollgateConfig {
    #[serde(default)]
    pub gate: GateSettings,

    /// Guard rules, evaluated in order
    #[serde(default)]
    pub guards: Vec<GuardRule>,
}

/// Gate-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSettings {
    /// Name reported in logs and events
    #[serde(default = "default_name")]
    pub name: String,

    /// Wait for capacity or fail fast
    #[serde(default)]
    pub behaviour: LimitBehaviour,

    /// Evict trackers idle for this many seconds; unset disables eviction
    #[serde(default = "default_idle_tracker_ttl")]
    pub idle_tracker_ttl_secs: Option<u64>,

    /// Buffered events per subscriber
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            behaviour: LimitBehaviour::default(),
            idle_tracker_ttl_secs: default_idle_tracker_ttl(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_name() -> String {
    "default".to_string()
}

fn default_idle_tracker_ttl() -> Option<u64> {
    Some(600)
}

fn default_event_capacity() -> usize {
    256
}

impl TollgateConfig {
    /// Load configuration from a file, with `TOLLGATE__*` environment
    /// overrides applied on top.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading gate configuration");

        let config: TollgateConfig = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GateError::Config(format!("Failed to load {}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse gate config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every rule without keeping the built guards.
    pub fn validate(&self) -> Result<()> {
        if self.gate.name.is_empty() {
            return Err(GateError::Config("gate name must not be empty".to_string()));
        }
        if self.gate.idle_tracker_ttl_secs == Some(0) {
            return Err(GateError::Config("idle_tracker_ttl_secs must be greater than 0".to_string()));
        }
        build_guards(&self.guards).map(|_| ())
    }

    /// Build a gate from this configuration.
    pub fn build_gate(&self, clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Result<RateLimitGate> {
        RateLimitGate::builder(self.gate.name.clone())
            .behaviour(self.gate.behaviour)
            .idle_tracker_ttl(self.gate.idle_tracker_ttl_secs.map(Duration::from_secs))
            .event_capacity(self.gate.event_capacity)
            .clock(clock)
            .sleeper(sleeper)
            .guards(build_guards(&self.guards)?)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ActionDescriptor, HttpMethod, ManualClock};
    use chrono::DateTime;
    use std::io::Write;

    const RULES: &str = r#"
gate:
  name: binance
  behaviour: fail
  idle_tracker_ttl_secs: 120
guards:
  - name: total
    limit: 2
    unit: second
  - name: orders
    limit: 10
    unit: second
    key: api_key
    filter:
      signed_only: true
"#;

    #[test]
    fn test_defaults() {
        let config = TollgateConfig::from_yaml("guards: []").unwrap();
        assert_eq!(config.gate, GateSettings::default());
        assert_eq!(config.gate.behaviour, LimitBehaviour::Wait);
        assert_eq!(config.gate.idle_tracker_ttl_secs, Some(600));
    }

    #[test]
    fn test_from_yaml() {
        let config = TollgateConfig::from_yaml(RULES).unwrap();
        assert_eq!(config.gate.name, "binance");
        assert_eq!(config.gate.behaviour, LimitBehaviour::Fail);
        assert_eq!(config.guards.len(), 2);
        assert_eq!(config.guards[1].name, "orders");
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let yaml = "guards:\n  - name: broken\n    limit: 0\n";
        assert!(matches!(TollgateConfig::from_yaml(yaml), Err(GateError::Config(_))));

        let yaml = "gate:\n  idle_tracker_ttl_secs: 0\n";
        assert!(matches!(TollgateConfig::from_yaml(yaml), Err(GateError::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("tollgate-config-{}.yaml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(RULES.as_bytes()).unwrap();
        drop(file);

        let config = TollgateConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config, TollgateConfig::from_yaml(RULES).unwrap());
    }

    #[test]
    fn test_missing_file() {
        let result = TollgateConfig::from_file("/nonexistent/tollgate.yaml");
        assert!(matches!(result, Err(GateError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_gate() {
        let config = TollgateConfig::from_yaml(RULES).unwrap();
        let clock = ManualClock::new(DateTime::from_timestamp(1_704_067_200, 0).unwrap());
        let gate = config
            .build_gate(Arc::new(clock.clone()), Arc::new(clock))
            .unwrap();

        assert_eq!(gate.name(), "binance");
        assert_eq!(gate.behaviour(), LimitBehaviour::Fail);
        assert_eq!(gate.guards().len(), 2);

        let action = ActionDescriptor::request("api.ex.com", "/api/v3/time", HttpMethod::Get);
        gate.process(&action).await.unwrap();
        gate.process(&action).await.unwrap();
        assert!(gate.process(&action).await.is_err());
    }
}
