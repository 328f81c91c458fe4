//! The rate limit gate.
//!
//! A [`RateLimitGate`] holds the ordered guards of one API client and runs
//! every outbound action through them. Waiting happens outside all tracker
//! locks, and after every wait each guard is evaluated again because the
//! windows have moved in the meantime.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use super::action::ActionDescriptor;
use super::clock::{Clock, ManualClock, Sleeper, SystemClock, TokioSleeper};
use super::guard::{Guard, KeySelector, LimitCheck, RateLimitState, Reservation};
use super::retry_after::{RetryAfterGuard, RETRY_AFTER_GUARD};
use crate::error::{GateError, Result};

/// Default number of buffered rate limit events per subscriber.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// What the gate does when an action does not fit yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitBehaviour {
    /// Sleep until the action fits
    #[default]
    Wait,
    /// Return [`GateError::RateLimitExceeded`] immediately
    Fail,
}

/// Usage of one guard after an action was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardSnapshot {
    pub guard: String,
    pub limit: u32,
    pub period: Duration,
    pub current: u64,
}

/// Result of [`RateLimitGate::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckOutcome {
    /// Total time spent waiting across all passes
    pub waited: Duration,
}

/// Result of [`RateLimitGate::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApplyOutcome {
    pub snapshots: Vec<GuardSnapshot>,
}

/// Result of [`RateLimitGate::process`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessOutcome {
    /// Total time spent waiting across all passes
    pub waited: Duration,
    /// Usage of every guard the action was recorded against
    pub snapshots: Vec<GuardSnapshot>,
}

/// Published whenever a guard holds an action back.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitEvent {
    pub gate: String,
    pub guard: String,
    pub description: String,
    pub action: String,
    pub limit: u32,
    pub period: Duration,
    pub current: u64,
    pub weight: u32,
    pub wait: Duration,
    pub behaviour: LimitBehaviour,
}

enum Pass {
    Admitted(Vec<GuardSnapshot>),
    Wait(Duration),
}

/// Ordered set of guards shared by all outbound actions of one client.
///
/// The gate is `Send + Sync` and meant to be shared behind an `Arc`.
#[derive(Debug)]
pub struct RateLimitGate {
    name: String,
    guards: Vec<Guard>,
    retry_after: RwLock<Option<RetryAfterGuard>>,
    behaviour: LimitBehaviour,
    idle_ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    events: broadcast::Sender<RateLimitEvent>,
}

impl RateLimitGate {
    /// Start building a gate.
    pub fn builder(name: impl Into<String>) -> GateBuilder {
        GateBuilder::new(name)
    }

    /// Name of the gate.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured behaviour when an action does not fit.
    pub fn behaviour(&self) -> LimitBehaviour {
        self.behaviour
    }

    /// The configured guards, in evaluation order.
    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    /// The active Retry-After back-off, if any.
    pub fn retry_after(&self) -> Option<RetryAfterGuard> {
        *self.retry_after.read()
    }

    /// Receive an event every time a guard holds an action back.
    pub fn subscribe(&self) -> broadcast::Receiver<RateLimitEvent> {
        self.events.subscribe()
    }

    /// Descriptions of all guards, including an active back-off.
    pub fn describe(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.guards.iter().map(|g| g.description()).collect();
        if let Some(retry_after) = self.retry_after() {
            lines.insert(0, retry_after.description());
        }
        lines
    }

    /// Usage versus limit of every guard covering this action.
    pub fn state(&self, action: &ActionDescriptor) -> Vec<String> {
        let now = self.clock.now();
        self.applicable(action)
            .into_iter()
            .map(|guard| guard.state(action, now))
            .collect()
    }

    /// Wait until the action fits every applicable guard, without recording
    /// it. Call [`apply`](Self::apply) once the action was actually sent.
    pub async fn check(&self, action: &ActionDescriptor) -> Result<CheckOutcome> {
        self.check_with_cancel(action, std::future::pending()).await
    }

    /// Like [`check`](Self::check), giving up with [`GateError::Canceled`]
    /// when `cancel` resolves during a wait.
    pub async fn check_with_cancel<F>(&self, action: &ActionDescriptor, cancel: F) -> Result<CheckOutcome>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        let guards = self.applicable(action);
        let mut waited = Duration::ZERO;

        loop {
            let now = self.clock.now();
            let wait = self.evaluate(action, &guards, now)?;
            if wait.is_zero() {
                break;
            }
            self.sleep_or_cancel(action, wait, cancel.as_mut()).await?;
            waited += wait;
        }

        trace!(
            gate = %self.name,
            action = %action,
            waited_ms = waited.as_millis() as u64,
            "Action cleared"
        );
        Ok(CheckOutcome { waited })
    }

    /// Record the action against every applicable guard.
    pub fn apply(&self, action: &ActionDescriptor) -> ApplyOutcome {
        let now = self.clock.now();
        let snapshots = self
            .applicable(action)
            .into_iter()
            .filter_map(|guard| match guard.apply_weight(action, now) {
                RateLimitState::Applied {
                    limit,
                    period,
                    current,
                } => Some(GuardSnapshot {
                    guard: guard.name().to_string(),
                    limit,
                    period,
                    current,
                }),
                RateLimitState::NotApplied => None,
            })
            .collect();

        trace!(gate = %self.name, action = %action, "Applied action weight");
        ApplyOutcome { snapshots }
    }

    /// Wait until the action fits and record it in one step.
    ///
    /// Usage is reserved guard by guard on the final pass; if any guard turns
    /// out to need a wait, earlier reservations from that pass are released
    /// before sleeping.
    pub async fn process(&self, action: &ActionDescriptor) -> Result<ProcessOutcome> {
        self.process_with_cancel(action, std::future::pending()).await
    }

    /// Like [`process`](Self::process), giving up with [`GateError::Canceled`]
    /// when `cancel` resolves during a wait. Nothing is recorded then.
    pub async fn process_with_cancel<F>(&self, action: &ActionDescriptor, cancel: F) -> Result<ProcessOutcome>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        let guards = self.applicable(action);
        let mut waited = Duration::ZERO;

        loop {
            let now = self.clock.now();
            match self.reserve(action, &guards, now)? {
                Pass::Admitted(snapshots) => {
                    trace!(
                        gate = %self.name,
                        action = %action,
                        waited_ms = waited.as_millis() as u64,
                        "Action admitted"
                    );
                    return Ok(ProcessOutcome { waited, snapshots });
                }
                Pass::Wait(wait) => {
                    self.sleep_or_cancel(action, wait, cancel.as_mut()).await?;
                    waited += wait;
                }
            }
        }
    }

    /// Hold back every action until `deadline`.
    ///
    /// A later deadline replaces an earlier one; an earlier one is ignored.
    pub fn register_retry_after(&self, deadline: DateTime<Utc>) {
        let mut slot = self.retry_after.write();
        let deadline = match *slot {
            Some(existing) if existing.deadline() > deadline => existing.deadline(),
            _ => deadline,
        };
        *slot = Some(RetryAfterGuard::new(deadline));
        warn!(gate = %self.name, deadline = %deadline, "Server requested back-off");
    }

    /// Hold back every action for `delay` from now.
    pub fn register_retry_after_in(&self, delay: Duration) {
        let delay = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
        let now = self.clock.now();
        let deadline = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.register_retry_after(deadline);
    }

    /// Drop idle trackers according to the configured TTL. Returns the
    /// number removed; zero when eviction is disabled.
    pub fn evict_idle(&self) -> usize {
        let Some(ttl) = self.idle_ttl else {
            return 0;
        };
        let now = self.clock.now();
        self.guards.iter().map(|g| g.evict_idle(now, ttl)).sum()
    }

    /// Guards covering this action, after short-circuit and total exclusion.
    fn applicable(&self, action: &ActionDescriptor) -> Vec<&Guard> {
        let mut applicable = Vec::new();
        for guard in &self.guards {
            if !guard.applies_to(action) {
                continue;
            }
            applicable.push(guard);
            if guard.short_circuits() {
                break;
            }
        }

        if applicable.iter().any(|g| g.excludes_total()) {
            applicable.retain(|g| g.excludes_total() || g.key_selector() != KeySelector::Total);
        }
        applicable
    }

    /// Longest wait any guard requires at `now`; zero when the action fits.
    fn evaluate(&self, action: &ActionDescriptor, guards: &[&Guard], now: DateTime<Utc>) -> Result<Duration> {
        let mut wait = self.retry_after_wait(action, now)?;
        for guard in guards {
            if let LimitCheck::Needed {
                wait: needed,
                limit,
                period,
                current,
            } = guard.check(action, now)?
            {
                self.on_needed(action, guard.name(), guard.description(), needed, limit, period, current)?;
                wait = wait.max(needed);
            }
        }
        Ok(wait)
    }

    fn reserve(&self, action: &ActionDescriptor, guards: &[&Guard], now: DateTime<Utc>) -> Result<Pass> {
        let mut wait = self.retry_after_wait(action, now)?;
        let mut reserved: Vec<(&Guard, DateTime<Utc>)> = Vec::new();
        let mut snapshots = Vec::new();

        for guard in guards {
            if !wait.is_zero() {
                // Admission already failed this pass; only collect waits.
                if let LimitCheck::Needed {
                    wait: needed,
                    limit,
                    period,
                    current,
                } = guard.check(action, now)?
                {
                    self.on_needed(action, guard.name(), guard.description(), needed, limit, period, current)?;
                    wait = wait.max(needed);
                }
                continue;
            }

            match guard.reserve(action, now) {
                Ok(Reservation::NotApplicable) => {}
                Ok(Reservation::Reserved {
                    reserved_at,
                    limit,
                    period,
                    current,
                }) => {
                    reserved.push((*guard, reserved_at));
                    snapshots.push(GuardSnapshot {
                        guard: guard.name().to_string(),
                        limit,
                        period,
                        current,
                    });
                }
                Ok(Reservation::Needed {
                    wait: needed,
                    limit,
                    period,
                    current,
                }) => {
                    Self::release(action, &reserved);
                    reserved.clear();
                    self.on_needed(action, guard.name(), guard.description(), needed, limit, period, current)?;
                    wait = needed;
                }
                Err(err) => {
                    Self::release(action, &reserved);
                    return Err(err);
                }
            }
        }

        if wait.is_zero() {
            Ok(Pass::Admitted(snapshots))
        } else {
            Ok(Pass::Wait(wait))
        }
    }

    fn release(action: &ActionDescriptor, reserved: &[(&Guard, DateTime<Utc>)]) {
        for (guard, reserved_at) in reserved {
            guard.release(action, *reserved_at);
        }
    }

    fn retry_after_wait(&self, action: &ActionDescriptor, now: DateTime<Utc>) -> Result<Duration> {
        let Some(retry_after) = *self.retry_after.read() else {
            return Ok(Duration::ZERO);
        };

        match retry_after.check(now) {
            LimitCheck::Needed {
                wait,
                limit,
                period,
                current,
            } => {
                self.on_needed(
                    action,
                    RETRY_AFTER_GUARD,
                    retry_after.description(),
                    wait,
                    limit,
                    period,
                    current,
                )?;
                Ok(wait)
            }
            _ => {
                let mut slot = self.retry_after.write();
                if slot.is_some_and(|guard| guard.is_expired(now)) {
                    *slot = None;
                    debug!(gate = %self.name, "Retry-after back-off expired");
                }
                Ok(Duration::ZERO)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_needed(
        &self,
        action: &ActionDescriptor,
        guard: &str,
        description: String,
        wait: Duration,
        limit: u32,
        period: Duration,
        current: u64,
    ) -> Result<()> {
        debug!(
            gate = %self.name,
            guard = %guard,
            action = %action,
            current = current,
            limit = limit,
            wait_ms = wait.as_millis() as u64,
            "Rate limit reached"
        );

        let event = RateLimitEvent {
            gate: self.name.clone(),
            guard: guard.to_string(),
            description: description.clone(),
            action: action.to_string(),
            limit,
            period,
            current,
            weight: action.weight,
            wait,
            behaviour: self.behaviour,
        };
        // No subscribers is not an error.
        let _ = self.events.send(event);

        match self.behaviour {
            LimitBehaviour::Wait => Ok(()),
            LimitBehaviour::Fail => {
                warn!(gate = %self.name, guard = %guard, action = %action, "Rate limit exceeded, failing action");
                Err(GateError::RateLimitExceeded {
                    guard: guard.to_string(),
                    description,
                    limit,
                    period,
                    current,
                    weight: action.weight,
                    wait,
                })
            }
        }
    }

    async fn sleep_or_cancel<F>(&self, action: &ActionDescriptor, wait: Duration, cancel: Pin<&mut F>) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        debug!(
            gate = %self.name,
            action = %action,
            wait_ms = wait.as_millis() as u64,
            "Waiting for rate limit"
        );

        tokio::select! {
            biased;
            _ = cancel => {
                debug!(gate = %self.name, action = %action, "Rate limit wait canceled");
                Err(GateError::Canceled)
            }
            _ = self.sleeper.sleep(wait) => Ok(()),
        }
    }
}

/// Builder for [`RateLimitGate`].
#[derive(Debug)]
pub struct GateBuilder {
    name: String,
    guards: Vec<Guard>,
    behaviour: LimitBehaviour,
    idle_ttl: Option<Duration>,
    event_capacity: usize,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl GateBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guards: Vec::new(),
            behaviour: LimitBehaviour::default(),
            idle_ttl: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn behaviour(mut self, behaviour: LimitBehaviour) -> Self {
        self.behaviour = behaviour;
        self
    }

    /// Append a guard; guards are evaluated in insertion order.
    pub fn guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn guards(mut self, guards: impl IntoIterator<Item = Guard>) -> Self {
        self.guards.extend(guards);
        self
    }

    /// Evict trackers idle for longer than `ttl` on [`RateLimitGate::evict_idle`].
    pub fn idle_tracker_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.idle_ttl = ttl;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Use a manual clock both for time and for waiting.
    pub fn manual_clock(self, clock: ManualClock) -> Self {
        let sleeper = Arc::new(clock.clone());
        self.clock(Arc::new(clock)).sleeper(sleeper)
    }

    pub fn build(self) -> Result<RateLimitGate> {
        for (i, guard) in self.guards.iter().enumerate() {
            if self.guards[..i].iter().any(|g| g.name() == guard.name()) {
                return Err(GateError::Config(format!(
                    "duplicate guard name '{}' in gate '{}'",
                    guard.name(),
                    self.name
                )));
            }
        }

        let (events, _) = broadcast::channel(self.event_capacity.max(1));

        info!(
            gate = %self.name,
            guards = self.guards.len(),
            behaviour = ?self.behaviour,
            "Rate limit gate initialized"
        );

        Ok(RateLimitGate {
            name: self.name,
            guards: self.guards,
            retry_after: RwLock::new(None),
            behaviour: self.behaviour,
            idle_ttl: self.idle_ttl,
            clock: self.clock,
            sleeper: self.sleeper,
            events,
        })
    }
}
