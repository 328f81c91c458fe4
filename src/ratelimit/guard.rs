//! Limiting rules.
//!
//! A [`Guard`] pairs a [`Filter`] deciding whether an action falls under the
//! rule with a [`KeySelector`] deciding which tracker counts it. Trackers are
//! created on first use of a key and kept in a concurrent map owned by the
//! guard.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::action::{ActionDescriptor, ActionKind, HttpMethod};
use super::tracker::{Admission, WindowAlgorithm, WindowTracker};
use crate::error::{GateError, Result};

/// Predicate over an action deciding whether a guard applies to it.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every action
    Always,
    /// Actions of one of the listed kinds
    Kinds(Vec<ActionKind>),
    /// Actions aimed at this host
    Host(String),
    /// Actions on exactly this path, optionally only for one method
    ExactPath {
        path: String,
        method: Option<HttpMethod>,
    },
    /// Actions whose path starts with this prefix, optionally only for one method
    PathPrefix {
        prefix: String,
        method: Option<HttpMethod>,
    },
    /// Signed actions only
    SignedOnly,
    /// Actions carrying their own endpoint limit
    DeclaredLimit,
    /// Every inner filter must match
    All(Vec<Filter>),
}

impl Filter {
    /// Whether the action matches this filter.
    pub fn matches(&self, action: &ActionDescriptor) -> bool {
        match self {
            Filter::Always => true,
            Filter::Kinds(kinds) => kinds.contains(&action.kind),
            Filter::Host(host) => action.host.eq_ignore_ascii_case(host),
            Filter::ExactPath { path, method } => {
                action.path == *path && method_matches(*method, action)
            }
            Filter::PathPrefix { prefix, method } => {
                action.path.starts_with(prefix.as_str()) && method_matches(*method, action)
            }
            Filter::SignedOnly => action.signed,
            Filter::DeclaredLimit => action.endpoint_limit.is_some(),
            Filter::All(filters) => filters.iter().all(|f| f.matches(action)),
        }
    }
}

fn method_matches(expected: Option<HttpMethod>, action: &ActionDescriptor) -> bool {
    expected.map_or(true, |m| action.method == Some(m))
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Always => f.write_str("all actions"),
            Filter::Kinds(kinds) => {
                let names: Vec<&str> = kinds
                    .iter()
                    .map(|k| match k {
                        ActionKind::Request => "requests",
                        ActionKind::Connection => "connections",
                    })
                    .collect();
                f.write_str(&names.join("+"))
            }
            Filter::Host(host) => write!(f, "host {}", host),
            Filter::ExactPath { path, method } => match method {
                Some(m) => write!(f, "{} {}", m, path),
                None => write!(f, "path {}", path),
            },
            Filter::PathPrefix { prefix, method } => match method {
                Some(m) => write!(f, "{} {}*", m, prefix),
                None => write!(f, "paths {}*", prefix),
            },
            Filter::SignedOnly => f.write_str("signed"),
            Filter::DeclaredLimit => f.write_str("endpoint-declared"),
            Filter::All(filters) => {
                let parts: Vec<String> = filters.iter().map(|f| f.to_string()).collect();
                f.write_str(&parts.join(", "))
            }
        }
    }
}

/// Which tracker an applicable action is counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySelector {
    /// One shared tracker
    Total,
    /// One tracker per host
    Host,
    /// One tracker per path and method
    Endpoint,
    /// One tracker per API key
    ApiKey,
    /// One tracker per API key and endpoint
    ApiKeyEndpoint,
}

impl KeySelector {
    /// Resolve the tracker key for an action, or `None` when the action
    /// lacks the dimension this selector keys on.
    pub fn key(&self, action: &ActionDescriptor) -> Option<String> {
        match self {
            KeySelector::Total => Some("total".to_string()),
            KeySelector::Host => Some(format!("host:{}", action.host.to_ascii_lowercase())),
            KeySelector::Endpoint => Some(format!("endpoint:{}", action.endpoint_key())),
            KeySelector::ApiKey => action.api_key.map(|k| format!("key:{}", k)),
            KeySelector::ApiKeyEndpoint => action
                .api_key
                .map(|k| format!("key:{}:{}", k, action.endpoint_key())),
        }
    }
}

impl fmt::Display for KeySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeySelector::Total => "total",
            KeySelector::Host => "per host",
            KeySelector::Endpoint => "per endpoint",
            KeySelector::ApiKey => "per api key",
            KeySelector::ApiKeyEndpoint => "per api key and endpoint",
        };
        f.write_str(name)
    }
}

/// Where a guard takes its numeric limit from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitSource {
    /// Limit fixed when the guard is built
    Configured {
        limit: u32,
        period: Duration,
        algorithm: WindowAlgorithm,
        initial_usage: u32,
    },
    /// Limit taken from each action's [`EndpointLimit`](super::action::EndpointLimit)
    Declared,
}

/// Result of checking an action against one guard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitCheck {
    /// The guard does not cover this action
    NotApplicable,
    /// The action fits right now
    NotNeeded,
    /// The action must wait before it fits
    Needed {
        wait: Duration,
        limit: u32,
        period: Duration,
        current: u64,
    },
}

/// Result of applying an action's weight to one guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitState {
    /// The guard does not cover this action
    NotApplied,
    /// Weight was recorded; `current` includes it
    Applied {
        limit: u32,
        period: Duration,
        current: u64,
    },
}

/// Result of an atomic check-and-commit against one guard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Reservation {
    NotApplicable,
    Reserved {
        /// When the tracker recorded the weight; pass back to `release`
        reserved_at: DateTime<Utc>,
        limit: u32,
        period: Duration,
        current: u64,
    },
    Needed {
        wait: Duration,
        limit: u32,
        period: Duration,
        current: u64,
    },
}

/// One limiting rule with its per-key trackers.
#[derive(Debug)]
pub struct Guard {
    name: String,
    filter: Filter,
    key: KeySelector,
    source: LimitSource,
    short_circuit: bool,
    exclude_from_total: bool,
    trackers: DashMap<String, Arc<WindowTracker>>,
}

impl Guard {
    /// Start building a guard.
    pub fn builder(name: impl Into<String>) -> GuardBuilder {
        GuardBuilder::new(name)
    }

    /// Name of the guard.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The guard's key selector.
    pub fn key_selector(&self) -> KeySelector {
        self.key
    }

    /// The guard's filter.
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Whether no further guards are evaluated once this one applies.
    pub fn short_circuits(&self) -> bool {
        self.short_circuit
    }

    /// Whether applicable `Total` guards are skipped when this one applies.
    pub fn excludes_total(&self) -> bool {
        self.exclude_from_total
    }

    /// Number of trackers currently held.
    pub fn tracker_count(&self) -> usize {
        self.trackers.len()
    }

    /// Human-readable summary of the rule.
    pub fn description(&self) -> String {
        let limit = match self.source {
            LimitSource::Configured {
                limit,
                period,
                algorithm,
                ..
            } => format!("{} per {:?} ({})", limit, period, algorithm),
            LimitSource::Declared => "endpoint-declared limit".to_string(),
        };
        format!("{}: {}, {}, for {}", self.name, limit, self.key, self.filter)
    }

    /// Whether the guard covers this action.
    pub fn applies_to(&self, action: &ActionDescriptor) -> bool {
        self.filter.matches(action)
            && self.key.key(action).is_some()
            && (self.source != LimitSource::Declared || action.endpoint_limit.is_some())
    }

    /// Check whether the action fits without recording anything.
    pub fn check(&self, action: &ActionDescriptor, now: DateTime<Utc>) -> Result<LimitCheck> {
        let Some(tracker) = self.tracker_for(action, now) else {
            return Ok(LimitCheck::NotApplicable);
        };

        let admission = tracker.wait_time(now, action.weight);
        trace!(guard = %self.name, admission = ?admission, "Checked guard");

        match admission {
            Admission::Clear => Ok(LimitCheck::NotNeeded),
            Admission::Wait(wait) => Ok(LimitCheck::Needed {
                wait,
                limit: tracker.limit(),
                period: tracker.period(),
                current: tracker.current(now),
            }),
            Admission::Never => Err(self.unsatisfiable(&tracker, action)),
        }
    }

    /// Record the action's weight.
    pub fn apply_weight(&self, action: &ActionDescriptor, now: DateTime<Utc>) -> RateLimitState {
        let Some(tracker) = self.tracker_for(action, now) else {
            return RateLimitState::NotApplied;
        };

        tracker.apply_weight(now, action.weight);
        RateLimitState::Applied {
            limit: tracker.limit(),
            period: tracker.period(),
            current: tracker.current(now),
        }
    }

    /// Record the action's weight only if it fits right now.
    pub(crate) fn reserve(&self, action: &ActionDescriptor, now: DateTime<Utc>) -> Result<Reservation> {
        let Some(tracker) = self.tracker_for(action, now) else {
            return Ok(Reservation::NotApplicable);
        };

        match tracker.try_reserve(now, action.weight) {
            Ok(reserved_at) => Ok(Reservation::Reserved {
                reserved_at,
                limit: tracker.limit(),
                period: tracker.period(),
                current: tracker.current(now),
            }),
            Err(Admission::Wait(wait)) => Ok(Reservation::Needed {
                wait,
                limit: tracker.limit(),
                period: tracker.period(),
                current: tracker.current(now),
            }),
            Err(Admission::Never) => Err(self.unsatisfiable(&tracker, action)),
            // try_reserve commits whenever the weight fits; evaluate again
            Err(Admission::Clear) => Ok(Reservation::Needed {
                wait: Duration::from_millis(1),
                limit: tracker.limit(),
                period: tracker.period(),
                current: tracker.current(now),
            }),
        }
    }

    /// Undo a reservation made at `reserved_at`.
    pub(crate) fn release(&self, action: &ActionDescriptor, reserved_at: DateTime<Utc>) {
        if let Some(tracker) = self.existing_tracker(action) {
            tracker.release(reserved_at, action.weight);
        }
    }

    /// Usage versus limit for the tracker this action maps to.
    pub fn state(&self, action: &ActionDescriptor, now: DateTime<Utc>) -> String {
        if !self.applies_to(action) {
            return format!("{}: not applicable", self.name);
        }
        let key = self.key.key(action).unwrap_or_default();
        match self.existing_tracker(action) {
            Some(tracker) => format!(
                "{}: {}/{} per {:?} (key: {})",
                self.name,
                tracker.current(now),
                tracker.limit(),
                tracker.period(),
                key
            ),
            None => format!("{}: unused (key: {})", self.name, key),
        }
    }

    /// Drop trackers that have been idle for at least `ttl` and hold no
    /// usage. Returns the number removed.
    ///
    /// Idleness is checked with no map lock held. A tracker is only removed
    /// if, under the map lock, nothing else references it and it has recorded
    /// nothing since the check.
    pub fn evict_idle(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let candidates: Vec<(String, Arc<WindowTracker>)> = self
            .trackers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut removed = 0;
        for (key, tracker) in candidates {
            if !tracker.is_idle(now, ttl) {
                continue;
            }
            let commits = tracker.commits();
            let checked = Arc::as_ptr(&tracker);
            drop(tracker);

            let evicted = self.trackers.remove_if(&key, |_, current| {
                Arc::as_ptr(current) == checked
                    && Arc::strong_count(current) == 1
                    && current.commits() == commits
            });
            if evicted.is_some() {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(guard = %self.name, removed = removed, "Evicted idle trackers");
        }
        removed
    }

    fn existing_tracker(&self, action: &ActionDescriptor) -> Option<Arc<WindowTracker>> {
        let key = self.key.key(action)?;
        self.trackers.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    fn tracker_for(&self, action: &ActionDescriptor, now: DateTime<Utc>) -> Option<Arc<WindowTracker>> {
        if !self.filter.matches(action) {
            return None;
        }
        let key = self.key.key(action)?;

        let existing = self.trackers.get(&key).map(|entry| Arc::clone(entry.value()));
        if let Some(tracker) = existing {
            return Some(tracker);
        }

        let (limit, period, algorithm, initial_usage) = match self.source {
            LimitSource::Configured {
                limit,
                period,
                algorithm,
                initial_usage,
            } => (limit, period, algorithm, initial_usage),
            LimitSource::Declared => {
                let declared = action.endpoint_limit?;
                (declared.limit, declared.period, declared.algorithm, 0)
            }
        };

        let tracker = self
            .trackers
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(
                    guard = %self.name,
                    key = %key,
                    limit = limit,
                    period = ?period,
                    algorithm = %algorithm,
                    "Creating new window tracker"
                );
                let tracker = WindowTracker::new(limit, period, algorithm, now);
                let tracker = if initial_usage > 0 {
                    tracker.with_initial_usage(now, initial_usage)
                } else {
                    tracker
                };
                Arc::new(tracker)
            })
            .value()
            .clone();
        Some(tracker)
    }

    fn unsatisfiable(&self, tracker: &WindowTracker, action: &ActionDescriptor) -> GateError {
        GateError::Unsatisfiable {
            guard: self.name.clone(),
            limit: tracker.limit(),
            weight: action.weight,
        }
    }
}

/// Builder for [`Guard`].
#[derive(Debug, Clone)]
pub struct GuardBuilder {
    name: String,
    filters: Vec<Filter>,
    key: KeySelector,
    limit: Option<(u32, Duration)>,
    algorithm: WindowAlgorithm,
    initial_usage: u32,
    declared: bool,
    short_circuit: bool,
    exclude_from_total: bool,
}

impl GuardBuilder {
    /// Create a builder for a guard applying to every action with one shared
    /// tracker until configured otherwise.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filters: Vec::new(),
            key: KeySelector::Total,
            limit: None,
            algorithm: WindowAlgorithm::Fixed,
            initial_usage: 0,
            declared: false,
            short_circuit: false,
            exclude_from_total: false,
        }
    }

    /// Allow `limit` weight per `period`.
    pub fn limit(mut self, limit: u32, period: Duration) -> Self {
        self.limit = Some((limit, period));
        self
    }

    /// Set the windowing algorithm (default fixed).
    pub fn window(mut self, algorithm: WindowAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Assume this much usage in the first fixed window.
    pub fn initial_usage(mut self, usage: u32) -> Self {
        self.initial_usage = usage;
        self
    }

    /// Take limits from each action's declared endpoint limit.
    pub fn declared(mut self) -> Self {
        self.declared = true;
        self
    }

    /// Add a filter; all added filters must match.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Set the key selector (default total).
    pub fn key(mut self, key: KeySelector) -> Self {
        self.key = key;
        self
    }

    /// Stop evaluating later guards once this one applies.
    pub fn short_circuit(mut self, enabled: bool) -> Self {
        self.short_circuit = enabled;
        self
    }

    /// Skip `Total` guards for actions this guard applies to.
    pub fn exclude_from_total(mut self, enabled: bool) -> Self {
        self.exclude_from_total = enabled;
        self
    }

    /// Validate and build the guard.
    pub fn build(self) -> Result<Guard> {
        let invalid = |msg: &str| GateError::Config(format!("guard '{}': {}", self.name, msg));

        if self.name.is_empty() {
            return Err(GateError::Config("guard name must not be empty".to_string()));
        }

        let source = if self.declared {
            LimitSource::Declared
        } else {
            let (limit, period) = self.limit.ok_or_else(|| invalid("no limit configured"))?;
            if limit == 0 {
                return Err(invalid("limit must be greater than 0"));
            }
            if period.is_zero() {
                return Err(invalid("period must be greater than 0"));
            }
            if let WindowAlgorithm::Decay { rate_per_period } = self.algorithm {
                if !(rate_per_period > 0.0) || !rate_per_period.is_finite() {
                    return Err(invalid("decay rate must be a positive number"));
                }
            }
            LimitSource::Configured {
                limit,
                period,
                algorithm: self.algorithm,
                initial_usage: self.initial_usage,
            }
        };

        let mut filters = self.filters;
        if self.declared {
            filters.push(Filter::DeclaredLimit);
        }
        let filter = match filters.len() {
            0 => Filter::Always,
            1 => filters.remove(0),
            _ => Filter::All(filters),
        };

        Ok(Guard {
            name: self.name,
            filter,
            key: self.key,
            source,
            short_circuit: self.short_circuit,
            exclude_from_total: self.exclude_from_total,
            trackers: DashMap::new(),
        })
    }
}
