//! Declarative guard rules.
//!
//! Rules are the serializable form of a [`Guard`]. They are usually loaded as
//! part of a [`TollgateConfig`](crate::config::TollgateConfig) and turned into
//! guards once, when the client is constructed.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::action::{ActionKind, HttpMethod};
use super::guard::{Filter, Guard, KeySelector};
use super::tracker::WindowAlgorithm;
use crate::error::{GateError, Result};

/// Time unit of a rule's period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Millisecond,
    #[default]
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Length of `count` units.
    pub fn duration(&self, count: u64) -> Duration {
        match self {
            TimeUnit::Millisecond => Duration::from_millis(count),
            TimeUnit::Second => Duration::from_secs(count),
            TimeUnit::Minute => Duration::from_secs(count.saturating_mul(60)),
            TimeUnit::Hour => Duration::from_secs(count.saturating_mul(3_600)),
            TimeUnit::Day => Duration::from_secs(count.saturating_mul(86_400)),
        }
    }
}

/// Which tracker an action is counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRule {
    #[default]
    Total,
    Host,
    Endpoint,
    ApiKey,
    ApiKeyEndpoint,
}

impl From<KeyRule> for KeySelector {
    fn from(rule: KeyRule) -> Self {
        match rule {
            KeyRule::Total => KeySelector::Total,
            KeyRule::Host => KeySelector::Host,
            KeyRule::Endpoint => KeySelector::Endpoint,
            KeyRule::ApiKey => KeySelector::ApiKey,
            KeyRule::ApiKeyEndpoint => KeySelector::ApiKeyEndpoint,
        }
    }
}

/// Conditions an action must meet for the rule to apply. Every field that is
/// set must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Restrict to these action kinds
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<ActionKind>,
    /// Restrict to one host (case-insensitive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Restrict to exactly this path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Restrict to paths starting with this prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    /// Restrict to one HTTP method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<HttpMethod>,
    /// Only signed requests
    #[serde(default)]
    pub signed_only: bool,
}

impl FilterRule {
    fn to_filters(&self, guard: &str) -> Result<Vec<Filter>> {
        let mut filters = Vec::new();

        if !self.kinds.is_empty() {
            filters.push(Filter::Kinds(self.kinds.clone()));
        }
        if let Some(host) = &self.host {
            filters.push(Filter::Host(host.clone()));
        }
        match (&self.path, &self.path_prefix) {
            (Some(_), Some(_)) => {
                return Err(GateError::Config(format!(
                    "guard '{}': path and path_prefix are mutually exclusive",
                    guard
                )))
            }
            (Some(path), None) => filters.push(Filter::ExactPath {
                path: path.clone(),
                method: self.method,
            }),
            (None, Some(prefix)) => filters.push(Filter::PathPrefix {
                prefix: prefix.clone(),
                method: self.method,
            }),
            (None, None) => {
                if self.method.is_some() {
                    filters.push(Filter::PathPrefix {
                        prefix: String::new(),
                        method: self.method,
                    });
                }
            }
        }
        if self.signed_only {
            filters.push(Filter::SignedOnly);
        }
        Ok(filters)
    }
}

/// One limiting rule as written in a configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardRule {
    /// Unique name, reported in errors and events
    pub name: String,
    /// Weight allowed per period; not used for declared rules
    #[serde(default)]
    pub limit: Option<u32>,
    /// Period length in `unit`s
    #[serde(default = "default_period")]
    pub period: u64,
    #[serde(default)]
    pub unit: TimeUnit,
    #[serde(default = "default_window")]
    pub window: WindowAlgorithm,
    /// Usage assumed in the first fixed window
    #[serde(default)]
    pub initial_usage: u32,
    #[serde(default)]
    pub key: KeyRule,
    #[serde(default)]
    pub filter: FilterRule,
    /// Stop evaluating later guards once this one applies
    #[serde(default)]
    pub short_circuit: bool,
    /// Skip total guards for actions this one applies to
    #[serde(default)]
    pub exclude_from_total: bool,
    /// Take limits from each action's endpoint declaration
    #[serde(default)]
    pub declared: bool,
}

fn default_period() -> u64 {
    1
}

fn default_window() -> WindowAlgorithm {
    WindowAlgorithm::Fixed
}

impl GuardRule {
    /// The period as a duration.
    pub fn period_duration(&self) -> Duration {
        self.unit.duration(self.period)
    }

    /// Validate the rule and build its guard.
    pub fn build(&self) -> Result<Guard> {
        let mut builder = Guard::builder(self.name.clone())
            .window(self.window)
            .initial_usage(self.initial_usage)
            .key(self.key.into())
            .short_circuit(self.short_circuit)
            .exclude_from_total(self.exclude_from_total);

        if self.declared {
            builder = builder.declared();
        } else {
            let limit = self
                .limit
                .ok_or_else(|| GateError::Config(format!("guard '{}': missing limit", self.name)))?;
            builder = builder.limit(limit, self.period_duration());
        }

        for filter in self.filter.to_filters(&self.name)? {
            builder = builder.filter(filter);
        }
        builder.build()
    }
}

/// Build guards from rules, preserving order.
pub fn build_guards(rules: &[GuardRule]) -> Result<Vec<Guard>> {
    let mut seen = HashSet::new();
    let mut guards = Vec::with_capacity(rules.len());

    for rule in rules {
        if !seen.insert(rule.name.as_str()) {
            return Err(GateError::Config(format!("duplicate guard name '{}'", rule.name)));
        }
        guards.push(rule.build()?);
    }

    info!(guards = guards.len(), "Loaded guard rules");
    Ok(guards)
}
