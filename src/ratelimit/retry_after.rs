//! Server-imposed back-off.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::guard::LimitCheck;

/// Name reported for waits caused by a Retry-After back-off.
pub const RETRY_AFTER_GUARD: &str = "RetryAfter";

/// Blocks every action until a server-provided deadline passes.
///
/// Registered by the client after a 429 or a `Retry-After` header. It has no
/// key dimension and expires by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAfterGuard {
    deadline: DateTime<Utc>,
}

impl RetryAfterGuard {
    /// Create a guard blocking until `deadline`.
    pub fn new(deadline: DateTime<Utc>) -> Self {
        Self { deadline }
    }

    /// The time after which actions are allowed again.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// Remaining back-off, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.deadline - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// `Needed` with the remaining time until the deadline, then `NotNeeded`.
    pub fn check(&self, now: DateTime<Utc>) -> LimitCheck {
        if self.is_expired(now) {
            return LimitCheck::NotNeeded;
        }
        let wait = self.remaining(now);
        LimitCheck::Needed {
            wait,
            limit: 0,
            period: wait,
            current: 0,
        }
    }

    pub fn description(&self) -> String {
        format!("{}: blocked until {}", RETRY_AFTER_GUARD, self.deadline.to_rfc3339())
    }
}
