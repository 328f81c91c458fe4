//! Rate limiting logic and state management.

mod action;
mod clock;
mod gate;
mod guard;
mod retry_after;
mod rules;
mod tracker;

pub use action::{ActionDescriptor, ActionKind, ApiKeyId, EndpointLimit, HttpMethod};
pub use clock::{Clock, ManualClock, Sleeper, SystemClock, TokioSleeper};
pub use gate::{
    ApplyOutcome, CheckOutcome, GateBuilder, GuardSnapshot, LimitBehaviour, ProcessOutcome, RateLimitEvent,
    RateLimitGate,
};
pub use guard::{Filter, Guard, GuardBuilder, KeySelector, LimitCheck, LimitSource, RateLimitState};
pub use retry_after::{RetryAfterGuard, RETRY_AFTER_GUARD};
pub use rules::{build_guards, FilterRule, GuardRule, KeyRule, TimeUnit};
pub use tracker::{Admission, WindowAlgorithm, WindowTracker};
