//! Windowed usage trackers.
//!
//! A [`WindowTracker`] counts the weight consumed under one limiting key and
//! answers how long a caller must wait before more weight fits. Every
//! tracker owns its own lock, so trackers for unrelated keys never contend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Windowing algorithm used by a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowAlgorithm {
    /// Usage resets at clock-aligned period boundaries
    Fixed,
    /// Usage is the weight consumed within the trailing period
    Sliding,
    /// Like `Fixed`, but each window starts at its first use
    FixedAfterFirst,
    /// Usage drains continuously by `rate_per_period` every period
    Decay { rate_per_period: f64 },
}

impl std::fmt::Display for WindowAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowAlgorithm::Fixed => f.write_str("fixed"),
            WindowAlgorithm::Sliding => f.write_str("sliding"),
            WindowAlgorithm::FixedAfterFirst => f.write_str("fixed-after-first"),
            WindowAlgorithm::Decay { rate_per_period } => write!(f, "decay({})", rate_per_period),
        }
    }
}

/// Outcome of asking a tracker whether some weight fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The weight fits now
    Clear,
    /// The weight fits after waiting this long
    Wait(Duration),
    /// The weight exceeds the limit and can never fit
    Never,
}

#[derive(Debug)]
enum Window {
    Fixed { window_id: Option<i64>, usage: u64 },
    Sliding { entries: VecDeque<(i64, u32)> },
    FixedAfterFirst { start: Option<i64>, usage: u64 },
    Decay { level: f64, last_update: i64 },
}

#[derive(Debug)]
struct TrackerState {
    window: Window,
    /// Latest timestamp recorded; never moves backward
    last_used: i64,
}

/// Usage counter for a single limiting key.
///
/// All timestamps are passed in by the caller; the tracker never reads a
/// clock itself. Callers read their clocks before taking the tracker lock,
/// so timestamps may arrive slightly out of order; each operation treats a
/// timestamp older than the latest recorded one as that latest one.
#[derive(Debug)]
pub struct WindowTracker {
    limit: u32,
    period: Duration,
    period_ms: i64,
    algorithm: WindowAlgorithm,
    state: Mutex<TrackerState>,
    commits: AtomicU64,
}

impl WindowTracker {
    /// Create a tracker with no recorded usage.
    pub fn new(limit: u32, period: Duration, algorithm: WindowAlgorithm, now: DateTime<Utc>) -> Self {
        let now = now.timestamp_millis();
        let window = match algorithm {
            WindowAlgorithm::Fixed => Window::Fixed {
                window_id: None,
                usage: 0,
            },
            WindowAlgorithm::Sliding => Window::Sliding {
                entries: VecDeque::new(),
            },
            WindowAlgorithm::FixedAfterFirst => Window::FixedAfterFirst {
                start: None,
                usage: 0,
            },
            WindowAlgorithm::Decay { .. } => Window::Decay {
                level: 0.0,
                last_update: now,
            },
        };

        Self {
            limit,
            period,
            period_ms: (period.as_millis() as i64).max(1),
            algorithm,
            state: Mutex::new(TrackerState {
                window,
                last_used: now,
            }),
            commits: AtomicU64::new(0),
        }
    }

    /// Seed the current fixed window with usage assumed to have happened
    /// before this process started. Only affects `Fixed` trackers.
    pub fn with_initial_usage(self, now: DateTime<Utc>, usage: u32) -> Self {
        {
            let now = now.timestamp_millis();
            let period_ms = self.period_ms;
            let mut state = self.state.lock();
            if let Window::Fixed {
                window_id,
                usage: current,
            } = &mut state.window
            {
                *window_id = Some(now.div_euclid(period_ms));
                *current = usage as u64;
            }
        }
        self
    }

    /// The configured limit.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// The configured period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// The windowing algorithm.
    pub fn algorithm(&self) -> WindowAlgorithm {
        self.algorithm
    }

    /// Usage counted against the limit at `now`.
    pub fn current(&self, now: DateTime<Utc>) -> u64 {
        let state = self.state.lock();
        let now = Self::effective(&state, now.timestamp_millis());
        self.usage_at(&state.window, now)
    }

    /// Whether `weight` fits at `now`, and if not how long until it does.
    ///
    /// Does not modify the tracker.
    pub fn wait_time(&self, now: DateTime<Utc>, weight: u32) -> Admission {
        let state = self.state.lock();
        self.admission(&state, now.timestamp_millis(), weight)
    }

    /// Record that `weight` was consumed at `now`.
    ///
    /// A timestamp older than the latest one recorded is counted at the latest
    /// one, so windows never move backward.
    pub fn apply_weight(&self, now: DateTime<Utc>, weight: u32) {
        let mut state = self.state.lock();
        let now = Self::effective(&state, now.timestamp_millis());
        self.commit(&mut state, now, weight);
    }

    /// Check and commit under one lock: the weight is recorded only when it
    /// fits right now.
    ///
    /// On success returns the time the weight was recorded at, which is what
    /// [`release`](Self::release) expects.
    pub fn try_reserve(&self, now: DateTime<Utc>, weight: u32) -> Result<DateTime<Utc>, Admission> {
        let mut state = self.state.lock();
        let requested = now.timestamp_millis();
        match self.admission(&state, requested, weight) {
            Admission::Clear => {
                let at = Self::effective(&state, requested);
                self.commit(&mut state, at, weight);
                Ok(DateTime::from_timestamp_millis(at).unwrap_or(now))
            }
            refused => Err(refused),
        }
    }

    /// Undo a reservation recorded at `reserved_at`.
    ///
    /// Usage that has already left the window is not touched.
    pub fn release(&self, reserved_at: DateTime<Utc>, weight: u32) {
        let mut state = self.state.lock();
        let at = reserved_at.timestamp_millis();
        let period_ms = self.period_ms;
        match &mut state.window {
            Window::Fixed { window_id, usage } => {
                if *window_id == Some(at.div_euclid(period_ms)) {
                    *usage = usage.saturating_sub(weight as u64);
                }
            }
            Window::Sliding { entries } => {
                if let Some(pos) = entries.iter().rposition(|&(ts, w)| ts == at && w == weight) {
                    entries.remove(pos);
                }
            }
            Window::FixedAfterFirst { start, usage } => {
                if start.is_some_and(|s| at >= s && at < s + period_ms) {
                    *usage = usage.saturating_sub(weight as u64);
                    if *usage == 0 && *start == Some(at) {
                        *start = None;
                    }
                }
            }
            Window::Decay { level, last_update } => {
                // Only the part of the weight that has not drained yet is
                // still in the level.
                let drained = (*last_update - at).max(0) as f64 * self.decay_rate() / period_ms as f64;
                let remaining = (weight as f64 - drained).max(0.0);
                *level = (*level - remaining).max(0.0);
            }
        }
    }

    /// Whether the tracker has been unused for `ttl` and holds no usage.
    pub fn is_idle(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let state = self.state.lock();
        let now = Self::effective(&state, now.timestamp_millis());
        let idle_for = now - state.last_used;
        idle_for >= ttl.as_millis() as i64 && self.usage_at(&state.window, now) == 0
    }

    /// Number of commits so far. Changes whenever usage is recorded.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// `now` clamped to the latest timestamp this tracker has recorded.
    fn effective(state: &TrackerState, now: i64) -> i64 {
        now.max(state.last_used)
    }

    fn admission(&self, state: &TrackerState, requested: i64, weight: u32) -> Admission {
        if weight > self.limit {
            return Admission::Never;
        }

        let window = &state.window;
        let now = Self::effective(state, requested);
        let limit = self.limit as u64;
        let weight_u64 = weight as u64;
        let wait_ms = match window {
            Window::Fixed { .. } | Window::FixedAfterFirst { .. } => {
                let usage = self.usage_at(window, now);
                if usage + weight_u64 <= limit {
                    return Admission::Clear;
                }
                self.window_end(window, now) - now
            }
            Window::Sliding { entries } => {
                let cutoff = now - self.period_ms;
                let usage: u64 = entries
                    .iter()
                    .filter(|(ts, _)| *ts > cutoff)
                    .map(|(_, w)| *w as u64)
                    .sum();
                if usage + weight_u64 <= limit {
                    return Admission::Clear;
                }

                // Wait until enough of the oldest entries have aged out.
                let excess = usage + weight_u64 - limit;
                let mut freed = 0u64;
                let mut wait = 0;
                for (ts, w) in entries.iter().filter(|(ts, _)| *ts > cutoff) {
                    freed += *w as u64;
                    wait = ts + self.period_ms - now;
                    if freed >= excess {
                        break;
                    }
                }
                wait
            }
            Window::Decay { level, last_update } => {
                let level = self.decayed_level(*level, *last_update, now);
                let excess = level + weight as f64 - self.limit as f64;
                if excess <= 0.0 {
                    return Admission::Clear;
                }
                let rate = self.decay_rate();
                if rate <= 0.0 {
                    return Admission::Never;
                }
                (excess * self.period_ms as f64 / rate).ceil() as i64
            }
        };

        // A caller whose clock lags the tracker also waits out the lag.
        let wait_ms = wait_ms + (now - requested);
        Admission::Wait(Duration::from_millis(wait_ms.max(0) as u64))
    }

    fn commit(&self, state: &mut TrackerState, now: i64, weight: u32) {
        state.last_used = state.last_used.max(now);
        self.commits.fetch_add(1, Ordering::SeqCst);
        let period_ms = self.period_ms;
        match &mut state.window {
            Window::Fixed { window_id, usage } => {
                let id = now.div_euclid(period_ms);
                if *window_id != Some(id) {
                    *window_id = Some(id);
                    *usage = 0;
                }
                *usage += weight as u64;
            }
            Window::Sliding { entries } => {
                let cutoff = now - period_ms;
                entries.retain(|(ts, _)| *ts > cutoff);
                entries.push_back((now, weight));
            }
            Window::FixedAfterFirst { start, usage } => {
                let expired = start.map_or(true, |s| now >= s + period_ms);
                if expired {
                    *start = Some(now);
                    *usage = 0;
                }
                *usage += weight as u64;
            }
            Window::Decay { level, last_update } => {
                let drained = self.decayed_level(*level, *last_update, now);
                *level = drained + weight as f64;
                *last_update = (*last_update).max(now);
            }
        }
    }

    fn usage_at(&self, window: &Window, now: i64) -> u64 {
        match window {
            Window::Fixed { window_id, usage } => {
                if *window_id == Some(now.div_euclid(self.period_ms)) {
                    *usage
                } else {
                    0
                }
            }
            Window::Sliding { entries } => {
                let cutoff = now - self.period_ms;
                entries
                    .iter()
                    .filter(|(ts, _)| *ts > cutoff)
                    .map(|(_, w)| *w as u64)
                    .sum()
            }
            Window::FixedAfterFirst { start, usage } => match start {
                Some(s) if now < s + self.period_ms => *usage,
                _ => 0,
            },
            Window::Decay { level, last_update } => {
                self.decayed_level(*level, *last_update, now).ceil() as u64
            }
        }
    }

    /// End of the window containing `now`, in epoch milliseconds.
    fn window_end(&self, window: &Window, now: i64) -> i64 {
        match window {
            Window::FixedAfterFirst { start: Some(s), .. } if now < s + self.period_ms => {
                s + self.period_ms
            }
            Window::FixedAfterFirst { .. } => now,
            _ => (now.div_euclid(self.period_ms) + 1) * self.period_ms,
        }
    }

    fn decay_rate(&self) -> f64 {
        match self.algorithm {
            WindowAlgorithm::Decay { rate_per_period } => rate_per_period,
            _ => 0.0,
        }
    }

    fn decayed_level(&self, level: f64, last_update: i64, now: i64) -> f64 {
        let elapsed = (now - last_update).max(0) as f64;
        (level - elapsed * self.decay_rate() / self.period_ms as f64).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use std::sync::Arc;

    /// 2024-01-01T00:00:00Z, aligned to every period used below.
    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_704_067_200, 0).unwrap()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        t0() + TimeDelta::milliseconds(ms)
    }

    #[test]
    fn test_fixed_window_fill_and_reset() {
        let tracker = WindowTracker::new(10, Duration::from_secs(1), WindowAlgorithm::Fixed, t0());

        for _ in 0..5 {
            tracker.apply_weight(t0(), 1);
        }
        assert_eq!(tracker.current(t0()), 5);
        assert_eq!(tracker.wait_time(t0(), 1), Admission::Clear);

        for _ in 0..5 {
            tracker.apply_weight(t0(), 1);
        }
        assert_eq!(tracker.current(t0()), 10);
        assert_eq!(
            tracker.wait_time(at(250), 1),
            Admission::Wait(Duration::from_millis(750))
        );

        assert_eq!(tracker.current(at(1000)), 0);
        assert_eq!(tracker.wait_time(at(1000), 1), Admission::Clear);
    }

    #[test]
    fn test_fixed_window_initial_usage() {
        let tracker = WindowTracker::new(10, Duration::from_secs(1), WindowAlgorithm::Fixed, t0())
            .with_initial_usage(t0(), 8);

        assert_eq!(tracker.current(t0()), 8);
        assert_eq!(tracker.wait_time(t0(), 2), Admission::Clear);
        assert!(matches!(tracker.wait_time(t0(), 3), Admission::Wait(_)));
        assert_eq!(tracker.current(at(1000)), 0);
    }

    #[test]
    fn test_fixed_window_bound_when_honoring_waits() {
        let tracker = WindowTracker::new(7, Duration::from_secs(1), WindowAlgorithm::Fixed, t0());
        let mut now = 0;
        let mut per_window = std::collections::HashMap::new();

        for i in 0..200 {
            let weight = (i % 3) + 1;
            match tracker.wait_time(at(now), weight) {
                Admission::Clear => {
                    tracker.apply_weight(at(now), weight);
                    *per_window.entry(now.div_euclid(1000)).or_insert(0u32) += weight;
                    now += 37;
                }
                Admission::Wait(wait) => now += wait.as_millis() as i64,
                Admission::Never => panic!("weight {} should fit", weight),
            }
        }

        assert!(per_window.values().all(|total| *total <= 7));
    }

    #[test]
    fn test_sliding_window_boundary_excluded() {
        let tracker = WindowTracker::new(3, Duration::from_secs(1), WindowAlgorithm::Sliding, t0());

        tracker.apply_weight(at(0), 1);
        tracker.apply_weight(at(400), 2);
        assert_eq!(tracker.current(at(999)), 3);

        // The entry at 0 no longer counts exactly one period later.
        assert_eq!(tracker.current(at(1000)), 2);
        assert_eq!(tracker.current(at(1400)), 0);
    }

    #[test]
    fn test_sliding_window_wait_until_enough_ages_out() {
        let tracker = WindowTracker::new(3, Duration::from_secs(1), WindowAlgorithm::Sliding, t0());

        tracker.apply_weight(at(0), 1);
        tracker.apply_weight(at(200), 1);
        tracker.apply_weight(at(500), 1);

        assert_eq!(
            tracker.wait_time(at(600), 1),
            Admission::Wait(Duration::from_millis(400))
        );
        assert_eq!(
            tracker.wait_time(at(600), 2),
            Admission::Wait(Duration::from_millis(600))
        );
        assert_eq!(tracker.wait_time(at(1000), 1), Admission::Clear);
    }

    #[test]
    fn test_fixed_after_first_anchors_on_first_use() {
        let tracker =
            WindowTracker::new(2, Duration::from_secs(10), WindowAlgorithm::FixedAfterFirst, t0());

        tracker.apply_weight(at(3_000), 1);
        tracker.apply_weight(at(4_000), 1);
        assert_eq!(tracker.current(at(12_000)), 2);
        assert_eq!(
            tracker.wait_time(at(12_000), 1),
            Admission::Wait(Duration::from_millis(1_000))
        );

        // Window ends 10s after the first use, not on a clock boundary.
        assert_eq!(tracker.current(at(13_000)), 0);
        tracker.apply_weight(at(15_000), 1);
        assert_eq!(tracker.current(at(24_999)), 1);
        assert_eq!(tracker.current(at(25_000)), 0);
    }

    #[test]
    fn test_decay_drains_continuously() {
        let algorithm = WindowAlgorithm::Decay {
            rate_per_period: 5.0,
        };
        let tracker = WindowTracker::new(10, Duration::from_secs(1), algorithm, t0());

        tracker.apply_weight(at(0), 10);
        assert_eq!(tracker.current(at(0)), 10);

        let mut previous = tracker.current(at(0));
        for step in 1..=4 {
            let current = tracker.current(at(step * 500));
            assert!(current < previous);
            previous = current;
        }
        assert_eq!(tracker.current(at(2_000)), 0);
        assert_eq!(tracker.current(at(60_000)), 0);
    }

    #[test]
    fn test_decay_wait_time() {
        let algorithm = WindowAlgorithm::Decay {
            rate_per_period: 2.0,
        };
        let tracker = WindowTracker::new(4, Duration::from_secs(1), algorithm, t0());

        tracker.apply_weight(at(0), 4);
        // One unit drains in 500ms at 2 per second.
        assert_eq!(
            tracker.wait_time(at(0), 1),
            Admission::Wait(Duration::from_millis(500))
        );
        assert_eq!(tracker.wait_time(at(500), 1), Admission::Clear);

        tracker.apply_weight(at(500), 1);
        assert!(tracker.current(at(500)) <= 4);
    }

    #[test]
    fn test_weight_over_limit_is_never() {
        for algorithm in [
            WindowAlgorithm::Fixed,
            WindowAlgorithm::Sliding,
            WindowAlgorithm::FixedAfterFirst,
            WindowAlgorithm::Decay {
                rate_per_period: 1.0,
            },
        ] {
            let tracker = WindowTracker::new(1, Duration::from_secs(10), algorithm, t0());
            assert_eq!(tracker.wait_time(t0(), 2), Admission::Never, "{}", algorithm);
        }
    }

    #[test]
    fn test_wait_time_does_not_mutate() {
        let tracker = WindowTracker::new(5, Duration::from_secs(1), WindowAlgorithm::Sliding, t0());
        tracker.apply_weight(t0(), 3);

        for _ in 0..10 {
            let _ = tracker.wait_time(t0(), 4);
        }
        assert_eq!(tracker.current(t0()), 3);
    }

    #[test]
    fn test_reserve_and_release() {
        let tracker = WindowTracker::new(2, Duration::from_secs(1), WindowAlgorithm::Sliding, t0());

        assert_eq!(tracker.try_reserve(t0(), 2), Ok(t0()));
        assert_eq!(tracker.current(t0()), 2);
        assert!(matches!(tracker.try_reserve(t0(), 1), Err(Admission::Wait(_))));
        assert_eq!(tracker.current(t0()), 2);

        tracker.release(t0(), 2);
        assert_eq!(tracker.current(t0()), 0);
    }

    #[test]
    fn test_release_fixed_after_first_clears_anchor() {
        let tracker =
            WindowTracker::new(2, Duration::from_secs(10), WindowAlgorithm::FixedAfterFirst, t0());

        assert_eq!(tracker.try_reserve(at(1_000), 1), Ok(at(1_000)));
        tracker.release(at(1_000), 1);

        // The next use starts a fresh window.
        tracker.apply_weight(at(5_000), 1);
        assert_eq!(tracker.current(at(14_000)), 1);
    }

    #[test]
    fn test_fixed_late_commit_counts_in_latest_window() {
        let tracker = WindowTracker::new(1, Duration::from_secs(1), WindowAlgorithm::Fixed, t0());

        assert_eq!(tracker.try_reserve(at(1_000), 1), Ok(at(1_000)));
        // A caller that read its clock just before the boundary must not
        // reopen the previous window.
        assert_eq!(
            tracker.try_reserve(at(999), 1),
            Err(Admission::Wait(Duration::from_millis(1_001)))
        );
        assert_eq!(
            tracker.try_reserve(at(1_001), 1),
            Err(Admission::Wait(Duration::from_millis(999)))
        );
        assert_eq!(tracker.current(at(1_001)), 1);

        tracker.apply_weight(at(999), 1);
        assert_eq!(tracker.current(at(1_001)), 2);
        assert_eq!(tracker.current(at(999)), 2);
        assert_eq!(tracker.current(at(2_000)), 0);
    }

    #[test]
    fn test_fixed_release_after_window_moved_on() {
        let tracker = WindowTracker::new(2, Duration::from_secs(1), WindowAlgorithm::Fixed, t0());

        let reserved_at = tracker.try_reserve(at(900), 1).unwrap();
        tracker.apply_weight(at(1_100), 1);
        tracker.release(reserved_at, 1);

        assert_eq!(tracker.current(at(1_100)), 1);
    }

    #[test]
    fn test_fixed_after_first_late_commit_keeps_anchor() {
        let tracker =
            WindowTracker::new(2, Duration::from_secs(10), WindowAlgorithm::FixedAfterFirst, t0());

        tracker.apply_weight(at(5_000), 1);
        tracker.apply_weight(at(4_000), 1);

        assert_eq!(tracker.current(at(14_999)), 2);
        assert_eq!(
            tracker.wait_time(at(4_000), 1),
            Admission::Wait(Duration::from_millis(11_000))
        );
        assert_eq!(tracker.current(at(15_000)), 0);
    }

    #[test]
    fn test_sliding_late_commit_does_not_expire_early() {
        let tracker = WindowTracker::new(2, Duration::from_secs(1), WindowAlgorithm::Sliding, t0());

        tracker.apply_weight(at(1_000), 1);
        let reserved_at = tracker.try_reserve(at(500), 1).unwrap();
        assert_eq!(reserved_at, at(1_000));

        assert_eq!(tracker.current(at(1_600)), 2);
        assert!(matches!(tracker.wait_time(at(1_600), 1), Admission::Wait(_)));

        tracker.release(reserved_at, 1);
        assert_eq!(tracker.current(at(1_600)), 1);
    }

    #[test]
    fn test_decay_late_commit_and_release_do_not_drain_twice() {
        let algorithm = WindowAlgorithm::Decay {
            rate_per_period: 1.0,
        };
        let tracker = WindowTracker::new(10, Duration::from_secs(1), algorithm, t0());

        tracker.apply_weight(at(0), 10);
        tracker.apply_weight(at(5_000), 1);
        assert_eq!(tracker.current(at(5_000)), 6);

        tracker.release(at(0), 0);
        assert_eq!(tracker.current(at(5_000)), 6);

        tracker.apply_weight(at(2_000), 1);
        assert_eq!(tracker.current(at(5_000)), 7);
    }

    #[test]
    fn test_decay_release_removes_only_undrained_weight() {
        let algorithm = WindowAlgorithm::Decay {
            rate_per_period: 1.0,
        };
        let tracker = WindowTracker::new(10, Duration::from_secs(1), algorithm, t0());

        let reserved_at = tracker.try_reserve(at(0), 5).unwrap();
        tracker.apply_weight(at(1_000), 1);
        assert_eq!(tracker.current(at(1_000)), 5);

        tracker.release(reserved_at, 5);
        assert_eq!(tracker.current(at(1_000)), 1);
    }

    #[test]
    fn test_commit_counter() {
        let tracker = WindowTracker::new(5, Duration::from_secs(1), WindowAlgorithm::Fixed, t0());
        assert_eq!(tracker.commits(), 0);

        tracker.apply_weight(t0(), 1);
        let _ = tracker.try_reserve(t0(), 1);
        let _ = tracker.wait_time(t0(), 1);
        assert_eq!(tracker.commits(), 2);
    }

    #[test]
    fn test_idle_detection() {
        let tracker = WindowTracker::new(5, Duration::from_secs(1), WindowAlgorithm::Fixed, t0());
        tracker.apply_weight(t0(), 1);

        assert!(!tracker.is_idle(at(500), Duration::from_millis(100)));
        assert!(!tracker.is_idle(at(1_500), Duration::from_secs(60)));
        assert!(tracker.is_idle(at(1_500), Duration::from_secs(1)));
    }

    #[test]
    fn test_concurrent_reservations_respect_limit() {
        let tracker = Arc::new(WindowTracker::new(
            100,
            Duration::from_secs(60),
            WindowAlgorithm::Fixed,
            t0(),
        ));
        let mut handles = vec![];

        for _ in 0..8 {
            let tracker = Arc::clone(&tracker);
            handles.push(std::thread::spawn(move || {
                let mut admitted = 0;
                for _ in 0..50 {
                    if tracker.try_reserve(t0(), 1).is_ok() {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 100);
        assert_eq!(tracker.current(t0()), 100);
    }
}
