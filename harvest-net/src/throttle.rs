//! Per-service throttle state
//!
//! All callers of one service share a single [`RateLimiterState`] behind a
//! [`ThrottleStore`]. Reservations are atomic: two concurrent callers can
//! never receive the same slot. The store is a trait so the state can live in
//! shared storage when several processes harvest through the same identity.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use harvest_core::{Clock, RateLimiterState};

/// Shared throttle state, keyed by service name
pub trait ThrottleStore: Send + Sync {
    /// Atomically reserve the next dispatch slot for `service`.
    ///
    /// Returns `max(now, next_allowed_at, cooldown_until)` and advances
    /// `next_allowed_at` to `slot + min_interval`.
    fn reserve(&self, service: &str, now: DateTime<Utc>, min_interval: Duration) -> DateTime<Utc>;

    /// Record a completed request: `next_allowed_at >= now + min_interval`
    fn release(&self, service: &str, now: DateTime<Utc>, min_interval: Duration);

    /// Push the service-wide cooldown out to at least `until`
    fn enter_cooldown(&self, service: &str, until: DateTime<Utc>);

    /// Current state of `service`
    fn snapshot(&self, service: &str) -> RateLimiterState;
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// In-process throttle store
#[derive(Debug, Default)]
pub struct LocalThrottleStore {
    states: Mutex<HashMap<String, RateLimiterState>>,
}

impl LocalThrottleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ThrottleStore for LocalThrottleStore {
    fn reserve(&self, service: &str, now: DateTime<Utc>, min_interval: Duration) -> DateTime<Utc> {
        let mut states = self.states.lock();
        let state = states.entry(service.to_string()).or_default();
        let slot = state.earliest_slot(now);
        state.next_allowed_at = Some(slot + chrono_duration(min_interval));
        slot
    }

    fn release(&self, service: &str, now: DateTime<Utc>, min_interval: Duration) {
        let mut states = self.states.lock();
        let state = states.entry(service.to_string()).or_default();
        let floor = now + chrono_duration(min_interval);
        state.next_allowed_at = Some(state.next_allowed_at.map_or(floor, |next| next.max(floor)));
    }

    fn enter_cooldown(&self, service: &str, until: DateTime<Utc>) {
        let mut states = self.states.lock();
        let state = states.entry(service.to_string()).or_default();
        state.cooldown_until = Some(state.cooldown_until.map_or(until, |current| current.max(until)));
    }

    fn snapshot(&self, service: &str) -> RateLimiterState {
        self.states.lock().get(service).copied().unwrap_or_default()
    }
}

/// Wall clock that advances with tokio's clock.
///
/// Under `#[tokio::test(start_paused = true)]` this clock jumps forward with
/// auto-advanced sleeps, so throttle and cooldown timing can be asserted
/// without real waiting.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin_wall: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(origin_wall: DateTime<Utc>) -> Self {
        Self {
            origin_wall,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        self.origin_wall + chrono_duration(self.origin.elapsed())
    }
}

/// Sleep until a wall-clock instant read from `clock`
pub(crate) async fn sleep_until(clock: &dyn Clock, at: DateTime<Utc>) {
    let now = clock.now();
    if at > now {
        if let Ok(wait) = (at - now).to_std() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservations_are_spaced() {
        let store = LocalThrottleStore::new();
        let now = Utc::now();
        let interval = Duration::from_secs(8);

        let first = store.reserve("scholar_profile", now, interval);
        let second = store.reserve("scholar_profile", now, interval);
        let third = store.reserve("scholar_profile", now, interval);

        assert_eq!(first, now);
        assert_eq!(second - first, chrono::Duration::seconds(8));
        assert_eq!(third - second, chrono::Duration::seconds(8));
    }

    #[test]
    fn test_services_are_independent() {
        let store = LocalThrottleStore::new();
        let now = Utc::now();
        store.reserve("crossref", now, Duration::from_secs(60));
        assert_eq!(store.reserve("arxiv", now, Duration::from_secs(60)), now);
    }

    #[test]
    fn test_cooldown_pushes_slot() {
        let store = LocalThrottleStore::new();
        let now = Utc::now();
        let until = now + chrono::Duration::minutes(30);
        store.enter_cooldown("scholar_profile", until);
        // a shorter cooldown never shortens an existing one
        store.enter_cooldown("scholar_profile", now + chrono::Duration::minutes(1));

        assert!(store.snapshot("scholar_profile").is_cooling_down(now));
        assert_eq!(store.reserve("scholar_profile", now, Duration::from_secs(1)), until);
    }

    #[test]
    fn test_release_only_moves_forward() {
        let store = LocalThrottleStore::new();
        let now = Utc::now();
        store.reserve("crossref", now, Duration::from_secs(100));
        store.release("crossref", now, Duration::from_secs(1));
        let state = store.snapshot("crossref");
        assert_eq!(state.next_allowed_at, Some(now + chrono::Duration::seconds(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        let before = clock.now();
        tokio::time::sleep(Duration::from_secs(90)).await;
        let elapsed = clock.now() - before;
        assert!(elapsed >= chrono::Duration::seconds(90));
        assert!(elapsed < chrono::Duration::seconds(91));
    }
}
