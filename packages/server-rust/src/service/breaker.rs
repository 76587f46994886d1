//! Per-instance circuit breakers.
//!
//! A breaker is fed only by call outcomes, never by health probes:
//!
//! - `Closed -> Open` when `failure_threshold` consecutive failures land
//!   within `failure_window_ms` of the first failure of the streak.
//! - `Open -> HalfOpen` once the cool-down has elapsed. The transition is
//!   applied lazily, the next time anyone looks at the breaker.
//! - `HalfOpen` admits one trial call. Success closes the circuit and
//!   forgets previous trips; failure reopens it with a longer cool-down.
//!
//! The cool-down after trip `n` is `base_cooldown_ms * 2^(n-1)`, capped at
//! `max_cooldown_ms`.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use portalfed_core::ClockSource;
use serde::Serialize;
use tracing::{info, warn};

use super::config::BreakerConfig;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub instance_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub trips: u32,
    pub last_transition_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_until_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    streak_started_ms: u64,
    /// Consecutive trips without an intervening close.
    trips: u32,
    last_transition_ms: u64,
    open_until_ms: u64,
    trial_in_flight: bool,
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

pub struct CircuitBreaker {
    instance_id: String,
    config: BreakerConfig,
    clock: Arc<dyn ClockSource>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(
        instance_id: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let now = clock.now();
        Self {
            instance_id: instance_id.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                streak_started_ms: now,
                trips: 0,
                last_transition_ms: now,
                open_until_ms: 0,
                trial_in_flight: false,
            }),
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Current state, after applying any due `Open -> HalfOpen` transition.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, self.clock.now());
        inner.state
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, self.clock.now());
        CircuitSnapshot {
            instance_id: self.instance_id.clone(),
            state: inner.state,
            consecutive_failures: inner.failures,
            trips: inner.trips,
            last_transition_ms: inner.last_transition_ms,
            open_until_ms: (inner.state == CircuitState::Open).then_some(inner.open_until_ms),
        }
    }

    /// Asks permission to send one call. `None` means the circuit is open,
    /// or half-open with its trial already taken.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>) -> Option<BreakerPermit> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, self.clock.now());
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => return None,
            CircuitState::HalfOpen if inner.trial_in_flight => return None,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                true
            }
        };
        Some(BreakerPermit {
            breaker: Arc::clone(self),
            trial,
            reported: false,
        })
    }

    fn refresh(&self, inner: &mut Inner, now: u64) {
        if inner.state == CircuitState::Open && now >= inner.open_until_ms {
            inner.trial_in_flight = false;
            self.transition(inner, CircuitState::HalfOpen, now);
            info!(instance_id = %self.instance_id, "circuit half-open, admitting a trial call");
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: u64) {
        inner.state = to;
        inner.last_transition_ms = now;
        metrics::counter!(
            "portalfed_breaker_transitions_total",
            "instance" => self.instance_id.clone(),
            "to" => to.as_str()
        )
        .increment(1);
    }

    fn cooldown_ms(&self, trips: u32) -> u64 {
        let exponent = trips.saturating_sub(1).min(32);
        self.config
            .base_cooldown_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.max_cooldown_ms)
    }

    fn trip(&self, inner: &mut Inner, now: u64) {
        inner.trips = inner.trips.saturating_add(1);
        let cooldown = self.cooldown_ms(inner.trips);
        inner.open_until_ms = now.saturating_add(cooldown);
        inner.failures = 0;
        inner.trial_in_flight = false;
        self.transition(inner, CircuitState::Open, now);
        warn!(
            instance_id = %self.instance_id,
            trips = inner.trips,
            cooldown_ms = cooldown,
            "circuit opened"
        );
    }

    fn on_success(&self, trial: bool) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen if trial => {
                inner.failures = 0;
                inner.trips = 0;
                inner.trial_in_flight = false;
                self.transition(&mut inner, CircuitState::Closed, now);
                info!(instance_id = %self.instance_id, "circuit closed after successful trial");
            }
            // Late answers from calls admitted before the circuit opened.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                let stale =
                    now.saturating_sub(inner.streak_started_ms) > self.config.failure_window_ms;
                if inner.failures == 0 || stale {
                    inner.failures = 1;
                    inner.streak_started_ms = now;
                } else {
                    inner.failures += 1;
                }
                if inner.failures >= self.config.failure_threshold {
                    self.trip(&mut inner, now);
                }
            }
            CircuitState::HalfOpen if trial => self.trip(&mut inner, now),
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }
}

// ---------------------------------------------------------------------------
// BreakerPermit
// ---------------------------------------------------------------------------

/// Permission for one call. Report the outcome with [`BreakerPermit::success`]
/// or [`BreakerPermit::failure`]; dropping it unreported frees a half-open
/// trial slot without counting as either.
#[must_use = "report the call outcome through the permit"]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    reported: bool,
}

impl BreakerPermit {
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.reported = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.trial && !self.reported {
            self.breaker.release_trial();
        }
    }
}

// ---------------------------------------------------------------------------
// BreakerBoard
// ---------------------------------------------------------------------------

/// One breaker per instance, created on first use.
pub struct BreakerBoard {
    config: BreakerConfig,
    clock: Arc<dyn ClockSource>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerBoard {
    #[must_use]
    pub fn new(config: BreakerConfig, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            config,
            clock,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `instance_id`.
    #[must_use]
    pub fn get(&self, instance_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(instance_id) {
            return Arc::clone(existing.value());
        }
        let breaker = self
            .breakers
            .entry(instance_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    instance_id,
                    self.config,
                    Arc::clone(&self.clock),
                ))
            });
        Arc::clone(breaker.value())
    }

    /// State of `instance_id`'s breaker; `Closed` if it has none yet.
    #[must_use]
    pub fn state(&self, instance_id: &str) -> CircuitState {
        self.breakers
            .get(instance_id)
            .map(|b| Arc::clone(b.value()))
            .map_or(CircuitState::Closed, |b| b.state())
    }

    #[must_use]
    pub fn is_open(&self, instance_id: &str) -> bool {
        self.state(instance_id) == CircuitState::Open
    }

    pub fn remove(&self, instance_id: &str) {
        self.breakers.remove(instance_id);
    }

    #[must_use]
    pub fn snapshot(&self, instance_id: &str) -> Option<CircuitSnapshot> {
        self.breakers
            .get(instance_id)
            .map(|b| Arc::clone(b.value()))
            .map(|b| b.snapshot())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use portalfed_core::ManualClock;

    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            failure_window_ms: 1_000,
            base_cooldown_ms: 100,
            max_cooldown_ms: 350,
        }
    }

    fn breaker() -> (Arc<CircuitBreaker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10_000));
        let breaker = Arc::new(CircuitBreaker::new("i1", config(), clock.clone()));
        (breaker, clock)
    }

    fn fail(breaker: &Arc<CircuitBreaker>) {
        breaker.try_acquire().unwrap().failure();
    }

    #[test]
    fn opens_after_threshold_failures_within_window() {
        let (breaker, clock) = breaker();
        fail(&breaker);
        clock.advance(100);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        clock.advance(100);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_none());
    }

    #[test]
    fn stale_streak_starts_over() {
        let (breaker, clock) = breaker();
        fail(&breaker);
        fail(&breaker);
        clock.advance(1_500);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }

    #[test]
    fn success_resets_the_streak() {
        let (breaker, _clock) = breaker();
        fail(&breaker);
        fail(&breaker);
        breaker.try_acquire().unwrap().success();
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_only_after_cooldown_elapses() {
        let (breaker, clock) = breaker();
        for _ in 0..3 {
            fail(&breaker);
        }
        clock.advance(99);
        assert_eq!(breaker.state(), CircuitState::Open);
        clock.advance(1);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_admits_a_single_trial() {
        let (breaker, clock) = breaker();
        for _ in 0..3 {
            fail(&breaker);
        }
        clock.advance(100);

        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert!(breaker.try_acquire().is_none());

        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().trips, 0);
    }

    #[test]
    fn failed_trial_reopens_with_longer_cooldown() {
        let (breaker, clock) = breaker();
        for _ in 0..3 {
            fail(&breaker);
        }
        clock.advance(100);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().open_until_ms, Some(clock.now() + 200));

        clock.advance(200);
        fail(&breaker);
        // Third trip would be 400ms; capped at 350.
        assert_eq!(breaker.snapshot().open_until_ms, Some(clock.now() + 350));
    }

    #[test]
    fn dropped_trial_permit_frees_the_slot() {
        let (breaker, clock) = breaker();
        for _ in 0..3 {
            fail(&breaker);
        }
        clock.advance(100);
        drop(breaker.try_acquire().unwrap());
        assert!(breaker.try_acquire().is_some());
    }

    #[test]
    fn board_creates_breakers_lazily() {
        let clock = Arc::new(ManualClock::new(0));
        let board = BreakerBoard::new(config(), clock);
        assert_eq!(board.state("i1"), CircuitState::Closed);
        assert!(board.snapshot("i1").is_none());

        let breaker = board.get("i1");
        for _ in 0..3 {
            fail(&breaker);
        }
        assert!(board.is_open("i1"));
        assert!(Arc::ptr_eq(&breaker, &board.get("i1")));

        board.remove("i1");
        assert!(!board.is_open("i1"));
    }
}
