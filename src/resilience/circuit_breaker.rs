use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{add_duration, Clock, SystemClock};
use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Too many failures, calls are rejected until the cool-down elapses.
    Open,
    /// Cool-down elapsed, one trial call is admitted.
    HalfOpen,
}

/// Snapshot of a breaker for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    next_attempt_time: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    failure_threshold: u32,
    reset_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            next_attempt_time: None,
            trial_in_flight: false,
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            clock,
        }
    }

    /// Admission check to consult before calling the protected operation.
    ///
    /// Moves OPEN to HALF_OPEN once the cool-down has elapsed and admits a
    /// single trial; further calls are refused until the trial is recorded.
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let ready = self
                    .next_attempt_time
                    .map_or(true, |next| self.clock.now() >= next);
                if ready {
                    debug!("Circuit breaker transitioning to half-open");
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                }
                ready
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!("Circuit breaker closing after successful trial");
        }
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.next_attempt_time = None;
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self) {
        let now = self.clock.now();
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now);
        self.trial_in_flight = false;

        let should_open = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.failure_count >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            warn!(
                failures = self.failure_count,
                threshold = self.failure_threshold,
                "Circuit breaker opening"
            );
            self.state = CircuitState::Open;
            self.next_attempt_time = Some(add_duration(now, self.reset_timeout));
        }
    }

    /// Gives back a half-open trial whose call never completed. The trial
    /// counts as failed, so the breaker reopens and cools down again.
    pub fn abandon_trial(&mut self) {
        if self.state == CircuitState::HalfOpen && self.trial_in_flight {
            debug!("Half-open trial abandoned before completion");
            self.record_failure();
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        CircuitBreakerState {
            state: self.state,
            failure_count: self.failure_count,
            last_failure_time: self.last_failure_time,
            next_attempt_time: self.next_attempt_time,
        }
    }
}

/// One breaker per named service, created on first use.
///
/// Breakers live in a sharded map so unrelated services never contend on a
/// single lock.
#[derive(Debug)]
pub struct CircuitBreakerManager {
    breakers: DashMap<String, CircuitBreaker>,
    failure_threshold: u32,
    reset_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(&BreakerConfig::default(), Arc::new(SystemClock))
    }
}

impl CircuitBreakerManager {
    pub fn new(config: &BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold: config.failure_threshold,
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            clock,
        }
    }

    fn with_breaker<R>(&self, service: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut entry = self.breakers.entry(service.to_string()).or_insert_with(|| {
            CircuitBreaker::new(self.failure_threshold, self.reset_timeout, self.clock.clone())
        });
        f(entry.value_mut())
    }

    pub fn can_attempt(&self, service: &str) -> bool {
        self.with_breaker(service, |b| b.can_attempt())
    }

    pub fn record_success(&self, service: &str) {
        self.with_breaker(service, |b| b.record_success())
    }

    /// Admits one call to `service`, or `None` while the breaker refuses it.
    ///
    /// The returned [`Admission`] must be resolved with `success` or
    /// `failure`; dropping it unresolved abandons any half-open trial it holds.
    pub fn admit(&self, service: &str) -> Option<Admission<'_>> {
        self.can_attempt(service).then(|| Admission {
            manager: self,
            service: service.to_string(),
            resolved: false,
        })
    }

    pub fn abandon_trial(&self, service: &str) {
        self.with_breaker(service, |b| b.abandon_trial())
    }

    pub fn record_failure(&self, service: &str) {
        self.with_breaker(service, |b| b.record_failure())
    }

    pub fn is_open(&self, service: &str) -> bool {
        self.breakers
            .get(service)
            .map(|b| b.is_open())
            .unwrap_or(false)
    }

    pub fn state(&self, service: &str) -> Option<CircuitBreakerState> {
        self.breakers.get(service).map(|b| b.snapshot())
    }

    pub fn reset(&self, service: &str) {
        self.breakers.remove(service);
    }

    pub fn status(&self) -> BTreeMap<String, CircuitBreakerState> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }
}

/// A call admitted by a [`CircuitBreakerManager`].
#[derive(Debug)]
pub struct Admission<'a> {
    manager: &'a CircuitBreakerManager,
    service: String,
    resolved: bool,
}

impl Admission<'_> {
    pub fn success(mut self) {
        self.resolved = true;
        self.manager.record_success(&self.service);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.manager.record_failure(&self.service);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.manager.abandon_trial(&self.service);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(threshold: u32) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let cb = CircuitBreaker::new(threshold, Duration::from_secs(60), clock.clone());
        (cb, clock)
    }

    #[test]
    fn opens_after_threshold() {
        let (mut cb, _clock) = breaker(3);
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.is_open());
        assert!(cb.can_attempt());

        cb.record_failure();
        assert!(cb.is_open());
        assert!(!cb.can_attempt());
    }

    #[test]
    fn half_open_admits_exactly_one_trial() {
        let (mut cb, clock) = breaker(2);
        cb.record_failure();
        cb.record_failure();

        clock.advance(Duration::from_secs(59));
        assert!(!cb.can_attempt());

        clock.advance(Duration::from_secs(1));
        assert!(cb.can_attempt());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.can_attempt());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
        assert!(cb.can_attempt());
    }

    #[test]
    fn failed_trial_reopens() {
        let (mut cb, clock) = breaker(1);
        cb.record_failure();
        clock.advance(Duration::from_secs(60));
        assert!(cb.can_attempt());

        cb.record_failure();
        assert!(cb.is_open());
        assert!(!cb.can_attempt());
        let next = cb.snapshot().next_attempt_time.unwrap();
        assert_eq!(next, add_duration(clock.now(), Duration::from_secs(60)));
    }

    #[test]
    fn dropped_admission_reopens_half_open_breaker() {
        let clock = Arc::new(ManualClock::default());
        let config = BreakerConfig {
            failure_threshold: 1,
            reset_timeout_ms: 1_000,
        };
        let manager = CircuitBreakerManager::new(&config, clock.clone());
        manager.record_failure("video");
        clock.advance(Duration::from_secs(1));

        let trial = manager.admit("video").unwrap();
        assert_eq!(manager.state("video").unwrap().state, CircuitState::HalfOpen);
        assert!(manager.admit("video").is_none());
        drop(trial);

        assert_eq!(manager.state("video").unwrap().state, CircuitState::Open);
        clock.advance(Duration::from_secs(1));
        manager.admit("video").unwrap().success();
        assert_eq!(manager.state("video").unwrap().state, CircuitState::Closed);
    }

    #[test]
    fn dropped_admission_while_closed_records_nothing() {
        let manager = CircuitBreakerManager::new(&BreakerConfig::default(), Arc::new(ManualClock::default()));
        drop(manager.admit("general").unwrap());
        let state = manager.state("general").unwrap();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
    }

    #[test]
    fn success_resets_failure_count_while_closed() {
        let (mut cb, _clock) = breaker(3);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert!(!cb.is_open());
    }

    #[test]
    fn manager_isolates_services() {
        let config = BreakerConfig {
            failure_threshold: 2,
            reset_timeout_ms: 1_000,
        };
        let manager = CircuitBreakerManager::new(&config, Arc::new(ManualClock::default()));
        manager.record_failure("video");
        manager.record_failure("video");

        assert!(manager.is_open("video"));
        assert!(!manager.can_attempt("video"));
        assert!(manager.can_attempt("general"));

        let status = manager.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status["video"].state, CircuitState::Open);
        assert_eq!(status["general"].state, CircuitState::Closed);

        manager.reset("video");
        assert!(manager.can_attempt("video"));
    }
}
