//! Circuit breaker guarding the remote store
//!
//! Every remote call asks the breaker first. After too many failures the breaker opens and remote
//! calls are skipped until the cooldown passed, then a single probe is let through: its success
//! closes the breaker, its failure opens it again.

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;

/// Observable state of the breaker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerStatus {
    /// Remote calls go through
    Closed,

    /// Remote calls are skipped
    Open,

    /// A single probe is allowed
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { probe_started: Option<Instant> },
}

/// Circuit breaker with a cooldown
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<State>,
    cooldown: Duration,
    failure_threshold: u32,
}

impl CircuitBreaker {
    /// Create a closed breaker
    ///
    /// Opens after `failure_threshold` consecutive failures (at least one)
    pub fn new(cooldown: Duration, failure_threshold: u32) -> Self {
        Self {
            state: Mutex::new(State::Closed { failures: 0 }),
            cooldown,
            failure_threshold: failure_threshold.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // the state is always valid, even when a holder panicked
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// May a remote call be attempted?
    ///
    /// Every `true` must be followed by [`Self::record_success`] or [`Self::record_failure`]
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state();

        match *state {
            State::Closed { .. } => true,
            State::Open { until } => {
                if now >= until {
                    tracing::debug!("Cooldown passed, probing remote store");
                    *state = State::HalfOpen {
                        probe_started: Some(now),
                    };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { probe_started } => match probe_started {
                // a probe that takes longer than the cooldown is considered lost
                Some(started) if now.duration_since(started) < self.cooldown => false,
                _ => {
                    *state = State::HalfOpen {
                        probe_started: Some(now),
                    };
                    true
                }
            },
        }
    }

    /// The remote store answered
    pub fn record_success(&self) {
        let mut state = self.state();

        if !matches!(*state, State::Closed { .. }) {
            tracing::info!("Remote store reachable again");
        }

        *state = State::Closed { failures: 0 };
    }

    /// The remote store failed or timed out
    pub fn record_failure(&self) {
        let mut state = self.state();

        match *state {
            State::Closed { failures } => {
                let failures = failures + 1;

                if failures >= self.failure_threshold {
                    tracing::warn!(
                        "Remote store unavailable, skipping remote calls for {:?}",
                        self.cooldown
                    );
                    *state = State::Open {
                        until: Instant::now() + self.cooldown,
                    };
                } else {
                    *state = State::Closed { failures };
                }
            }
            State::HalfOpen { .. } => {
                tracing::debug!("Probe failed, remote store still unavailable");
                *state = State::Open {
                    until: Instant::now() + self.cooldown,
                };
            }
            State::Open { .. } => {}
        }
    }

    /// Open the breaker right away, regardless of the failure count
    pub fn trip(&self) {
        tracing::warn!(
            "Remote store marked unavailable for {:?}",
            self.cooldown
        );

        *self.state() = State::Open {
            until: Instant::now() + self.cooldown,
        };
    }

    pub fn status(&self) -> BreakerStatus {
        match *self.state() {
            State::Closed { .. } => BreakerStatus::Closed,
            State::Open { until } if Instant::now() >= until => BreakerStatus::HalfOpen,
            State::Open { .. } => BreakerStatus::Open,
            State::HalfOpen { .. } => BreakerStatus::HalfOpen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60), 2);

        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(BreakerStatus::Closed, breaker.status());

        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(BreakerStatus::Open, breaker.status());
        assert!(!breaker.allow());
    }

    #[test]
    fn test_success_resets_failures() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60), 2);

        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();

        assert_eq!(BreakerStatus::Closed, breaker.status());
    }

    #[test]
    fn test_single_probe_after_cooldown() {
        let breaker = CircuitBreaker::new(Duration::from_millis(20), 1);

        breaker.record_failure();
        assert!(!breaker.allow());

        std::thread::sleep(Duration::from_millis(30));

        assert!(breaker.allow());
        assert!(!breaker.allow());
        assert_eq!(BreakerStatus::HalfOpen, breaker.status());

        breaker.record_success();
        assert!(breaker.allow());
        assert!(breaker.allow());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let breaker = CircuitBreaker::new(Duration::from_millis(20), 1);

        breaker.trip();
        std::thread::sleep(Duration::from_millis(30));

        assert!(breaker.allow());
        breaker.record_failure();

        assert_eq!(BreakerStatus::Open, breaker.status());
        assert!(!breaker.allow());
    }

    #[test]
    fn test_lost_probe_is_replaced() {
        let breaker = CircuitBreaker::new(Duration::from_millis(20), 1);

        breaker.trip();
        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.allow());

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.allow());
    }
}
