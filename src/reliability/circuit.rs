//! API-error circuit breaker.
//!
//! Order placement halts after `threshold` consecutive broker failures and
//! resumes after a cool-off period via a half-open probe.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failures: u32,
    pub threshold: u32,
    cooloff: Duration,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            threshold: threshold.max(1),
            cooloff: Duration::from_secs(
                std::env::var("CIRCUIT_COOLOFF_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(60),
            ),
            opened_at: None,
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        if self.failures >= self.threshold {
            self.state = CircuitState::Open;
            self.opened_at = Some(Instant::now());
        }
    }

    pub fn allow(&mut self) -> bool {
        if self.state == CircuitState::Open {
            let cooled = self.opened_at.map(|t| t.elapsed() >= self.cooloff).unwrap_or(false);
            if cooled {
                // let one probe through; a failure reopens immediately
                self.state = CircuitState::HalfOpen;
            }
        }
        matches!(self.state, CircuitState::Closed | CircuitState::HalfOpen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_on_threshold() {
        let mut cb = CircuitBreaker::new(3);
        assert!(cb.allow());
        cb.record_failure();
        cb.record_failure();
        assert!(cb.allow());
        cb.record_failure();
        assert!(!cb.allow());
        assert_eq!(cb.state, CircuitState::Open);
    }

    #[test]
    fn resets_on_success() {
        let mut cb = CircuitBreaker::new(2);
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.allow());
        cb.record_success();
        assert!(cb.allow());
        assert_eq!(cb.state, CircuitState::Closed);
    }

    #[test]
    fn half_open_after_cooloff() {
        let mut cb = CircuitBreaker::new(1);
        cb.cooloff = Duration::from_millis(0);
        cb.record_failure();
        // cool-off elapsed immediately; probe allowed
        assert!(cb.allow());
        assert_eq!(cb.state, CircuitState::HalfOpen);
        cb.record_failure();
        assert_eq!(cb.state, CircuitState::Open);
    }
}
