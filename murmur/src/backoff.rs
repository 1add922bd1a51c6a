use std::time::{Duration, Instant};
use parking_lot::Mutex;

use crate::config::MAX_RETRY_DELAY;

const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;
const CIRCUIT_BREAKER_RESET_TIMEOUT: Duration = Duration::from_secs(30);
const BASE_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct BackOffState {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    circuit_open: bool,
}

/// Circuit breaker guarding a receive loop.
///
/// Consecutive failures grow an exponential retry delay; past
/// `CIRCUIT_BREAKER_THRESHOLD` of them the circuit opens and the loop stops
/// touching the socket until `reset_timeout` has elapsed since the last
/// failure.
// Refences: https://learn.microsoft.com/en-us/azure/architecture/patterns/circuit-breaker
#[derive(Debug)]
pub(crate) struct BackOff {
    state: Mutex<BackOffState>,
    reset_timeout: Duration,
}

impl BackOff {
    pub(crate) fn new() -> Self {
        Self::with_reset_timeout(CIRCUIT_BREAKER_RESET_TIMEOUT)
    }

    pub(crate) fn with_reset_timeout(reset_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(BackOffState::default()),
            reset_timeout,
        }
    }

    /// Records a failure. Returns the consecutive failure count and whether
    /// this failure opened the circuit.
    pub(crate) fn record_failure(&self) -> (u32, bool) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        state.last_failure = Some(Instant::now());

        let opened = !state.circuit_open && state.consecutive_failures >= CIRCUIT_BREAKER_THRESHOLD;
        if opened {
            state.circuit_open = true;
        }
        (state.consecutive_failures, opened)
    }

    pub(crate) fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.circuit_open = false;
    }

    /// Delay before the next attempt: zero without failures, then doubling
    /// from `BASE_RETRY_DELAY` up to `MAX_RETRY_DELAY` seconds.
    pub(crate) fn calculate_delay(&self) -> Duration {
        let failures = self.state.lock().consecutive_failures;
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = (failures - 1).min(16);
        std::cmp::min(BASE_RETRY_DELAY * 2u32.pow(exp), Duration::from_secs(MAX_RETRY_DELAY))
    }

    /// Checks if the circuit is open, closing it once the reset timeout has
    /// elapsed since the last failure.
    pub(crate) fn is_circuit_open(&self) -> bool {
        let mut state = self.state.lock();
        if !state.circuit_open {
            return false;
        }
        let expired = state.last_failure.map_or(true, |at| at.elapsed() >= self.reset_timeout);
        if expired {
            *state = BackOffState::default();
            return false;
        }
        true
    }

    /// Time left before an open circuit closes again.
    pub(crate) fn time_until_close(&self) -> Duration {
        let state = self.state.lock();
        match state.last_failure {
            Some(at) if state.circuit_open => self.reset_timeout.saturating_sub(at.elapsed()),
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_circuit_opens_and_resets() {
        let backoff = BackOff::with_reset_timeout(Duration::from_millis(200));
        assert!(!backoff.is_circuit_open());
        assert_eq!(backoff.calculate_delay(), Duration::ZERO);

        for i in 1..=CIRCUIT_BREAKER_THRESHOLD {
            let (failures, opened) = backoff.record_failure();
            assert_eq!(failures, i);
            assert_eq!(opened, i == CIRCUIT_BREAKER_THRESHOLD);
        }
        assert!(backoff.is_circuit_open());
        assert!(backoff.time_until_close() > Duration::ZERO);

        // a further failure does not reopen an open circuit
        assert_eq!(backoff.record_failure(), (CIRCUIT_BREAKER_THRESHOLD + 1, false));

        thread::sleep(Duration::from_millis(250));
        assert!(!backoff.is_circuit_open());
        assert_eq!(backoff.calculate_delay(), Duration::ZERO);
    }

    #[test]
    fn test_delay_grows_and_success_resets() {
        let backoff = BackOff::new();
        backoff.record_failure();
        assert_eq!(backoff.calculate_delay(), BASE_RETRY_DELAY);
        backoff.record_failure();
        backoff.record_failure();
        assert_eq!(backoff.calculate_delay(), BASE_RETRY_DELAY * 4);

        for _ in 0..40 {
            backoff.record_failure();
        }
        assert_eq!(backoff.calculate_delay(), Duration::from_secs(MAX_RETRY_DELAY));

        backoff.record_success();
        assert!(!backoff.is_circuit_open());
        assert_eq!(backoff.calculate_delay(), Duration::ZERO);
    }
}
