//! Exponential backoff for reconnect scheduling.

use std::time::Duration;

/// Delay returned for the first attempt after a reset.
pub const BASE_DELAY: Duration = Duration::from_secs(1);
/// Upper bound on the computed delay; attempts keep counting past it.
pub const MAX_DELAY: Duration = Duration::from_secs(30);

/// Instance-scoped attempt counter, so independent sessions never share
/// backoff state.
#[derive(Debug, Default)]
pub struct ReconnectBackoff {
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `min(BASE_DELAY * 2^attempts, MAX_DELAY)` and increments the
    /// attempt counter, so consecutive calls without a reset produce
    /// increasing delays.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u64.checked_shl(self.attempts).unwrap_or(u64::MAX);
        let millis = (BASE_DELAY.as_millis() as u64)
            .saturating_mul(factor)
            .min(MAX_DELAY.as_millis() as u64);
        self.attempts = self.attempts.saturating_add(1);
        Duration::from_millis(millis)
    }

    /// Zeroes the counter. Called on every handshake-acknowledged connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_capped() {
        let mut backoff = ReconnectBackoff::new();
        let expected = [1_000u64, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000];
        for (n, &millis) in expected.iter().enumerate() {
            assert_eq!(
                backoff.next_delay(),
                Duration::from_millis(millis),
                "attempt {n}"
            );
        }
    }

    #[test]
    fn matches_closed_form_for_any_attempt_count() {
        let mut backoff = ReconnectBackoff::new();
        for n in 0u32..40 {
            let expected = 1_000u128
                .saturating_mul(2u128.saturating_pow(n))
                .min(30_000);
            assert_eq!(backoff.next_delay().as_millis(), expected);
        }
    }

    #[test]
    fn reset_restarts_from_base_delay() {
        let mut backoff = ReconnectBackoff::new();
        for _ in 0..6 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), BASE_DELAY);
    }

    #[test]
    fn counter_survives_far_past_the_cap() {
        let mut backoff = ReconnectBackoff::new();
        for _ in 0..200 {
            assert!(backoff.next_delay() <= MAX_DELAY);
        }
        assert_eq!(backoff.attempts(), 200);
    }
}
