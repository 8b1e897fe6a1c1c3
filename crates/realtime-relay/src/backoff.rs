//! Reconnect delay schedule.

use homeguard_core::RealtimeConfig;
use rand::Rng;
use std::time::Duration;

/// Snapshot of the reconnect schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackoffState {
    /// Consecutive failed attempts since the last successful handshake.
    pub attempt: u32,
    pub current_delay: Duration,
}

/// Exponential backoff with jitter, capped at `max`.
///
/// Delays never shrink between consecutive failures, even with jitter, and
/// start over from `base` after [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    jitter: Duration,
    state: BackoffState,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter,
            state: BackoffState::default(),
        }
    }

    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self::new(
            config.reconnect_base_delay(),
            config.reconnect_max_delay(),
            config.reconnect_jitter(),
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.state.attempt.min(31);
        self.state.attempt = self.state.attempt.saturating_add(1);

        let raw = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max);
        let jittered = (raw + self.random_jitter()).min(self.max);

        self.state.current_delay = jittered.max(self.state.current_delay);
        self.state.current_delay
    }

    pub fn reset(&mut self) {
        self.state = BackoffState::default();
    }

    pub fn state(&self) -> BackoffState {
        self.state
    }

    fn random_jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_doubles_up_to_cap() {
        let mut backoff = ReconnectBackoff::new(ms(100), ms(1000), Duration::ZERO);
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![ms(100), ms(200), ms(400), ms(800), ms(1000), ms(1000)]
        );
        assert_eq!(backoff.state().attempt, 6);
    }

    #[test]
    fn test_jittered_delays_never_decrease() {
        let mut backoff = ReconnectBackoff::new(ms(50), ms(400), ms(300));
        let mut previous = Duration::ZERO;
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay >= previous, "{:?} < {:?}", delay, previous);
            assert!(delay <= ms(400));
            previous = delay;
        }
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = ReconnectBackoff::new(ms(100), ms(1000), Duration::ZERO);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.state(), BackoffState::default());
        assert_eq!(backoff.next_delay(), ms(100));
    }

    #[test]
    fn test_many_attempts_do_not_overflow() {
        let mut backoff = ReconnectBackoff::new(ms(1000), ms(60_000), ms(500));
        for _ in 0..200 {
            backoff.next_delay();
        }
        assert_eq!(backoff.state().current_delay, ms(60_000));
    }

    #[test]
    fn test_from_config() {
        let config = RealtimeConfig {
            reconnect_base_delay_ms: 10,
            reconnect_max_delay_ms: 40,
            reconnect_jitter_ms: 0,
            ..RealtimeConfig::default()
        };
        let mut backoff = ReconnectBackoff::from_config(&config);
        assert_eq!(backoff.next_delay(), ms(10));
        assert_eq!(backoff.next_delay(), ms(20));
        assert_eq!(backoff.next_delay(), ms(40));
        assert_eq!(backoff.next_delay(), ms(40));
    }
}
