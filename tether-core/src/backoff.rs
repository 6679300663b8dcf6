//! Exponential backoff with jitter for reconnection attempts.

use std::time::Duration;

use rand::Rng;

/// Backoff policy parameters.
///
/// `delay_n = min(max_delay, initial · multiplierⁿ⁻¹)`, then scaled by
/// `1 + jitter·(2·rand − 1)` so simultaneous reconnectors spread out.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1]`; 0 disables jitter.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl Backoff {
    /// The un-jittered delay for 1-based attempt `n`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exp as i32);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }
}

/// Attempt tracker for one connection's backoff schedule.
#[derive(Debug, Clone)]
pub struct BackoffState {
    policy: Backoff,
    attempt: u32,
}

impl BackoffState {
    #[must_use]
    pub const fn new(policy: Backoff) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay to sleep before the next attempt, advancing the counter.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let base = self.policy.base_delay(self.attempt);
        if self.policy.jitter <= 0.0 {
            return base;
        }
        let unit: f64 = rand::thread_rng().gen();
        let factor = 1.0 + self.policy.jitter.min(1.0) * (2.0 * unit - 1.0);
        Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// 1-based attempt number of the most recent `next_delay`.
    #[inline]
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> Backoff {
        Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn doubles_until_capped() {
        let mut state = BackoffState::new(no_jitter());
        assert_eq!(state.next_delay(), Duration::from_millis(100));
        assert_eq!(state.next_delay(), Duration::from_millis(200));
        assert_eq!(state.next_delay(), Duration::from_millis(400));
        assert_eq!(state.next_delay(), Duration::from_millis(800));
        assert_eq!(state.next_delay(), Duration::from_secs(1));
        assert_eq!(state.next_delay(), Duration::from_secs(1));
        assert_eq!(state.attempt(), 6);
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut state = BackoffState::new(no_jitter());
        state.next_delay();
        state.next_delay();
        state.reset();
        assert_eq!(state.attempt(), 0);
        assert_eq!(state.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = Backoff {
            jitter: 0.1,
            ..no_jitter()
        };
        let mut state = BackoffState::new(policy);
        for _ in 0..100 {
            state.reset();
            let delay = state.next_delay().as_secs_f64();
            assert!((0.09..=0.11).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn large_attempt_does_not_overflow() {
        let policy = no_jitter();
        assert_eq!(policy.base_delay(1_000), Duration::from_secs(1));
    }
}
