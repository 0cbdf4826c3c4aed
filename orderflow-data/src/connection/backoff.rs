use std::time::Duration;

pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_millis(500);
pub const DEFAULT_RECONNECT_CAP: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;

/// Capped exponential reconnect delays: `min(base * 2^attempt, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_RECONNECT_BASE,
            cap: DEFAULT_RECONNECT_CAP,
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }
}

/// Attempt counter over a [`ReconnectPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    /// Next delay, or `None` once `max_attempts` delays have been handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Start over after a successful authenticated session.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_delays() {
        let mut backoff = ReconnectPolicy::default().backoff();
        let delays = std::iter::from_fn(|| backoff.next_delay())
            .map(|delay| delay.as_millis() as u64)
            .collect::<Vec<_>>();

        assert_eq!(
            delays,
            vec![500, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000, 30_000]
        );
        assert!(backoff.is_exhausted());
        assert_eq!(backoff.attempts(), 10);
    }

    #[test]
    fn test_reset_after_session() {
        let mut backoff = ReconnectPolicy::default().backoff();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_large_attempt_saturates_at_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(40), policy.cap);
        assert_eq!(policy.delay(u32::MAX), policy.cap);
    }

    proptest! {
        #[test]
        fn prop_delays_double_until_cap(
            base_ms in 1u64..2_000,
            cap_ms in 1u64..120_000,
            max_attempts in 1u32..40,
        ) {
            let policy = ReconnectPolicy {
                base: Duration::from_millis(base_ms),
                cap: Duration::from_millis(cap_ms),
                max_attempts,
            };
            let mut backoff = policy.backoff();
            let delays = std::iter::from_fn(|| backoff.next_delay()).collect::<Vec<_>>();

            prop_assert_eq!(delays.len(), max_attempts as usize);
            prop_assert_eq!(delays[0], policy.base.min(policy.cap));
            for pair in delays.windows(2) {
                prop_assert!(pair[1] <= policy.cap);
                prop_assert_eq!(pair[1], (pair[0] * 2).min(policy.cap));
            }
        }
    }
}
