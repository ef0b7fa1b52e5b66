use std::time::Duration;

/// How a dropped link is re-established.
///
/// After `initial_pause`, attempt `n` (1-based) waits
/// `min(n * step, max_delay)` before dialing again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts made before giving up.
    pub max_attempts: u32,
    /// Pause before the first attempt.
    pub initial_pause: Duration,
    /// Linear growth per attempt.
    pub step: Duration,
    /// Cap on any single wait.
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Policy derived from the configured timeout (seconds) and retry count.
    ///
    /// The initial pause is the timeout read as milliseconds, while the
    /// per-attempt step and cap are the timeout in seconds.
    pub fn from_timeout(timeout_secs: u64, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_pause: Duration::from_millis(timeout_secs),
            step: Duration::from_secs(timeout_secs),
            max_delay: Duration::from_secs(timeout_secs),
        }
    }

    /// Wait before the given attempt (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.step
            .checked_mul(attempt)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly_and_caps() {
        let policy = ReconnectPolicy {
            max_attempts: 5,
            initial_pause: Duration::ZERO,
            step: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(250));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_millis(250));
    }

    #[test]
    fn timeout_policy_caps_at_the_timeout() {
        let policy = ReconnectPolicy::from_timeout(30, 3);
        assert_eq!(policy.initial_pause, Duration::from_millis(30));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(30));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(30));
        assert_eq!(policy.max_attempts, 3);
    }
}
