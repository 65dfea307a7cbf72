//! Pure retry decisions for connection attempts
//!
//! The session loop asks [`RetryPolicy::decide`] after every failed attempt
//! and sleeps for the returned delay. Nothing in here performs I/O.

use crate::config::ClientConfig;
use std::time::Duration;

/// Retry configuration for connection attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of connection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Delay after a failed attempt
    pub interval: Duration,
    /// When set, reconnect delays double after each failure up to this bound
    pub max_interval: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            interval: Duration::from_secs(5),
            max_interval: None,
        }
    }
}

/// Outcome of a retry decision
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Sleep for `delay`, then make attempt number `attempt`
    Retry { attempt: u32, delay: Duration },
    /// Every allowed attempt has been made
    GiveUp,
    /// The session is being ended
    Shutdown,
}

impl RetryPolicy {
    /// Fixed delay between attempts
    pub fn fixed(max_attempts: Option<u32>, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            max_interval: None,
        }
    }

    /// Delay following failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.max_interval {
            None => self.interval,
            Some(max) => {
                let exponent = attempt.saturating_sub(1).min(16);
                self.interval
                    .checked_mul(1u32 << exponent)
                    .map_or(max, |delay| delay.min(max))
            }
        }
    }

    /// Decide what happens after `attempts_made` failed attempts
    pub fn decide(&self, attempts_made: u32, shutdown_requested: bool) -> RetryDecision {
        if shutdown_requested {
            return RetryDecision::Shutdown;
        }

        let delay = self.delay_for(attempts_made);

        if let Some(max_attempts) = self.max_attempts {
            if attempts_made >= max_attempts {
                return RetryDecision::GiveUp;
            }
        }

        RetryDecision::Retry {
            attempt: attempts_made + 1,
            delay,
        }
    }

    /// Human-readable attempt bound for log lines
    pub fn max_display(&self) -> String {
        self.max_attempts
            .map_or("∞".to_string(), |max| max.to_string())
    }

    /// Policy for the first connection made by `launch`: always fixed interval
    pub fn initial(config: &ClientConfig) -> Self {
        Self::fixed(config.max_retries, config.retry_interval())
    }

    /// Policy for reconnecting after a lost connection
    pub fn reconnect(config: &ClientConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            interval: config.retry_interval(),
            max_interval: config.max_retry_interval_seconds.map(Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::fixed(Some(3), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(10), Duration::from_secs(1));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: None,
            interval: Duration::from_secs(1),
            max_interval: Some(Duration::from_secs(60)),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(7), Duration::from_secs(60));
        assert_eq!(policy.delay_for(1000), Duration::from_secs(60));
    }

    #[test]
    fn test_decide_bounded() {
        let policy = RetryPolicy::fixed(Some(3), Duration::from_secs(1));

        assert_eq!(
            policy.decide(1, false),
            RetryDecision::Retry {
                attempt: 2,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            policy.decide(2, false),
            RetryDecision::Retry {
                attempt: 3,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(policy.decide(3, false), RetryDecision::GiveUp);
    }

    #[test]
    fn test_decide_unbounded_never_gives_up() {
        let policy = RetryPolicy::default();
        assert!(matches!(
            policy.decide(10_000, false),
            RetryDecision::Retry { attempt: 10_001, .. }
        ));
    }

    #[test]
    fn test_decide_shutdown_wins() {
        let policy = RetryPolicy::fixed(Some(3), Duration::from_secs(1));
        assert_eq!(policy.decide(0, true), RetryDecision::Shutdown);
        assert_eq!(policy.decide(3, true), RetryDecision::Shutdown);
    }

    #[test]
    fn test_policies_from_config() {
        let mut config = ClientConfig::new("localhost", 1883);
        config.max_retries = Some(4);
        config.retry_interval_seconds = 2;
        config.max_retry_interval_seconds = Some(30);

        let initial = RetryPolicy::initial(&config);
        assert_eq!(initial.max_attempts, Some(4));
        assert_eq!(initial.max_interval, None);

        let reconnect = RetryPolicy::reconnect(&config);
        assert_eq!(reconnect.max_interval, Some(Duration::from_secs(30)));
        assert_eq!(reconnect.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn test_max_display() {
        assert_eq!(RetryPolicy::default().max_display(), "∞");
        assert_eq!(
            RetryPolicy::fixed(Some(7), Duration::from_secs(1)).max_display(),
            "7"
        );
    }
}
