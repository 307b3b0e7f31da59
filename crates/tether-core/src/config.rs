//! Session, dispatch and rate-limit configuration

use std::time::Duration;

use crate::error::{LinkError, Result};

/// Tunables for the session manager, dispatch pipeline and rate limiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Minimum time between successful dispatch jobs for one operator
    pub cooldown_window: Duration,

    /// Retryable closes tolerated before the session is marked failed
    pub max_retries: u32,

    /// Upper bound on how long a pairing-code request waits for a code
    pub pairing_timeout: Duration,

    /// How long an issued pairing code stays valid
    pub pairing_code_validity: Duration,

    /// Fixed delay before a reconnect attempt
    pub reconnect_backoff: Duration,

    /// Period of the rate-limit sweep
    pub sweep_interval: Duration,

    /// Age after which a rate-limit entry is evicted by the sweep
    pub stale_after: Duration,

    /// Attempts per job when the caller does not say
    pub default_attempts: u32,

    /// Delay between consecutive attempts of one job
    pub attempt_delay: Duration,

    /// Largest attempt count a single job may request
    pub max_attempts_per_job: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            cooldown_window: Duration::from_secs(15 * 60),
            max_retries: 5,
            pairing_timeout: Duration::from_secs(15),
            pairing_code_validity: Duration::from_secs(120),
            reconnect_backoff: Duration::from_secs(3),
            sweep_interval: Duration::from_secs(60 * 60),
            stale_after: Duration::from_secs(60 * 60),
            default_attempts: 1,
            attempt_delay: Duration::from_secs(1),
            max_attempts_per_job: 10,
        }
    }
}

impl LinkConfig {
    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidConfig` if:
    /// - `stale_after` is shorter than `cooldown_window` (the sweep would
    ///   evict entries that are still enforcing a cooldown)
    /// - a timer that drives a loop is zero
    /// - the attempt bounds are inconsistent
    pub fn validate(&self) -> Result<()> {
        if self.stale_after < self.cooldown_window {
            return Err(LinkError::InvalidConfig(
                format!(
                    "stale_after ({:?}) must be at least cooldown_window ({:?})",
                    self.stale_after, self.cooldown_window
                )
                .into(),
            ));
        }

        for (name, value) in [
            ("pairing_timeout", self.pairing_timeout),
            ("pairing_code_validity", self.pairing_code_validity),
            ("reconnect_backoff", self.reconnect_backoff),
            ("sweep_interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(LinkError::InvalidConfig(format!("{name} must be non-zero").into()));
            }
        }

        if self.max_attempts_per_job == 0 {
            return Err(LinkError::InvalidConfig(
                "max_attempts_per_job must be at least 1".into(),
            ));
        }

        if self.default_attempts == 0 || self.default_attempts > self.max_attempts_per_job {
            return Err(LinkError::InvalidConfig(
                format!(
                    "default_attempts must be between 1 and {}",
                    self.max_attempts_per_job
                )
                .into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cooldown_window, Duration::from_millis(900_000));
        assert_eq!(config.pairing_code_validity, Duration::from_secs(120));
    }

    #[test]
    fn test_stale_shorter_than_cooldown_rejected() {
        let config = LinkConfig {
            stale_after: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(LinkError::InvalidConfig(_))
        ));

        let equal = LinkConfig {
            stale_after: Duration::from_secs(15 * 60),
            ..Default::default()
        };
        assert!(equal.validate().is_ok());
    }

    #[test]
    fn test_zero_timers_rejected() {
        let config = LinkConfig {
            reconnect_backoff: Duration::ZERO,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reconnect_backoff"));
    }

    #[test]
    fn test_attempt_bounds() {
        let config = LinkConfig {
            default_attempts: 11,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = LinkConfig {
            max_attempts_per_job: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
