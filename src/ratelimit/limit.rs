//! Token bucket limit parameters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RateBucketError, Result};

/// Shape of a token bucket: burst size and steady refill rate.
///
/// `refill_rate` tokens are credited every `refill_interval`, up to
/// `capacity`. All three values must be strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Maximum tokens a bucket can hold
    #[serde(default = "default_capacity")]
    pub capacity: i64,

    /// Tokens added per elapsed interval
    #[serde(default = "default_refill_rate")]
    pub refill_rate: i64,

    /// Length of one refill interval
    #[serde(
        rename = "refill_interval_ms",
        default = "default_refill_interval",
        with = "duration_ms"
    )]
    pub refill_interval: Duration,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_rate: default_refill_rate(),
            refill_interval: default_refill_interval(),
        }
    }
}

fn default_capacity() -> i64 {
    100
}

fn default_refill_rate() -> i64 {
    10
}

fn default_refill_interval() -> Duration {
    Duration::from_secs(1)
}

impl LimitConfig {
    /// Create a new limit configuration.
    ///
    /// The values are not checked here; see [`LimitConfig::validate`].
    pub fn new(capacity: i64, refill_rate: i64, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_rate,
            refill_interval,
        }
    }

    /// Check that capacity, refill rate and refill interval are all positive.
    pub fn validate(&self) -> Result<()> {
        if self.capacity <= 0 {
            return Err(RateBucketError::InvalidConfig(format!(
                "capacity must be positive, got {}",
                self.capacity
            )));
        }
        if self.refill_rate <= 0 {
            return Err(RateBucketError::InvalidConfig(format!(
                "refill_rate must be positive, got {}",
                self.refill_rate
            )));
        }
        if self.refill_interval.is_zero() {
            return Err(RateBucketError::InvalidConfig(
                "refill_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Upper bound on the refill intervals credited in a single step.
    ///
    /// Enough intervals to refill an empty bucket, plus one.
    pub fn max_refill_intervals(&self) -> i64 {
        self.capacity / self.refill_rate + 1
    }
}

/// Serde helper storing a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).map_err(serde::ser::Error::custom)?;
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = LimitConfig::new(10, 2, Duration::from_millis(100));
        assert!(config.validate().is_ok());
        assert!(LimitConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_capacity() {
        let config = LimitConfig::new(0, 2, Duration::from_millis(100));
        assert!(matches!(
            config.validate(),
            Err(RateBucketError::InvalidConfig(_))
        ));

        let config = LimitConfig::new(-5, 2, Duration::from_millis(100));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_refill_rate() {
        let config = LimitConfig::new(10, 0, Duration::from_millis(100));
        assert!(matches!(
            config.validate(),
            Err(RateBucketError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_invalid_refill_interval() {
        let config = LimitConfig::new(10, 2, Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(RateBucketError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_max_refill_intervals() {
        assert_eq!(LimitConfig::new(10, 2, Duration::from_secs(1)).max_refill_intervals(), 6);
        assert_eq!(LimitConfig::new(1000, 100, Duration::from_millis(1)).max_refill_intervals(), 11);
        assert_eq!(LimitConfig::new(3, 5, Duration::from_secs(1)).max_refill_intervals(), 1);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: LimitConfig = serde_yaml::from_str("capacity: 50\nrefill_interval_ms: 250\n").unwrap();
        assert_eq!(config.capacity, 50);
        assert_eq!(config.refill_rate, 10);
        assert_eq!(config.refill_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_serialize_refill_interval_as_millis() {
        let config = LimitConfig::new(50, 10, Duration::from_millis(250));
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("refill_interval_ms: 250"));

        // Out of range for u64 milliseconds; must not be silently truncated
        let config = LimitConfig::new(50, 10, Duration::MAX);
        assert!(serde_yaml::to_string(&config).is_err());
    }
}
