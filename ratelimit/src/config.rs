use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::network::peer::IdentityMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("refill interval must be at least one second")]
    ZeroInterval,
}

/// Immutable per-limiter-instance parameters for token-bucket accounting.
///
/// `capacity` and `quantum` are byte counts: a bucket holds at most
/// `capacity` tokens and gains `quantum` tokens per elapsed `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Refill period, seconds resolution.
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    /// Maximum token balance in bytes.
    pub capacity: u64,
    /// Tokens added per elapsed interval.
    pub quantum: u64,
}

impl RateLimitConfig {
    /// A zero interval would make refill arithmetic meaningless, so it is
    /// rejected at construction rather than per call. `capacity == 0`
    /// (deny-all) and `quantum == 0` (one-shot budget) are both legal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.as_secs() == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }

    pub(crate) fn interval_secs(&self) -> u64 {
        self.interval.as_secs()
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            capacity: 1 << 20,   // 1 MiB burst
            quantum: 256 << 10,  // refills at 256 KiB/s
        }
    }
}

/// Rate-limiting settings consumed from the relay node's configuration
/// loader. Ingress and egress budgets are independent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    pub mode: IdentityMode,
    pub ingress: RateLimitConfig,
    pub egress: RateLimitConfig,
    /// Connections with no inbound traffic for this long are reported as
    /// flaky by the connection tracker. Zero disables the watchdog.
    #[serde(with = "duration_serde")]
    pub staleness_period: Duration,
}

impl LimiterSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ingress.validate()?;
        self.egress.validate()
    }
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            mode: IdentityMode::default(),
            ingress: RateLimitConfig::default(),
            egress: RateLimitConfig::default(),
            staleness_period: Duration::from_secs(300),
        }
    }
}

pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_rejected() {
        let config = RateLimitConfig {
            interval: Duration::from_secs(0),
            capacity: 1024,
            quantum: 128,
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroInterval)));
    }

    #[test]
    fn degenerate_budgets_are_legal() {
        let deny_all = RateLimitConfig {
            interval: Duration::from_secs(1),
            capacity: 0,
            quantum: 0,
        };
        assert!(deny_all.validate().is_ok());
    }

    #[test]
    fn settings_validate_both_directions() {
        let mut settings = LimiterSettings::default();
        assert!(settings.validate().is_ok());

        settings.egress.interval = Duration::from_millis(250);
        assert!(settings.validate().is_err());
    }
}
