//! Wire frames owned by the rate-limiting layer.
//!
//! The messaging engine owns the content codes (status handshake, envelope
//! batches); this layer adds exactly one frame: the peer rate limit
//! advertisement, sent once per connection right after the engine handshake.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::RateLimitConfig;

/// Frame codes on a murmur connection.
pub mod codes {
    /// Engine status handshake.
    pub const STATUS: u64 = 0;
    /// Envelope batch.
    pub const MESSAGES: u64 = 1;
    /// Peer rate limit advertisement, above the range the messaging engine
    /// reserves for content frames.
    pub const RATE_LIMIT_ADVERTISEMENT: u64 = 20;
}

/// One length-delimited unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(code: u64, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }
}

pub const ADVERTISEMENT_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("unsupported advertisement version {0}")]
    UnsupportedVersion(u16),

    #[error("malformed advertisement: {0}")]
    Malformed(#[from] bincode::Error),
}

/// The sender's ingress budget, advertised so a compliant peer can
/// self-throttle before transmitting. Fixed-width bincode behind an explicit
/// version field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitAdvertisement {
    pub version: u16,
    pub interval_secs: u64,
    pub capacity: u64,
    pub quantum: u64,
}

impl RateLimitAdvertisement {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            version: ADVERTISEMENT_VERSION,
            interval_secs: config.interval.as_secs(),
            capacity: config.capacity,
            quantum: config.quantum,
        }
    }

    pub fn to_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            interval: Duration::from_secs(self.interval_secs),
            capacity: self.capacity,
            quantum: self.quantum,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        let advertisement: Self = bincode::deserialize(raw)?;
        if advertisement.version != ADVERTISEMENT_VERSION {
            return Err(WireError::UnsupportedVersion(advertisement.version));
        }
        Ok(advertisement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hourly_config() -> RateLimitConfig {
        RateLimitConfig {
            interval: Duration::from_secs(3600),
            capacity: 10 << 10,
            quantum: 1 << 10,
        }
    }

    #[test]
    fn advertisement_roundtrip() {
        let advertisement = RateLimitAdvertisement::from_config(&hourly_config());
        let decoded = RateLimitAdvertisement::decode(&advertisement.encode().unwrap()).unwrap();
        assert_eq!(decoded, advertisement);
        assert_eq!(decoded.to_config(), hourly_config());
    }

    #[test]
    fn future_version_rejected() {
        let mut advertisement = RateLimitAdvertisement::from_config(&hourly_config());
        advertisement.version = ADVERTISEMENT_VERSION + 1;
        let raw = bincode::serialize(&advertisement).unwrap();

        assert!(matches!(
            RateLimitAdvertisement::decode(&raw),
            Err(WireError::UnsupportedVersion(v)) if v == ADVERTISEMENT_VERSION + 1
        ));
    }

    #[test]
    fn truncated_payload_rejected() {
        let raw = RateLimitAdvertisement::from_config(&hourly_config())
            .encode()
            .unwrap();
        assert!(matches!(
            RateLimitAdvertisement::decode(&raw[..raw.len() - 3]),
            Err(WireError::Malformed(_))
        ));
    }
}
