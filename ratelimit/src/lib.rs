//! Peer-scoped, persistent rate limiting for the murmur gossip relay.
//!
//! Gates message admission per remote peer and per direction using
//! token-bucket accounting that survives process restarts. Each relay node
//! owns one [`RelayLimiters`] pair (ingress, egress) backed by independent
//! namespaces of a shared sled database; every connection task owns a
//! [`PeerSession`] that advertises the local ingress budget at handshake and
//! turns an ingress violation into a connection-fatal error.
//!
//! The envelope protocol itself (proof-of-work, bloom-filter matching,
//! flooding) lives in the messaging engine; this crate sees only "a unit of
//! `N` bytes from peer `P`".

pub mod bucket;
pub mod config;
pub mod limiter;
pub mod metrics;
pub mod network;
pub mod store;

pub use crate::bucket::TokenBucket;
pub use crate::config::{ConfigError, LimiterSettings, RateLimitConfig};
pub use crate::limiter::{Clock, LimiterError, RateLimiter, SystemClock};
pub use crate::metrics::{Direction, LimiterMetrics, NoopMetrics, RelayMetrics};
pub use crate::network::{
    codes, Frame, FrameIo, IdentityError, IdentityMode, InboundPacket, PeerHandle,
    PeerRateLimiter, PeerSession, RateLimitAdvertisement, RelayLimiters, SessionError,
    SessionState, TrackedConnection, WireError,
};
pub use crate::store::{BucketStore, Record, StoreError};
