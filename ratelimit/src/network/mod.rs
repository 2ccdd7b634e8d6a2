//! Integration of the rate limiter into the peer connection lifecycle:
//! identity derivation, the handshake advertisement, per-connection
//! enforcement, and the flaky-connection watchdog.

pub mod connection;
pub mod peer;
pub mod protocol;
pub mod session;

pub use connection::TrackedConnection;
pub use peer::{IdentityError, IdentityMode, PeerHandle, PeerRateLimiter, RelayLimiters};
pub use protocol::{codes, Frame, RateLimitAdvertisement, WireError};
pub use session::{FrameIo, InboundPacket, PeerSession, SessionError, SessionState};
