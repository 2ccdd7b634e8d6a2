//! Per-connection handshake and enforcement.
//!
//! One `PeerSession` exists per live connection, driven by that connection's
//! read/write task. After the messaging engine's own status handshake the
//! session advertises the local ingress budget exactly once, then gates
//! every inbound frame against the ingress limiter and every outbound unit
//! against the egress limiter. An ingress violation is fatal to the
//! connection; an egress denial defers the unit, never the whole batch.

use std::sync::Arc;

use async_trait::async_trait;
use libp2p::PeerId;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::limiter::{Clock, SystemClock};
use crate::metrics::Direction;
use crate::network::connection::TrackedConnection;
use crate::network::peer::{derive_identity, IdentityError, PeerHandle, RelayLimiters};
use crate::network::protocol::{codes, Frame, RateLimitAdvertisement, WireError};

/// Connection lifecycle as seen by the rate-limiting layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    HandshakeSent,
    HandshakeReceived,
    Active,
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("peer {peer} exceeded ingress budget: requested {requested}, granted {granted}")]
    QuotaExceeded {
        peer: PeerId,
        requested: u64,
        granted: u64,
    },

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("operation requires state {expected:?}, session is {actual:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("session closed")]
    Closed,

    #[error("transport failure: {0}")]
    Transport(String),
}

/// Frame-level seam to the underlying stream. The transport adapter
/// implements this over its wire; tests use an in-memory pipe.
#[async_trait]
pub trait FrameIo: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), SessionError>;

    /// `Ok(None)` when the remote closed the stream cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, SessionError>;
}

/// An admitted inbound unit, handed to the messaging engine.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub peer: PeerId,
    pub code: u64,
    pub payload: Vec<u8>,
}

/// Connection-scoped enforcement state machine.
pub struct PeerSession {
    peer: Box<dyn PeerHandle>,
    peer_id: PeerId,
    state: SessionState,
    limiters: Arc<RelayLimiters>,
    remote_limit: Option<RateLimitAdvertisement>,
    tracker: Option<Arc<TrackedConnection>>,
    clock: Arc<dyn Clock>,
}

impl PeerSession {
    /// Rejects the connection up front if the configured identity mode
    /// cannot derive a key for this peer; the limiter is never consulted
    /// for a peer it cannot name.
    pub fn new(
        peer: Box<dyn PeerHandle>,
        limiters: Arc<RelayLimiters>,
    ) -> Result<Self, SessionError> {
        derive_identity(limiters.ingress.mode(), peer.as_ref())?;
        let peer_id = peer.peer_id();
        Ok(Self {
            peer,
            peer_id,
            state: SessionState::Connecting,
            limiters,
            remote_limit: None,
            tracker: None,
            clock: Arc::new(SystemClock),
        })
    }

    /// Attaches the transport adapter's liveness tracker; the session
    /// updates it on every inbound frame.
    pub fn with_tracker(mut self, tracker: Arc<TrackedConnection>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The advertisement the remote sent us, if any.
    pub fn remote_limit(&self) -> Option<RateLimitAdvertisement> {
        self.remote_limit
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    /// The engine's status handshake went out.
    pub fn handshake_sent(&mut self) -> Result<(), SessionError> {
        self.expect_state(SessionState::Connecting)?;
        self.state = SessionState::HandshakeSent;
        Ok(())
    }

    /// The remote's status handshake arrived and was accepted by the engine.
    pub fn handshake_received(&mut self) -> Result<(), SessionError> {
        self.expect_state(SessionState::HandshakeSent)?;
        self.state = SessionState::HandshakeReceived;
        Ok(())
    }

    /// Enters `Active` and yields the advertisement to put on the wire.
    /// Single-shot by construction: a second call finds the session already
    /// active and fails, so the advertisement cannot be sent twice.
    pub fn activate(&mut self) -> Result<RateLimitAdvertisement, SessionError> {
        self.expect_state(SessionState::HandshakeReceived)?;
        self.state = SessionState::Active;
        debug!(peer = %self.peer_id, "session active, advertising ingress budget");
        Ok(self.limiters.advertisement())
    }

    /// Records the budget the remote advertised. Absence of an
    /// advertisement is tolerated (pre-rate-limiting peers); a malformed or
    /// future-versioned one is not.
    pub fn on_remote_advertisement(&mut self, raw: &[u8]) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let advertisement = RateLimitAdvertisement::decode(raw)?;
        self.limiters
            .note_remote_limit(self.peer_id, advertisement.to_config());
        self.remote_limit = Some(advertisement);
        debug!(
            peer = %self.peer_id,
            capacity = advertisement.capacity,
            quantum = advertisement.quantum,
            interval_secs = advertisement.interval_secs,
            "remote advertised its ingress budget"
        );
        Ok(())
    }

    /// Gates one inbound unit of `size` bytes. A partial grant is a quota
    /// violation: the session closes and the returned error tells the
    /// read/write loop to drop the connection immediately.
    pub fn admit_inbound(&mut self, size: u64) -> Result<(), SessionError> {
        self.expect_state(SessionState::Active)?;
        let metrics = self.limiters.metrics();
        metrics.packet_processed(Direction::Ingress);
        metrics.observe_size(size);

        let granted = self.limiters.ingress.take_available(self.peer.as_ref(), size);
        if granted < size {
            metrics.limit_exceeded(Direction::Ingress);
            warn!(
                peer = %self.peer_id,
                requested = size,
                granted,
                "ingress budget exceeded, terminating connection"
            );
            self.close();
            return Err(SessionError::QuotaExceeded {
                peer: self.peer_id,
                requested: size,
                granted,
            });
        }
        Ok(())
    }

    /// Self-throttle check for one outbound unit: all-or-nothing, so a
    /// denied oversized unit leaves the budget for smaller ones.
    pub fn admit_outbound(&self, size: u64) -> bool {
        if self.state != SessionState::Active {
            return false;
        }
        let metrics = self.limiters.metrics();
        if self.limiters.egress.take_exact(self.peer.as_ref(), size) {
            metrics.packet_processed(Direction::Egress);
            metrics.observe_size(size);
            true
        } else {
            metrics.limit_exceeded(Direction::Egress);
            false
        }
    }

    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closed;
            self.limiters.forget_remote_limit(&self.peer_id);
        }
    }

    /// Runs the read side of an active connection: sends the advertisement,
    /// then forwards every admitted frame to the messaging engine until the
    /// remote hangs up or the ingress budget is violated. Returns the
    /// violation as an error; the caller owns the transport and must drop it
    /// without waiting for in-flight writes.
    pub async fn drive<T: FrameIo>(
        &mut self,
        io: &mut T,
        inbound: mpsc::Sender<InboundPacket>,
    ) -> Result<(), SessionError> {
        let advertisement = self.activate()?;
        io.send(Frame::new(
            codes::RATE_LIMIT_ADVERTISEMENT,
            advertisement.encode()?,
        ))
        .await?;

        loop {
            let frame = match io.recv().await? {
                Some(frame) => frame,
                None => {
                    self.close();
                    return Ok(());
                }
            };

            if frame.code == codes::RATE_LIMIT_ADVERTISEMENT {
                if let Err(err) = self.on_remote_advertisement(&frame.payload) {
                    warn!(peer = %self.peer_id, error = %err, "rejecting bad advertisement");
                    self.close();
                    return Err(err);
                }
                continue;
            }

            if let Some(tracker) = &self.tracker {
                tracker.update(self.clock.now_unix());
            }
            self.admit_inbound(frame.payload.len() as u64)?;

            let packet = InboundPacket {
                peer: self.peer_id,
                code: frame.code,
                payload: frame.payload,
            };
            if inbound.send(packet).await.is_err() {
                // The engine side hung up; nothing left to enforce for.
                self.close();
                return Ok(());
            }
        }
    }

    /// Writes a batch of outbound units, self-throttling each against the
    /// egress budget. Admitted units go to the transport; denied units come
    /// back for the caller to retry after a refill. Per-unit admission keeps
    /// small units flowing past an oversized one.
    pub async fn send_batch<T: FrameIo>(
        &mut self,
        io: &mut T,
        code: u64,
        units: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, SessionError> {
        self.expect_state(SessionState::Active)?;
        let mut deferred = Vec::new();
        for unit in units {
            if self.admit_outbound(unit.len() as u64) {
                io.send(Frame::new(code, unit)).await?;
            } else {
                deferred.push(unit);
            }
        }
        Ok(deferred)
    }
}
