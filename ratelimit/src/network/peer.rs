//! Peer-facing adapters: identity derivation and the per-direction limiter
//! pair owned by a relay node.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::{LimiterSettings, RateLimitConfig};
use crate::limiter::{Clock, LimiterError, RateLimiter};
use crate::metrics::LimiterMetrics;
use crate::network::connection::TrackedConnection;
use crate::network::protocol::RateLimitAdvertisement;
use crate::store::BucketStore;

/// Tree names for the two directions. Fixed here, not at call sites, so the
/// namespace split cannot be misconfigured.
const INGRESS_TREE: &str = "ratelimit/i";
const EGRESS_TREE: &str = "ratelimit/e";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("peer has no extractable source address")]
    MissingSourceAddress,
}

/// Capability the transport adapter provides for each connection: a stable
/// protocol-level identity (derived once from the transport handshake) and
/// the observed remote address.
pub trait PeerHandle: Send + Sync {
    fn peer_id(&self) -> PeerId;
    fn remote_addr(&self) -> Option<Multiaddr>;
}

/// Which derivation keys the buckets. Selected once at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMode {
    /// Key by the peer's public-key identity: stable across reconnects and
    /// address changes.
    #[default]
    ByPublicIdentity,
    /// Key by the observed source IP, port stripped: groups every peer
    /// behind one address into a single bucket. Coarser, but cheap Sybil
    /// identities sharing an address cannot multiply their budget.
    BySourceAddress,
}

pub(crate) fn derive_identity(
    mode: IdentityMode,
    peer: &dyn PeerHandle,
) -> Result<Vec<u8>, IdentityError> {
    match mode {
        IdentityMode::ByPublicIdentity => Ok(peer.peer_id().to_bytes()),
        IdentityMode::BySourceAddress => {
            let addr = peer
                .remote_addr()
                .ok_or(IdentityError::MissingSourceAddress)?;
            for component in addr.iter() {
                match component {
                    Protocol::Ip4(ip) => return Ok(ip.octets().to_vec()),
                    Protocol::Ip6(ip) => return Ok(ip.octets().to_vec()),
                    _ => {}
                }
            }
            Err(IdentityError::MissingSourceAddress)
        }
    }
}

/// Rate limiter addressed by peers instead of raw identity bytes. Every
/// operation derives the key through the configured mode and delegates; no
/// additional state.
pub struct PeerRateLimiter {
    mode: IdentityMode,
    limiter: RateLimiter,
}

impl PeerRateLimiter {
    pub fn new(mode: IdentityMode, limiter: RateLimiter) -> Self {
        Self { mode, limiter }
    }

    pub fn mode(&self) -> IdentityMode {
        self.mode
    }

    pub fn create(
        &self,
        peer: &dyn PeerHandle,
        config: &RateLimitConfig,
    ) -> Result<(), LimiterError> {
        let identity = derive_identity(self.mode, peer)?;
        self.limiter.create(&identity, config)
    }

    pub fn remove(&self, peer: &dyn PeerHandle, duration: Duration) -> Result<(), LimiterError> {
        let identity = derive_identity(self.mode, peer)?;
        self.limiter.remove(&identity, duration)
    }

    /// Saturating debit; denies when the identity cannot be derived. The
    /// session layer rejects such connections before traffic flows, so this
    /// is a backstop, not the primary gate.
    pub fn take_available(&self, peer: &dyn PeerHandle, amount: u64) -> u64 {
        match derive_identity(self.mode, peer) {
            Ok(identity) => self.limiter.take_available(&identity, amount),
            Err(err) => {
                warn!(peer = %peer.peer_id(), error = %err, "identity derivation failed, denying");
                0
            }
        }
    }

    /// All-or-nothing debit, used for egress gating.
    pub fn take_exact(&self, peer: &dyn PeerHandle, amount: u64) -> bool {
        match derive_identity(self.mode, peer) {
            Ok(identity) => self.limiter.take_exact(&identity, amount),
            Err(err) => {
                warn!(peer = %peer.peer_id(), error = %err, "identity derivation failed, denying");
                false
            }
        }
    }

    pub fn available(&self, peer: &dyn PeerHandle) -> u64 {
        match derive_identity(self.mode, peer) {
            Ok(identity) => self.limiter.available(&identity),
            Err(err) => {
                warn!(peer = %peer.peer_id(), error = %err, "identity derivation failed, denying");
                0
            }
        }
    }
}

/// The ingress/egress limiter pair for one relay node, plus the registry of
/// budgets remote peers have advertised to us.
pub struct RelayLimiters {
    pub ingress: PeerRateLimiter,
    pub egress: PeerRateLimiter,
    /// The local ingress budget, advertised to every peer at handshake.
    pub config: RateLimitConfig,
    staleness_period: Duration,
    metrics: Arc<dyn LimiterMetrics>,
    advertised: DashMap<PeerId, RateLimitConfig>,
}

impl RelayLimiters {
    /// Opens both direction trees on a shared database. The two limiters
    /// share the database but never a namespace.
    pub fn open(
        db: &sled::Db,
        settings: &LimiterSettings,
        metrics: Arc<dyn LimiterMetrics>,
    ) -> Result<Self, LimiterError> {
        settings.validate()?;
        let ingress = RateLimiter::new(
            BucketStore::open(db, INGRESS_TREE)?,
            settings.ingress,
            metrics.clone(),
        )?;
        let egress = RateLimiter::new(
            BucketStore::open(db, EGRESS_TREE)?,
            settings.egress,
            metrics.clone(),
        )?;
        Ok(Self {
            ingress: PeerRateLimiter::new(settings.mode, ingress),
            egress: PeerRateLimiter::new(settings.mode, egress),
            config: settings.ingress,
            staleness_period: settings.staleness_period,
            metrics,
            advertised: DashMap::new(),
        })
    }

    /// [`Self::open`] with a pinned clock, for deterministic tests.
    pub fn open_with_clock(
        db: &sled::Db,
        settings: &LimiterSettings,
        metrics: Arc<dyn LimiterMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LimiterError> {
        settings.validate()?;
        let ingress = RateLimiter::new(
            BucketStore::open(db, INGRESS_TREE)?,
            settings.ingress,
            metrics.clone(),
        )?
        .with_clock(clock.clone());
        let egress = RateLimiter::new(
            BucketStore::open(db, EGRESS_TREE)?,
            settings.egress,
            metrics.clone(),
        )?
        .with_clock(clock);
        Ok(Self {
            ingress: PeerRateLimiter::new(settings.mode, ingress),
            egress: PeerRateLimiter::new(settings.mode, egress),
            config: settings.ingress,
            staleness_period: settings.staleness_period,
            metrics,
            advertised: DashMap::new(),
        })
    }

    pub fn metrics(&self) -> Arc<dyn LimiterMetrics> {
        self.metrics.clone()
    }

    /// A liveness tracker for one connection, configured with this node's
    /// staleness period.
    pub fn tracker(&self, peer: PeerId) -> Arc<TrackedConnection> {
        Arc::new(TrackedConnection::new(peer, self.staleness_period))
    }

    /// The one-shot handshake frame carrying the local ingress budget.
    pub fn advertisement(&self) -> RateLimitAdvertisement {
        RateLimitAdvertisement::from_config(&self.config)
    }

    /// Records the budget a remote peer advertised to us.
    pub fn note_remote_limit(&self, peer: PeerId, config: RateLimitConfig) {
        self.advertised.insert(peer, config);
    }

    /// The budget the remote advertised, if it sent one. Peers that predate
    /// rate limiting never advertise; that is not an error.
    pub fn remote_limit(&self, peer: &PeerId) -> Option<RateLimitConfig> {
        self.advertised.get(peer).map(|entry| *entry.value())
    }

    pub fn forget_remote_limit(&self, peer: &PeerId) {
        self.advertised.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use std::time::Duration;

    struct TestPeer {
        id: PeerId,
        addr: Option<Multiaddr>,
    }

    impl PeerHandle for TestPeer {
        fn peer_id(&self) -> PeerId {
            self.id
        }

        fn remote_addr(&self) -> Option<Multiaddr> {
            self.addr.clone()
        }
    }

    fn hourly_settings(mode: IdentityMode) -> LimiterSettings {
        let config = RateLimitConfig {
            interval: Duration::from_secs(3600),
            capacity: 10 << 10,
            quantum: 1 << 10,
        };
        LimiterSettings {
            mode,
            ingress: config,
            egress: config,
            staleness_period: Duration::ZERO,
        }
    }

    fn open_limiters(mode: IdentityMode) -> (tempfile::TempDir, RelayLimiters) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let limiters =
            RelayLimiters::open(&db, &hourly_settings(mode), Arc::new(NoopMetrics)).unwrap();
        (dir, limiters)
    }

    fn peer_at(addr: &str) -> TestPeer {
        TestPeer {
            id: PeerId::random(),
            addr: Some(addr.parse().unwrap()),
        }
    }

    #[test]
    fn identity_mode_keeps_colocated_peers_independent() {
        let (_dir, limiters) = open_limiters(IdentityMode::ByPublicIdentity);
        let first = peer_at("/ip4/10.0.0.1/tcp/30303");
        let second = peer_at("/ip4/10.0.0.1/tcp/30304");

        assert_eq!(limiters.ingress.take_available(&first, 10 << 10), 10 << 10);
        // Same IP, different identity: untouched budget.
        assert_eq!(limiters.ingress.take_available(&second, 10 << 10), 10 << 10);
    }

    #[test]
    fn address_mode_groups_peers_behind_one_ip() {
        let (_dir, limiters) = open_limiters(IdentityMode::BySourceAddress);
        let first = peer_at("/ip4/10.0.0.1/tcp/30303");
        let second = peer_at("/ip4/10.0.0.1/tcp/30304");
        let elsewhere = peer_at("/ip4/10.0.0.2/tcp/30303");

        assert_eq!(limiters.ingress.take_available(&first, 10 << 10), 10 << 10);
        // Port differs, address matches: shared bucket, already drained.
        assert_eq!(limiters.ingress.take_available(&second, 1), 0);
        // Different address: own bucket.
        assert_eq!(limiters.ingress.take_available(&elsewhere, 1), 1);
    }

    #[test]
    fn address_mode_rejects_peers_without_addresses() {
        let (_dir, limiters) = open_limiters(IdentityMode::BySourceAddress);
        let anonymous = TestPeer {
            id: PeerId::random(),
            addr: None,
        };

        assert!(matches!(
            limiters
                .ingress
                .create(&anonymous, &RateLimitConfig::default()),
            Err(LimiterError::Identity(IdentityError::MissingSourceAddress))
        ));
        // The infallible path denies rather than admitting unkeyed traffic.
        assert_eq!(limiters.ingress.take_available(&anonymous, 1), 0);
    }

    #[test]
    fn directions_do_not_share_budgets() {
        let (_dir, limiters) = open_limiters(IdentityMode::ByPublicIdentity);
        let peer = peer_at("/ip4/10.0.0.1/tcp/30303");

        assert_eq!(limiters.ingress.take_available(&peer, 10 << 10), 10 << 10);
        assert_eq!(limiters.egress.available(&peer), 10 << 10);
    }

    #[test]
    fn trackers_inherit_the_staleness_period() {
        let (_dir, limiters) = open_limiters(IdentityMode::ByPublicIdentity);
        let peer = PeerId::random();
        let tracker = limiters.tracker(peer);
        assert_eq!(tracker.id(), peer);
        // Settings carry a zero period: the watchdog stays disabled.
        assert!(!tracker.is_flaky(u64::MAX));
    }

    #[test]
    fn remote_limit_registry_roundtrip() {
        let (_dir, limiters) = open_limiters(IdentityMode::ByPublicIdentity);
        let peer = PeerId::random();

        assert_eq!(limiters.remote_limit(&peer), None);
        limiters.note_remote_limit(peer, RateLimitConfig::default());
        assert_eq!(
            limiters.remote_limit(&peer),
            Some(RateLimitConfig::default())
        );
        limiters.forget_remote_limit(&peer);
        assert_eq!(limiters.remote_limit(&peer), None);
    }
}
