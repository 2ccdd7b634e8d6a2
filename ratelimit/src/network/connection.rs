//! Connection liveness tracking, orthogonal to token accounting.

use libp2p::PeerId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Records the most recent inbound activity on one connection so the
/// messaging engine can proactively recycle idle or dead links.
///
/// A connection that has never carried inbound traffic counts as stale once
/// the staleness period is nonzero.
pub struct TrackedConnection {
    id: PeerId,
    staleness_period: Duration,
    /// Unix seconds of the last observed activity; zero until first update.
    last_observed: AtomicU64,
}

impl TrackedConnection {
    pub fn new(id: PeerId, staleness_period: Duration) -> Self {
        Self {
            id,
            staleness_period,
            last_observed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Records observed activity. Updates are monotonic: a stale timestamp
    /// arriving late never rolls the watermark back.
    pub fn update(&self, now_unix: u64) {
        self.last_observed.fetch_max(now_unix, Ordering::AcqRel);
    }

    /// Whether the connection has gone quiet for longer than the staleness
    /// period. Always false when the period is zero (watchdog disabled).
    pub fn is_flaky(&self, now_unix: u64) -> bool {
        if self.staleness_period.is_zero() {
            return false;
        }
        let last = self.last_observed.load(Ordering::Acquire);
        now_unix.saturating_sub(last) > self.staleness_period.as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_period_disables_watchdog() {
        let conn = TrackedConnection::new(PeerId::random(), Duration::ZERO);
        assert!(!conn.is_flaky(u64::MAX));
    }

    #[test]
    fn quiet_connection_goes_flaky() {
        let conn = TrackedConnection::new(PeerId::random(), Duration::from_secs(60));
        // Never updated: stale as soon as the period has any room to elapse.
        assert!(conn.is_flaky(61));

        conn.update(1_000);
        assert!(!conn.is_flaky(1_030));
        assert!(!conn.is_flaky(1_060));
        assert!(conn.is_flaky(1_061));
    }

    #[test]
    fn updates_are_monotonic() {
        let conn = TrackedConnection::new(PeerId::random(), Duration::from_secs(60));
        conn.update(2_000);
        conn.update(1_000);
        assert!(!conn.is_flaky(2_050));
    }
}
