//! Identity-keyed rate limiting over durable bucket state.
//!
//! The facade serializes every load-mutate-persist sequence per identity
//! through a striped lock pool: operations on one identity never race each
//! other, operations on unrelated identities almost never contend.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, error};

use crate::bucket::TokenBucket;
use crate::config::{ConfigError, RateLimitConfig};
use crate::metrics::LimiterMetrics;
use crate::network::peer::IdentityError;
use crate::store::{BucketStore, Record, StoreError};

const LOCK_STRIPES: usize = 64;

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Wall-clock source. Buckets account in unix seconds (never `Instant`)
/// because their state must survive process restarts.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> u64;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Rate limiter for opaque byte-string identities.
///
/// Buckets are created lazily: `take_available`/`available` on an unknown
/// identity install a full bucket with the instance's default config first.
/// This is intentional convenience: callers are not required to `create`
/// before first use.
pub struct RateLimiter {
    store: BucketStore,
    default_config: RateLimitConfig,
    stripes: Vec<Mutex<()>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn LimiterMetrics>,
}

impl RateLimiter {
    pub fn new(
        store: BucketStore,
        default_config: RateLimitConfig,
        metrics: Arc<dyn LimiterMetrics>,
    ) -> Result<Self, ConfigError> {
        default_config.validate()?;
        Ok(Self {
            store,
            default_config,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            clock: Arc::new(SystemClock),
            metrics,
        })
    }

    /// Replaces the wall clock; tests pin accounting to a manual clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.default_config
    }

    fn lock_identity(&self, identity: &[u8]) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        identity.hash(&mut hasher);
        let stripe = &self.stripes[hasher.finish() as usize % LOCK_STRIPES];
        // A poisoned stripe only means another thread panicked while holding
        // it; the guarded data lives in sled, so the lock stays usable.
        match stripe.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn fresh_bucket(&self, config: &RateLimitConfig, now: u64) -> TokenBucket {
        TokenBucket::full(config.capacity, config.quantum, config.interval_secs(), now)
    }

    /// Initializes a full-capacity bucket for `identity` if none exists.
    /// A live bucket is left untouched (re-create does not reset accumulated
    /// tokens) and an active blacklist entry makes this a no-op without
    /// clearing the blacklist.
    pub fn create(&self, identity: &[u8], config: &RateLimitConfig) -> Result<(), LimiterError> {
        config.validate()?;
        let now = self.clock.now_unix();
        let _guard = self.lock_identity(identity);
        match self.store.load(identity)? {
            Some(Record::Blacklisted { until }) if now < until => {
                debug!(
                    identity = %hex::encode(identity),
                    until,
                    "create is a no-op for a blacklisted identity"
                );
                Ok(())
            }
            Some(Record::Bucket(_)) => Ok(()),
            Some(Record::Blacklisted { .. }) | None => {
                let bucket = self.fresh_bucket(config, now);
                self.store.save(identity, &Record::Bucket(bucket))?;
                Ok(())
            }
        }
    }

    /// Deletes the identity's bucket. A nonzero `duration` additionally
    /// blacklists the identity until `now + duration`; zero means "forget
    /// this identity", which also clears any active blacklist entry. This is
    /// the explicit un-ban operation.
    pub fn remove(&self, identity: &[u8], duration: Duration) -> Result<(), LimiterError> {
        let _guard = self.lock_identity(identity);
        if duration.is_zero() {
            self.store.delete(identity)?;
        } else {
            let until = self.clock.now_unix().saturating_add(duration.as_secs());
            debug!(identity = %hex::encode(identity), until, "identity blacklisted");
            self.store.save(identity, &Record::Blacklisted { until })?;
        }
        Ok(())
    }

    /// Fallible core of [`Self::take_available`].
    pub fn try_take_available(&self, identity: &[u8], amount: u64) -> Result<u64, StoreError> {
        let now = self.clock.now_unix();
        let _guard = self.lock_identity(identity);
        let mut bucket = match self.store.load(identity)? {
            Some(Record::Bucket(bucket)) => bucket,
            Some(Record::Blacklisted { until }) if now < until => return Ok(0),
            Some(Record::Blacklisted { .. }) | None => {
                self.fresh_bucket(&self.default_config, now)
            }
        };
        let taken = bucket.take_available(amount, now);
        self.store.save(identity, &Record::Bucket(bucket))?;
        Ok(taken)
    }

    /// Fallible core of [`Self::take_exact`].
    pub fn try_take_exact(&self, identity: &[u8], amount: u64) -> Result<bool, StoreError> {
        let now = self.clock.now_unix();
        let _guard = self.lock_identity(identity);
        let mut bucket = match self.store.load(identity)? {
            Some(Record::Bucket(bucket)) => bucket,
            Some(Record::Blacklisted { until }) if now < until => return Ok(false),
            Some(Record::Blacklisted { .. }) | None => {
                self.fresh_bucket(&self.default_config, now)
            }
        };
        let granted = bucket.take_exact(amount, now);
        self.store.save(identity, &Record::Bucket(bucket))?;
        Ok(granted)
    }

    /// Fallible core of [`Self::available`].
    pub fn try_available(&self, identity: &[u8]) -> Result<u64, StoreError> {
        let now = self.clock.now_unix();
        let _guard = self.lock_identity(identity);
        let mut bucket = match self.store.load(identity)? {
            Some(Record::Bucket(bucket)) => bucket,
            Some(Record::Blacklisted { until }) if now < until => return Ok(0),
            Some(Record::Blacklisted { .. }) | None => {
                self.fresh_bucket(&self.default_config, now)
            }
        };
        let balance = bucket.available(now);
        self.store.save(identity, &Record::Bucket(bucket))?;
        Ok(balance)
    }

    /// Debits up to `amount` tokens and returns how many were taken.
    /// Store failures deny (return 0): a bucket that cannot be read is
    /// treated as exhausted, never as unlimited.
    pub fn take_available(&self, identity: &[u8], amount: u64) -> u64 {
        self.try_take_available(identity, amount)
            .unwrap_or_else(|err| self.deny_on_store_failure(identity, err))
    }

    /// All-or-nothing debit; false if the full amount does not fit.
    /// Fails closed on store errors like [`Self::take_available`].
    pub fn take_exact(&self, identity: &[u8], amount: u64) -> bool {
        self.try_take_exact(identity, amount).unwrap_or_else(|err| {
            self.deny_on_store_failure(identity, err);
            false
        })
    }

    /// Current balance after folding in elapsed refills; the refill side
    /// effect is persisted. Fails closed on store errors.
    pub fn available(&self, identity: &[u8]) -> u64 {
        self.try_available(identity)
            .unwrap_or_else(|err| self.deny_on_store_failure(identity, err))
    }

    fn deny_on_store_failure(&self, identity: &[u8], err: StoreError) -> u64 {
        error!(
            identity = %hex::encode(identity),
            error = %err,
            "bucket state unavailable, denying request"
        );
        self.metrics.store_failure();
        0
    }
}
