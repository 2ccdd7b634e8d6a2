//! Durable bucket records.
//!
//! Each limiter direction owns one sled tree, so two instances sharing a
//! physical database never observe each other's keys. Records carry a
//! leading format-version byte ahead of the bincode body so a format change
//! is detected and rejected instead of silently misread.

use serde::{Deserialize, Serialize};
use sled::Tree;
use thiserror::Error;

use crate::bucket::TokenBucket;

const RECORD_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(#[from] sled::Error),

    #[error("unsupported bucket record version {0}")]
    UnsupportedVersion(u8),

    #[error("corrupt bucket record: {0}")]
    Corrupt(#[from] bincode::Error),

    #[error("empty bucket record")]
    Empty,
}

/// What an identity maps to: a live bucket, or a blacklist tombstone left
/// behind by a timed removal. The serde tag keeps the two shapes
/// distinguishable on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Bucket(TokenBucket),
    Blacklisted { until: u64 },
}

/// Namespaced persistence for bucket records.
pub struct BucketStore {
    tree: Tree,
}

impl BucketStore {
    /// Opens (or creates) the named tree on a shared database handle.
    pub fn open(db: &sled::Db, namespace: &str) -> Result<Self, StoreError> {
        Ok(Self {
            tree: db.open_tree(namespace)?,
        })
    }

    pub fn load(&self, identity: &[u8]) -> Result<Option<Record>, StoreError> {
        match self.tree.get(identity)? {
            None => Ok(None),
            Some(raw) => decode_record(&raw).map(Some),
        }
    }

    pub fn save(&self, identity: &[u8], record: &Record) -> Result<(), StoreError> {
        self.tree.insert(identity, encode_record(record)?)?;
        Ok(())
    }

    pub fn delete(&self, identity: &[u8]) -> Result<(), StoreError> {
        self.tree.remove(identity)?;
        Ok(())
    }

    /// Blocks until all pending writes reach disk. Sled flushes on its own
    /// cadence; call this on orderly shutdown.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.tree.flush()?;
        Ok(())
    }
}

fn encode_record(record: &Record) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::with_capacity(64);
    buf.push(RECORD_VERSION);
    bincode::serialize_into(&mut buf, record)?;
    Ok(buf)
}

fn decode_record(raw: &[u8]) -> Result<Record, StoreError> {
    match raw.split_first() {
        None => Err(StoreError::Empty),
        Some((&RECORD_VERSION, body)) => Ok(bincode::deserialize(body)?),
        Some((&version, _)) => Err(StoreError::UnsupportedVersion(version)),
    }
}
