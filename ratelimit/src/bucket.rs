//! Token-bucket accounting for a single rate-limited identity.
//!
//! Pure state machine: every operation takes `now` in unix seconds so the
//! engine is deterministic under test and its state can be persisted and
//! reloaded across process restarts without losing accumulated time.

use serde::{Deserialize, Serialize};

/// Bucket state for one identity.
///
/// Invariants: `tokens <= capacity` at all times; refills are quantized to
/// whole intervals, monotonic in wall-clock time, and never retroactive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucket {
    capacity: u64,
    quantum: u64,
    interval_secs: u64,
    tokens: u64,
    last_refill: u64,
    /// Unix timestamp until which all takes are denied; zero when clear.
    blacklisted_until: u64,
}

impl TokenBucket {
    /// A fresh bucket at full capacity, accounting from `now`.
    pub fn full(capacity: u64, quantum: u64, interval_secs: u64, now: u64) -> Self {
        Self {
            capacity,
            quantum,
            interval_secs,
            tokens: capacity,
            last_refill: now,
            blacklisted_until: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Raw balance without the refill side effect; use [`Self::available`]
    /// for the accounting-correct value.
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn blacklisted_until(&self) -> u64 {
        self.blacklisted_until
    }

    pub fn set_blacklisted_until(&mut self, until: u64) {
        self.blacklisted_until = until;
    }

    /// Folds elapsed whole intervals into the balance. `last_refill` only
    /// ever advances by multiples of the interval, so partial intervals carry
    /// over to the next call instead of being rounded away or double-counted.
    fn refill(&mut self, now: u64) {
        if self.interval_secs == 0 {
            // Only reachable through a record that bypassed config
            // validation; treat as a frozen bucket rather than divide.
            return;
        }
        let elapsed_intervals = now.saturating_sub(self.last_refill) / self.interval_secs;
        if elapsed_intervals == 0 {
            return;
        }
        let gained = elapsed_intervals.saturating_mul(self.quantum);
        self.tokens = self.tokens.saturating_add(gained).min(self.capacity);
        self.last_refill = self
            .last_refill
            .saturating_add(elapsed_intervals.saturating_mul(self.interval_secs));
    }

    /// Debits up to `amount` tokens and returns how many were actually
    /// taken. Never blocks and never errors: the caller reads
    /// `taken < amount` as a quota violation. `amount == 0` is a pure peek
    /// that still applies the refill side effect.
    pub fn take_available(&mut self, amount: u64, now: u64) -> u64 {
        if now < self.blacklisted_until {
            return 0;
        }
        self.refill(now);
        let taken = amount.min(self.tokens);
        self.tokens -= taken;
        taken
    }

    /// All-or-nothing variant: debits `amount` only if the full amount fits,
    /// leaving the balance untouched otherwise. Used for egress gating so a
    /// denied oversized unit cannot burn the budget of smaller ones.
    pub fn take_exact(&mut self, amount: u64, now: u64) -> bool {
        if now < self.blacklisted_until {
            return false;
        }
        self.refill(now);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }

    /// Current balance after folding in elapsed refills, without debiting.
    pub fn available(&mut self, now: u64) -> u64 {
        if now < self.blacklisted_until {
            return 0;
        }
        self.refill(now);
        self.tokens
    }
}
