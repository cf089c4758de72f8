//! Core types for the message store
//!
//! This module defines the foundational types:
//! - ItemId: Store-wide identifier of an item, reference or stream
//! - LockId: Opaque token issued when an item is locked
//! - TransactionId: Identifier of a unit of work
//! - StorageStrategy: Per-item durability policy
//! - Priority bounds used for stream ordering

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a stored entity (item, reference or stream)
///
/// Ids are allocated by the store's unique id generator and never repeat,
/// including across restarts of a persistent store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(u64);

impl ItemId {
    /// Wrap a raw id value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item-{}", self.0)
    }
}

/// Opaque lock token
///
/// Issued when an item is locked by a locking cursor (or explicitly). The
/// same token must be presented to unlock or remove the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockId(u64);

impl LockId {
    /// Lock id held by items that are locked for expiry
    pub const EXPIRY: LockId = LockId(u64::MAX);

    /// Wrap a raw lock value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw lock value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == LockId::EXPIRY {
            write!(f, "lock-expiry")
        } else {
            write!(f, "lock-{}", self.0)
        }
    }
}

/// Identifier of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Wrap a raw transaction id
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw transaction id
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Durability policy of a stored item
///
/// Strategies are ordered from least to most durable. A contained entity
/// may never be more durable than the stream that holds it.
///
/// | Strategy | Written | fsync | Survives restart |
/// |----------|---------|-------|------------------|
/// | Never | no | no | no |
/// | Maybe | only while the stream spills | no | no |
/// | Eventually | on commit | deferred | yes (after flush) |
/// | Always | on commit | before commit returns | yes |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StorageStrategy {
    /// Never persisted
    Never,
    /// Persisted best-effort when memory pressure requires it
    Maybe,
    /// Persisted, but the write may be deferred past commit
    Eventually,
    /// Persisted durably before the commit completes
    Always,
}

impl StorageStrategy {
    /// Whether records of this strategy are recovered after a restart
    pub fn survives_restart(&self) -> bool {
        matches!(self, StorageStrategy::Eventually | StorageStrategy::Always)
    }

    /// Whether commit must wait for the write to reach disk
    pub fn requires_sync(&self) -> bool {
        matches!(self, StorageStrategy::Always)
    }

    /// Human-readable name
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageStrategy::Never => "never",
            StorageStrategy::Maybe => "maybe",
            StorageStrategy::Eventually => "eventually",
            StorageStrategy::Always => "always",
        }
    }
}

impl Default for StorageStrategy {
    fn default() -> Self {
        StorageStrategy::Always
    }
}

impl fmt::Display for StorageStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowest item priority
pub const MIN_PRIORITY: u8 = 0;
/// Highest item priority
pub const MAX_PRIORITY: u8 = 9;
/// Priority used when an item does not specify one
pub const DEFAULT_PRIORITY: u8 = 4;

/// Current wall-clock time in milliseconds since the Unix epoch
///
/// Expiry deadlines are stored in this unit so they remain meaningful
/// across restarts.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
