//! Item lifecycle states
//!
//! Every stored entity (item, reference or stream) is in exactly one of
//! these states. Transitions are driven by transaction commit/rollback and
//! by cursor lock/unlock; the engine's item link is the only place that
//! changes them.
//!
//! ```text
//!            add                commit
//! NotInStore ────► Adding ──────────────► Available ◄────────────┐
//!     ▲              │ rollback              │  │  ▲ unlock       │
//!     └──────────────┘                  lock │  │  │             │ commit/rollback
//!                                            ▼  │  │             │
//!                                       Locked ─┼──┘         Updating
//!                                        │   ▲  │                ▲
//!                          persist_lock  ▼   │  │ request_update │
//!                            PersistentlyLocked └────────────────┘
//!
//! Available / Locked / PersistentlyLocked ──remove──► Removing ──commit──► NotInStore
//! Available ──expiry deadline──► Expiring ──commit──► NotInStore
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a stored entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemState {
    /// Not linked into any stream
    NotInStore,
    /// Added under a transaction that has not completed
    Adding,
    /// Visible to finds and cursors
    Available,
    /// Locked in memory by a cursor
    Locked,
    /// Locked, and the lock has been made durable
    PersistentlyLocked,
    /// Data update pending under a transaction
    Updating,
    /// Removal pending under a transaction
    Removing,
    /// Claimed by the expirer; removal pending
    Expiring,
}

impl ItemState {
    /// Whether the entity is linked into a stream at all
    pub fn is_in_store(&self) -> bool {
        !matches!(self, ItemState::NotInStore)
    }

    /// Whether the entity is visible to finds and cursors
    pub fn is_available(&self) -> bool {
        matches!(self, ItemState::Available)
    }

    /// Whether the entity holds a lock id
    pub fn is_locked(&self) -> bool {
        matches!(self, ItemState::Locked | ItemState::PersistentlyLocked)
    }

    /// Whether a transaction is in the middle of changing the entity
    pub fn is_in_transaction(&self) -> bool {
        matches!(
            self,
            ItemState::Adding | ItemState::Updating | ItemState::Removing | ItemState::Expiring
        )
    }

    /// Human-readable name
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::NotInStore => "NotInStore",
            ItemState::Adding => "Adding",
            ItemState::Available => "Available",
            ItemState::Locked => "Locked",
            ItemState::PersistentlyLocked => "PersistentlyLocked",
            ItemState::Updating => "Updating",
            ItemState::Removing => "Removing",
            ItemState::Expiring => "Expiring",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
