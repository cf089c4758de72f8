//! Core types and traits for the message store
//!
//! This crate defines the foundational types used throughout the system:
//! - ItemId, LockId, TransactionId: identifiers
//! - StorageStrategy: per-item durability policy
//! - ItemState: the per-item lifecycle state machine states
//! - DataSlice: opaque persistent data and its framing codec
//! - Item: the application item capability, with opt-in lifecycle hooks
//! - Filter: predicate used by finds, removes and cursors
//! - StoreError: error hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod data;
pub mod error;
pub mod filter;
pub mod item;
pub mod state;
pub mod types;

pub use data::{data_size, decode_slices, encode_slices, DataSlice, PersistentData};
pub use error::{ErrorKind, StoreError, StoreResult};
pub use filter::{filter_matches, Filter, MatchAll};
pub use item::{
    downcast_item, Item, ItemHooks, ItemRestorer, OnCommitAdd, OnCommitRemove, OnCommitUpdate,
    OnExpiry, OnPrecommitAdd, OnRestored, OnRollbackAdd, OnRollbackRemove, OnRollbackUpdate,
    OnUnlocked, DEFAULT_IN_MEMORY_SIZE,
};
pub use state::ItemState;
pub use types::{
    now_millis, ItemId, LockId, StorageStrategy, TransactionId, DEFAULT_PRIORITY, MAX_PRIORITY,
    MIN_PRIORITY,
};
