//! msgstore - embedded transactional message-item store
//!
//! Applications keep their own item types in ordered streams. Every change
//! (add, remove, lock persistence, update) happens under a transaction and
//! is made durable according to the item's storage strategy before the
//! commit returns.
//!
//! # Quick Start
//!
//! ```no_run
//! use msgstore::{MessageStore, StoreConfig, StreamDescriptor};
//! use std::sync::Arc;
//!
//! let store = MessageStore::open(StoreConfig::for_directory("/tmp/msgstore"))?;
//! let tx = store.begin_local()?;
//! let queue = store.add_item_stream(Arc::new(StreamDescriptor::new("queue")), &tx)?;
//! tx.commit()?;
//!
//! let mut cursor = queue.new_locking_item_cursor(None)?;
//! while let Some(item) = cursor.next()? {
//!     let tx = store.begin_auto_commit()?;
//!     item.remove(&tx, Some(cursor.lock_id()))?;
//! }
//! store.stop_default()?;
//! # Ok::<(), msgstore::StoreError>(())
//! ```
//!
//! # Architecture
//!
//! - `msgstore-core`: ids, states, the item capability and the error type
//! - `msgstore-durability`: record format and persistence managers
//! - `msgstore-concurrency`: transactions and the commit protocol
//! - `msgstore-engine`: streams, cursors, the expirer and the store facade

pub use msgstore_concurrency::{
    PendingWork, Transaction, TransactionKind, TransactionMetrics, TransactionState,
};
pub use msgstore_core::{
    downcast_item, filter_matches, DataSlice, ErrorKind, Filter, Item, ItemHooks, ItemId,
    ItemState, LockId, MatchAll, OnCommitAdd, OnCommitRemove, OnCommitUpdate, OnExpiry,
    OnPrecommitAdd, OnRestored, OnRollbackAdd, OnRollbackRemove, OnRollbackUpdate, OnUnlocked,
    PersistentData, StorageStrategy, StoreError, StoreResult, TransactionId, DEFAULT_PRIORITY,
    MAX_PRIORITY, MIN_PRIORITY,
};
pub use msgstore_durability::{EntityKind, PersistenceCounters, PersistenceKind};
pub use msgstore_engine::*;
