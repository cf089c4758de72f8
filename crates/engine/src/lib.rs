//! Message store engine
//!
//! This crate ties the lower layers together into the public store:
//! - MessageStore: lifecycle, root streams, unique ids, expirer control
//! - ItemStream / ReferenceStream: ordered collections with statistics,
//!   spill state, depth limits and the find/remove-first-matching protocol
//! - Cursors: locking and non-locking walks in stream order
//! - ItemHandle: per-item lock, unlock, remove and update
//! - Expirer: background removal of items past their time in store
//! - Recovery: rebuilding the stream tree from persisted records
//!
//! Every stored entity is represented by an item link that owns its state
//! machine. Streams own their member links; references name their target
//! by id, so there are no ownership cycles.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod container;
mod cursor;
mod expirer;
mod handle;
mod link;
mod reference;
mod statistics;
mod store;
mod stream;
mod tasks;

pub use cursor::{LockingCursor, NonLockingCursor};
pub use expirer::ExpirerStats;
pub use handle::ItemHandle;
pub use reference::ReferenceStream;
pub use statistics::Statistics;
pub use store::{HealthState, MessageStore, StoreConfig, StoreState, CONFIG_FILE_NAME};
pub use stream::{ItemStream, StreamDescriptor, STREAM_DESCRIPTOR_TYPE};
