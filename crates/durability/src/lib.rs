//! Durability layer for the message store
//!
//! This crate handles everything that touches disk:
//!
//! - Record format: one `PersistedRecord` per durable change, grouped into
//!   commit batches tagged with storage strategies
//! - Encoding: CRC-framed bincode frames behind a versioned file header
//! - Persistence managers: the `PersistenceManager` contract, a file-backed
//!   log + checkpoint implementation and an in-memory one
//! - Replay: rebuilding the live entity set from persisted frames
//! - Unique ids: block-reserved generators that never repeat across restarts

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod encoding;
pub mod file;
pub mod manager;
pub mod memory;
pub mod record;
pub mod recovery;
pub mod unique_id;

pub use file::FileLogPersistence;
pub use manager::{
    create_persistence_manager, PersistenceConfig, PersistenceCounters, PersistenceKind,
    PersistenceManager, StartOptions, SyncPolicy,
};
pub use memory::InMemoryPersistence;
pub use record::{
    BatchEntry, CommitBatch, EntityKind, EntityRecord, IdGeneratorKind, LogFrame, PersistedRecord,
};
pub use recovery::{RecoveredEntity, RecoveredState, ReplayStats};
pub use unique_id::UniqueIdGenerator;
