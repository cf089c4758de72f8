//! Persistence manager contract
//!
//! The store talks to disk only through [`PersistenceManager`]. Two
//! implementations ship with the crate:
//!
//! | Manager | Files | Survives restart |
//! |---------|-------|------------------|
//! | [`FileLogPersistence`](crate::FileLogPersistence) | log, permanent store, spill | yes |
//! | [`InMemoryPersistence`](crate::InMemoryPersistence) | none | no |
//!
//! The manager is selected by [`PersistenceKind`], normally read from the
//! store configuration.

use crate::file::FileLogPersistence;
use crate::memory::InMemoryPersistence;
use crate::record::{CommitBatch, IdGeneratorKind};
use crate::recovery::RecoveredState;
use msgstore_core::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Which persistence manager implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceKind {
    /// CRC-framed log plus checkpointed permanent store
    #[default]
    File,
    /// Nothing written; everything lost on stop
    Memory,
}

impl FromStr for PersistenceKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(PersistenceKind::File),
            "memory" => Ok(PersistenceKind::Memory),
            other => Err(StoreError::invalid_config(format!(
                "unknown persistence manager '{}': expected \"file\" or \"memory\"",
                other
            ))),
        }
    }
}

/// Fsync policy for records that do not demand an immediate sync
///
/// Whichever threshold is reached first triggers the fsync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Maximum time between fsyncs in milliseconds
    pub interval_ms: u64,
    /// Maximum writes between fsyncs
    pub batch_size: usize,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy {
            interval_ms: 100,
            batch_size: 1000,
        }
    }
}

/// File persistence parameters
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Directory holding the log file
    pub log_directory: PathBuf,
    /// Directory holding the permanent store file
    pub permanent_store_directory: PathBuf,
    /// Directory holding the spill file
    pub temporary_store_directory: PathBuf,
    /// Log size (bytes) that triggers a checkpoint
    pub log_file_size: u64,
    /// Maximum permanent store file size in bytes
    pub permanent_store_file_max_size: u64,
    /// Deferred fsync policy
    pub sync_policy: SyncPolicy,
}

impl PersistenceConfig {
    /// Default sizes with all three directories under `dir`
    pub fn for_directory(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        PersistenceConfig {
            log_directory: dir.join("log"),
            permanent_store_directory: dir.join("permanent"),
            temporary_store_directory: dir.join("temporary"),
            log_file_size: 16 * 1024 * 1024,
            permanent_store_file_max_size: 256 * 1024 * 1024,
            sync_policy: SyncPolicy::default(),
        }
    }

    /// Set the checkpoint threshold (builder pattern)
    pub fn with_log_file_size(mut self, bytes: u64) -> Self {
        self.log_file_size = bytes;
        self
    }

    /// Set the permanent store limit (builder pattern)
    pub fn with_permanent_store_file_max_size(mut self, bytes: u64) -> Self {
        self.permanent_store_file_max_size = bytes;
        self
    }

    /// Path of the log file
    pub fn log_path(&self) -> PathBuf {
        self.log_directory.join("msgstore.log")
    }

    /// Path of the permanent store file
    pub fn permanent_store_path(&self) -> PathBuf {
        self.permanent_store_directory.join("msgstore.store")
    }

    /// Path of the spill file
    pub fn spill_path(&self) -> PathBuf {
        self.temporary_store_directory.join("msgstore.spill")
    }
}

/// Options for [`PersistenceManager::start`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Discard everything persisted before opening
    pub clean: bool,
}

/// Cumulative persistence counters
///
/// Accumulate over the lifetime of the manager and are never reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceCounters {
    /// Commit frames appended to the log
    pub log_appends: u64,
    /// Frames appended to the spill file
    pub spill_appends: u64,
    /// fsync calls
    pub sync_calls: u64,
    /// Bytes written across all files
    pub bytes_written: u64,
    /// Checkpoints completed
    pub checkpoints: u64,
}

/// Durable storage for committed store state
///
/// Calls arrive from many threads; implementations serialize internally.
/// `write` is the durability point of a commit: once it returns `Ok`, every
/// `Always` record in the batch is on disk.
pub trait PersistenceManager: Send + Sync {
    /// Implementation name, used in logs
    fn name(&self) -> &'static str;

    /// Whether anything survives a restart
    fn is_persistent(&self) -> bool;

    /// Open files and load what was persisted before
    fn start(&self, options: &StartOptions) -> StoreResult<()>;

    /// State loaded by `start`
    ///
    /// The first call after `start` hands over the replayed state; later
    /// calls return the manager's current view.
    fn recover(&self) -> StoreResult<RecoveredState>;

    /// Write the records of one commit according to their strategies
    fn write(&self, batch: &CommitBatch) -> StoreResult<()>;

    /// Durably record that ids below `high_water` may have been issued
    fn reserve_ids(&self, generator: IdGeneratorKind, high_water: u64) -> StoreResult<()>;

    /// Force deferred writes to disk
    fn flush(&self) -> StoreResult<()>;

    /// Flush and close; idempotent
    fn stop(&self) -> StoreResult<()>;

    /// Lifetime counters
    fn counters(&self) -> PersistenceCounters {
        PersistenceCounters::default()
    }
}

/// Build the manager selected by `kind`
///
/// `config` is ignored by the in-memory manager.
pub fn create_persistence_manager(
    kind: PersistenceKind,
    config: PersistenceConfig,
) -> Arc<dyn PersistenceManager> {
    match kind {
        PersistenceKind::File => Arc::new(FileLogPersistence::new(config)),
        PersistenceKind::Memory => Arc::new(InMemoryPersistence::new()),
    }
}
