//! In-memory persistence manager
//!
//! Accepts every write and keeps nothing. Stores running on it lose all
//! items when stopped; useful for tests and for purely transient data.

use crate::manager::{PersistenceCounters, PersistenceManager, StartOptions};
use crate::record::{CommitBatch, IdGeneratorKind};
use crate::recovery::RecoveredState;
use msgstore_core::{StoreError, StoreResult};
use parking_lot::Mutex;
use tracing::debug;

/// Persistence manager that records nothing
#[derive(Default)]
pub struct InMemoryPersistence {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    started: bool,
    counters: PersistenceCounters,
}

impl InMemoryPersistence {
    /// Create a manager
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceManager for InMemoryPersistence {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn start(&self, _options: &StartOptions) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.started {
            return Err(StoreError::persistence("memory persistence already started"));
        }
        inner.started = true;
        debug!(target: "msgstore::persistence", "Memory persistence started");
        Ok(())
    }

    fn recover(&self) -> StoreResult<RecoveredState> {
        if !self.inner.lock().started {
            return Err(StoreError::persistence("memory persistence not started"));
        }
        Ok(RecoveredState::new())
    }

    fn write(&self, batch: &CommitBatch) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if !inner.started {
            return Err(StoreError::persistence("memory persistence not started"));
        }
        if batch.log_records().next().is_some() {
            inner.counters.log_appends += 1;
        }
        Ok(())
    }

    fn reserve_ids(&self, _generator: IdGeneratorKind, _high_water: u64) -> StoreResult<()> {
        Ok(())
    }

    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    fn stop(&self) -> StoreResult<()> {
        self.inner.lock().started = false;
        Ok(())
    }

    fn counters(&self) -> PersistenceCounters {
        self.inner.lock().counters.clone()
    }
}
