//! Unique id generation
//!
//! Ids are handed out from blocks. Before the first id of a block is
//! issued, the end of the block is recorded through the persistence
//! manager, so after a restart the generator resumes above every id that
//! could have been issued and ids never repeat.

use crate::manager::PersistenceManager;
use crate::record::IdGeneratorKind;
use msgstore_core::{StoreError, StoreResult};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

struct IdBlock {
    next: u64,
    limit: u64,
}

/// Monotonic id source backed by durable block reservations
pub struct UniqueIdGenerator {
    kind: IdGeneratorKind,
    block_size: u64,
    persistence: Arc<dyn PersistenceManager>,
    block: Mutex<IdBlock>,
}

impl UniqueIdGenerator {
    /// Generator whose first id is `start`
    ///
    /// `start` must be at or above the recovered high-water mark for `kind`.
    pub fn new(
        kind: IdGeneratorKind,
        start: u64,
        block_size: u64,
        persistence: Arc<dyn PersistenceManager>,
    ) -> Self {
        UniqueIdGenerator {
            kind,
            block_size: block_size.max(1),
            persistence,
            block: Mutex::new(IdBlock {
                next: start,
                limit: start,
            }),
        }
    }

    /// Which generator this is
    pub fn kind(&self) -> IdGeneratorKind {
        self.kind
    }

    /// Issue the next id
    ///
    /// # Errors
    ///
    /// Propagates the persistence failure when a new block cannot be
    /// reserved; no id is issued in that case.
    pub fn next_id(&self) -> StoreResult<u64> {
        let mut block = self.block.lock();
        if block.next >= block.limit {
            let limit = block
                .next
                .checked_add(self.block_size)
                .ok_or_else(|| StoreError::internal(format!("{} ids exhausted", self.kind.as_str())))?;
            self.persistence.reserve_ids(self.kind, limit)?;
            trace!(
                target: "msgstore::persistence",
                generator = self.kind.as_str(),
                limit,
                "Reserved id block"
            );
            block.limit = limit;
        }
        let id = block.next;
        block.next += 1;
        Ok(id)
    }

    /// Next id that would be issued
    pub fn peek(&self) -> u64 {
        self.block.lock().next
    }
}

impl std::fmt::Debug for UniqueIdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let block = self.block.lock();
        f.debug_struct("UniqueIdGenerator")
            .field("kind", &self.kind)
            .field("next", &block.next)
            .field("limit", &block.limit)
            .finish()
    }
}
