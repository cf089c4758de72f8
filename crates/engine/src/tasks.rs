//! Transaction tasks
//!
//! Each store operation moves its target into a transitional state and
//! enlists one of these tasks. The task contributes the persistence record
//! and, on commit or rollback, finishes the transition and notifies the
//! item's hooks.
//!
//! Hooks are called after the link's slot lock is released.

use crate::link::ItemLink;
use crate::store::Runtime;
use msgstore_concurrency::TransactionTask;
use msgstore_core::{
    DataSlice, ItemHooks, ItemState, LockId, StorageStrategy, StoreResult, TransactionId,
};
use msgstore_durability::{CommitBatch, PersistedRecord};
use std::sync::Arc;
use tracing::error;

fn hooks(link: &ItemLink) -> Option<ItemHooks<'_>> {
    if link.owns_item() {
        Some(link.item().hooks())
    } else {
        None
    }
}

fn spilling(link: &ItemLink) -> bool {
    link.parent().map_or(false, |parent| parent.is_spilling())
}

fn push(batch: &mut CommitBatch, link: &ItemLink, record: PersistedRecord) {
    batch.push(record, link.strategy(), spilling(link));
}

/// Finish or undo an add
pub(crate) struct AddTask {
    runtime: Arc<Runtime>,
    link: Arc<ItemLink>,
    referred: Option<Arc<ItemLink>>,
    data: Vec<DataSlice>,
}

impl AddTask {
    pub(crate) fn new(
        runtime: Arc<Runtime>,
        link: Arc<ItemLink>,
        referred: Option<Arc<ItemLink>>,
    ) -> Self {
        AddTask {
            runtime,
            link,
            referred,
            data: Vec::new(),
        }
    }
}

impl TransactionTask for AddTask {
    fn describe(&self) -> String {
        format!("add {:?} {}", self.link.kind(), self.link.id())
    }

    fn precommit(&mut self, tx: TransactionId) -> StoreResult<()> {
        if let Some(hook) = hooks(&self.link).and_then(|h| h.precommit_add) {
            hook.on_precommit_add(tx)?;
        }
        if self.link.owns_item() && self.link.strategy() != StorageStrategy::Never {
            self.data = self.link.item().persistent_data()?;
        }
        Ok(())
    }

    fn records(&self, batch: &mut CommitBatch) {
        let record = PersistedRecord::Add(self.link.entity_record(self.data.clone()));
        push(batch, &self.link, record);
    }

    fn commit(&mut self, tx: TransactionId) {
        if !self.link.commit_add() {
            return;
        }
        self.runtime.expirer().track(&self.link);
        if let Some(hook) = hooks(&self.link).and_then(|h| h.commit_add) {
            hook.on_commit_add(tx);
        }
    }

    fn rollback(&mut self, tx: TransactionId) {
        if !self.link.rollback_add() {
            return;
        }
        self.runtime.unlink(&self.link);
        if let Some(referred) = &self.referred {
            referred.decrement_references();
        }
        if let Some(hook) = hooks(&self.link).and_then(|h| h.rollback_add) {
            hook.on_rollback_add(tx);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoveMode {
    Remove,
    Expire,
}

/// Finish or undo a remove or an expiry
pub(crate) struct RemoveTask {
    runtime: Arc<Runtime>,
    link: Arc<ItemLink>,
    mode: RemoveMode,
}

impl RemoveTask {
    /// Remove begun by `ItemLink::begin_remove` or `try_begin_remove`
    pub(crate) fn remove(runtime: Arc<Runtime>, link: Arc<ItemLink>) -> Self {
        RemoveTask {
            runtime,
            link,
            mode: RemoveMode::Remove,
        }
    }

    /// Expiry begun by `ItemLink::try_begin_expiry`
    pub(crate) fn expire(runtime: Arc<Runtime>, link: Arc<ItemLink>) -> Self {
        RemoveTask {
            runtime,
            link,
            mode: RemoveMode::Expire,
        }
    }
}

impl TransactionTask for RemoveTask {
    fn describe(&self) -> String {
        match self.mode {
            RemoveMode::Remove => format!("remove {}", self.link.id()),
            RemoveMode::Expire => format!("expire {}", self.link.id()),
        }
    }

    fn records(&self, batch: &mut CommitBatch) {
        push(batch, &self.link, PersistedRecord::Remove { id: self.link.id() });
    }

    fn commit(&mut self, tx: TransactionId) {
        let done = match self.mode {
            RemoveMode::Remove => self.link.commit_remove(),
            RemoveMode::Expire => self.link.commit_expiry(),
        };
        if !done {
            return;
        }
        self.runtime.unlink(&self.link);
        if let Some(referred) = self.link.referred().and_then(|id| self.runtime.link(id)) {
            referred.decrement_references();
        }
        if let Some(hooks) = hooks(&self.link) {
            if self.mode == RemoveMode::Expire && !self.link.item().can_expire_silently() {
                if let Some(hook) = hooks.expiry {
                    hook.on_expiry(tx);
                }
            }
            if let Some(hook) = hooks.commit_remove {
                hook.on_commit_remove(tx);
            }
        }
    }

    fn rollback(&mut self, tx: TransactionId) {
        match self.mode {
            RemoveMode::Remove => {
                if self.link.rollback_remove() {
                    if let Some(hook) = hooks(&self.link).and_then(|h| h.rollback_remove) {
                        hook.on_rollback_remove(tx);
                    }
                }
            }
            RemoveMode::Expire => {
                self.link.rollback_expiry();
            }
        }
    }
}

/// Persist an update's new data
pub(crate) struct UpdateTask {
    link: Arc<ItemLink>,
    data: Vec<DataSlice>,
}

impl UpdateTask {
    pub(crate) fn new(link: Arc<ItemLink>) -> Self {
        UpdateTask {
            link,
            data: Vec::new(),
        }
    }
}

impl TransactionTask for UpdateTask {
    fn describe(&self) -> String {
        format!("update {}", self.link.id())
    }

    fn precommit(&mut self, _tx: TransactionId) -> StoreResult<()> {
        self.data = self.link.item().persistent_data()?;
        Ok(())
    }

    fn records(&self, batch: &mut CommitBatch) {
        let record = PersistedRecord::Update {
            id: self.link.id(),
            data: self.data.clone(),
        };
        push(batch, &self.link, record);
    }

    fn commit(&mut self, tx: TransactionId) {
        if self.link.finish_update() {
            if let Some(hook) = hooks(&self.link).and_then(|h| h.commit_update) {
                hook.on_commit_update(tx);
            }
        }
    }

    fn rollback(&mut self, tx: TransactionId) {
        if self.link.finish_update() {
            if let Some(hook) = hooks(&self.link).and_then(|h| h.rollback_update) {
                hook.on_rollback_update(tx);
            }
        }
    }
}

/// Make an in-memory lock durable
pub(crate) struct PersistLockTask {
    link: Arc<ItemLink>,
    lock_id: LockId,
    reserved: bool,
}

impl PersistLockTask {
    pub(crate) fn new(link: Arc<ItemLink>, lock_id: LockId) -> Self {
        PersistLockTask {
            link,
            lock_id,
            reserved: false,
        }
    }
}

impl TransactionTask for PersistLockTask {
    fn describe(&self) -> String {
        format!("persist lock {} on {}", self.lock_id, self.link.id())
    }

    fn precommit(&mut self, _tx: TransactionId) -> StoreResult<()> {
        self.link.reserve_persist_lock(self.lock_id)?;
        self.reserved = true;
        Ok(())
    }

    fn records(&self, batch: &mut CommitBatch) {
        let record = PersistedRecord::PersistLock {
            id: self.link.id(),
            lock_id: self.lock_id,
        };
        push(batch, &self.link, record);
    }

    fn commit(&mut self, _tx: TransactionId) {
        self.reserved = false;
        self.link.commit_persist_lock(self.lock_id);
    }

    fn rollback(&mut self, _tx: TransactionId) {
        if std::mem::take(&mut self.reserved) {
            self.link.release_persist_lock();
        }
    }
}

/// Release a lock, durably when the lock was persisted
pub(crate) struct UnlockTask {
    link: Arc<ItemLink>,
    lock_id: LockId,
    persistent: bool,
}

impl UnlockTask {
    pub(crate) fn new(link: Arc<ItemLink>, lock_id: LockId) -> Self {
        UnlockTask {
            link,
            lock_id,
            persistent: false,
        }
    }
}

impl TransactionTask for UnlockTask {
    fn describe(&self) -> String {
        format!("unlock {} on {}", self.lock_id, self.link.id())
    }

    fn precommit(&mut self, _tx: TransactionId) -> StoreResult<()> {
        let state = self.link.check_lock(self.lock_id, "unlock")?;
        self.persistent = state == ItemState::PersistentlyLocked;
        Ok(())
    }

    fn records(&self, batch: &mut CommitBatch) {
        if self.persistent {
            push(batch, &self.link, PersistedRecord::PersistUnlock { id: self.link.id() });
        }
    }

    fn commit(&mut self, _tx: TransactionId) {
        match self.link.unlock(self.lock_id) {
            Ok(()) => {
                if let Some(hook) = hooks(&self.link).and_then(|h| h.unlocked) {
                    hook.on_unlocked();
                }
            }
            Err(e) => {
                error!(
                    target: "msgstore::store",
                    id = %self.link.id(),
                    error = %e,
                    "Lock changed between precommit and commit"
                );
            }
        }
    }

    fn rollback(&mut self, _tx: TransactionId) {}
}
