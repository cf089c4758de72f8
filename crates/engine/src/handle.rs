//! Handles to stored entities
//!
//! An [`ItemHandle`] is what finds, removes, cursors and adds hand back. It
//! keeps the entity's link alive, so the item can still be inspected after
//! it left the store, but every operation that changes state first checks
//! that the store is started.

use crate::link::ItemLink;
use crate::store::StoreInner;
use crate::tasks::{PersistLockTask, RemoveTask, UnlockTask, UpdateTask};
use msgstore_concurrency::{Transaction, TransactionKind};
use msgstore_core::{
    downcast_item, Item, ItemId, ItemState, LockId, StorageStrategy, StoreError, StoreResult,
};
use msgstore_durability::EntityKind;
use std::sync::Arc;
use tracing::trace;

/// Handle to an item, a reference or a stream's own entity
#[derive(Clone)]
pub struct ItemHandle {
    store: Arc<StoreInner>,
    link: Arc<ItemLink>,
}

impl ItemHandle {
    pub(crate) fn new(store: Arc<StoreInner>, link: Arc<ItemLink>) -> Self {
        ItemHandle { store, link }
    }

    pub(crate) fn link(&self) -> &Arc<ItemLink> {
        &self.link
    }

    /// Entity id
    pub fn id(&self) -> ItemId {
        self.link.id()
    }

    /// Entity kind
    pub fn kind(&self) -> EntityKind {
        self.link.kind()
    }

    /// Whether this is a reference
    pub fn is_reference(&self) -> bool {
        self.link.kind() == EntityKind::Reference
    }

    /// Current lifecycle state
    pub fn state(&self) -> ItemState {
        self.link.state()
    }

    /// The application item; for a reference, the referred item
    pub fn item(&self) -> Arc<dyn Item> {
        Arc::clone(self.link.item())
    }

    /// The application item as a concrete type
    pub fn downcast<T: Item>(&self) -> Option<&T> {
        downcast_item::<T>(self.link.item().as_ref())
    }

    /// Lock currently held, if any
    pub fn lock_id(&self) -> Option<LockId> {
        self.link.lock_id()
    }

    /// Effective priority
    pub fn priority(&self) -> u8 {
        self.link.priority()
    }

    /// Effective storage strategy
    pub fn storage_strategy(&self) -> StorageStrategy {
        self.link.strategy()
    }

    /// Absolute expiry deadline in milliseconds since the epoch
    pub fn expiry_deadline(&self) -> Option<u64> {
        self.link.expiry_deadline()
    }

    /// Owning stream; `None` for root streams
    pub fn stream_id(&self) -> Option<ItemId> {
        self.link.parent_id()
    }

    /// Referred item id (references only)
    pub fn referred_id(&self) -> Option<ItemId> {
        self.link.referred()
    }

    /// How many times the item has been unlocked
    pub fn guess_unlock_count(&self) -> u64 {
        self.link.unlock_count()
    }

    /// How many removes of the item have rolled back
    pub fn guess_backout_count(&self) -> u64 {
        self.link.backout_count()
    }

    /// Number of references pointing at the item
    pub fn reference_count(&self) -> u64 {
        self.link.reference_count()
    }

    /// Lock the item with a fresh lock id
    ///
    /// # Errors
    /// `InvalidState` unless the item is `Available`.
    pub fn lock(&self) -> StoreResult<LockId> {
        let runtime = self.store.runtime()?;
        let lock_id = runtime.unique_lock_id(self.link.strategy())?;
        self.link.lock(lock_id)?;
        trace!(target: "msgstore::store", id = %self.id(), lock = %lock_id, "Locked");
        Ok(lock_id)
    }

    /// Make the current lock survive a restart when `tx` commits
    ///
    /// # Errors
    /// `InvalidState` unless the item is `Locked`.
    pub fn persist_lock(&self, tx: &Transaction) -> StoreResult<()> {
        let runtime = self.store.runtime()?;
        runtime.check_transaction(tx)?;
        let state = self.link.state();
        let lock_id = match (state, self.link.lock_id()) {
            (ItemState::Locked, Some(lock_id)) => lock_id,
            _ => return Err(StoreError::invalid_state(self.id(), state, "persist lock")),
        };
        tx.enlist(Box::new(PersistLockTask::new(Arc::clone(&self.link), lock_id)))
    }

    /// Release the lock `lock_id`
    ///
    /// Without a transaction the unlock takes effect at once; with one it
    /// takes effect when the transaction commits.
    ///
    /// # Errors
    /// `LockIdMismatch` if another lock is held, `InvalidState` if the item
    /// is not locked.
    pub fn unlock(&self, lock_id: LockId, tx: Option<&Transaction>) -> StoreResult<()> {
        let runtime = self.store.runtime()?;
        self.link.check_lock(lock_id, "unlock")?;
        let task = Box::new(UnlockTask::new(Arc::clone(&self.link), lock_id));
        match tx {
            Some(tx) => {
                runtime.check_transaction(tx)?;
                tx.enlist(task)
            }
            None => runtime
                .transactions()
                .begin(TransactionKind::AutoCommit)?
                .enlist(task),
        }
    }

    /// Remove the item under `tx`
    ///
    /// An `Available` item is removed without a lock id; a locked item needs
    /// the lock id it was locked with.
    pub fn remove(&self, tx: &Transaction, lock_id: Option<LockId>) -> StoreResult<()> {
        let runtime = self.store.runtime()?;
        runtime.check_transaction(tx)?;
        match self.link.container() {
            Some(container) => container
                .claim_if_empty(|| self.link.begin_remove(tx.id(), lock_id))
                .unwrap_or_else(|| {
                    Err(StoreError::invalid_state(
                        self.id(),
                        self.state(),
                        "remove non-empty stream",
                    ))
                })?,
            None => self.link.begin_remove(tx.id(), lock_id)?,
        }
        tx.enlist(Box::new(RemoveTask::remove(runtime, Arc::clone(&self.link))))
    }

    /// Mark the item as updated; its persistent data is re-read when `tx`
    /// commits
    pub fn request_update(&self, tx: &Transaction) -> StoreResult<()> {
        let runtime = self.store.runtime()?;
        runtime.check_transaction(tx)?;
        self.link.begin_update(tx.id())?;
        tx.enlist(Box::new(UpdateTask::new(Arc::clone(&self.link))))
    }
}

impl std::fmt::Debug for ItemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemHandle")
            .field("id", &self.link.id())
            .field("kind", &self.link.kind())
            .field("state", &self.link.state())
            .finish()
    }
}
