//! Item links: the per-entity state machine
//!
//! Every stored entity (item, reference or stream) is represented by one
//! [`ItemLink`]. The link owns the entity's lifecycle state, its lock id and
//! its counters behind a single slot mutex. Every state change goes through
//! a method on this type, and each one updates the owning container's
//! statistics while the slot is still locked, so counts always agree with
//! states.
//!
//! Foreground removes, cursors and the expirer all claim items through
//! these methods. Whoever moves an item out of `Available` first wins; the
//! others see it as gone.

use crate::container::{Container, OrderKey};
use msgstore_core::{
    DataSlice, Item, ItemId, ItemState, LockId, StorageStrategy, StoreError, StoreResult,
    TransactionId,
};
use msgstore_durability::{EntityKind, EntityRecord};
use parking_lot::{Mutex, MutexGuard};
use std::sync::{Arc, Weak};
use tracing::{error, trace};

#[derive(Debug)]
struct LinkSlot {
    state: ItemState,
    lock_id: Option<LockId>,
    txn: Option<TransactionId>,
    /// State and lock to return to if a remove rolls back
    prior: Option<(ItemState, Option<LockId>)>,
    /// A committing transaction is making the lock durable
    persist_pending: bool,
    unlock_count: u64,
    backout_count: u64,
    reference_count: u64,
}

/// Construction parameters of a link
pub(crate) struct LinkSpec {
    pub(crate) id: ItemId,
    pub(crate) kind: EntityKind,
    pub(crate) item: Arc<dyn Item>,
    pub(crate) strategy: StorageStrategy,
    pub(crate) priority: u8,
    pub(crate) sequence: u64,
    pub(crate) expiry_deadline: Option<u64>,
    pub(crate) referred: Option<ItemId>,
    pub(crate) in_memory_size: u64,
}

/// One stored entity
pub(crate) struct ItemLink {
    id: ItemId,
    kind: EntityKind,
    item: Arc<dyn Item>,
    strategy: StorageStrategy,
    priority: u8,
    sequence: u64,
    expiry_deadline: Option<u64>,
    referred: Option<ItemId>,
    in_memory_size: u64,
    parent: Weak<Container>,
    parent_id: Option<ItemId>,
    container: Option<Arc<Container>>,
    slot: Mutex<LinkSlot>,
}

impl ItemLink {
    /// Link placed in `parent`; `parent_id` is `None` for root streams
    pub(crate) fn new(
        spec: LinkSpec,
        parent: &Arc<Container>,
        parent_id: Option<ItemId>,
        container: Option<Arc<Container>>,
    ) -> Self {
        ItemLink {
            id: spec.id,
            kind: spec.kind,
            item: spec.item,
            strategy: spec.strategy,
            priority: spec.priority,
            sequence: spec.sequence,
            expiry_deadline: spec.expiry_deadline,
            referred: spec.referred,
            in_memory_size: spec.in_memory_size,
            parent: Arc::downgrade(parent),
            parent_id,
            container,
            slot: Mutex::new(LinkSlot {
                state: ItemState::NotInStore,
                lock_id: None,
                txn: None,
                prior: None,
                persist_pending: false,
                unlock_count: 0,
                backout_count: 0,
                reference_count: 0,
            }),
        }
    }

    pub(crate) fn id(&self) -> ItemId {
        self.id
    }

    pub(crate) fn kind(&self) -> EntityKind {
        self.kind
    }

    /// The application item; for a reference, the referred item
    pub(crate) fn item(&self) -> &Arc<dyn Item> {
        &self.item
    }

    pub(crate) fn strategy(&self) -> StorageStrategy {
        self.strategy
    }

    pub(crate) fn priority(&self) -> u8 {
        self.priority
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn order_key(&self) -> OrderKey {
        OrderKey::new(self.priority, self.sequence)
    }

    pub(crate) fn expiry_deadline(&self) -> Option<u64> {
        self.expiry_deadline
    }

    pub(crate) fn referred(&self) -> Option<ItemId> {
        self.referred
    }

    pub(crate) fn in_memory_size(&self) -> u64 {
        self.in_memory_size
    }

    pub(crate) fn parent(&self) -> Option<Arc<Container>> {
        self.parent.upgrade()
    }

    pub(crate) fn parent_id(&self) -> Option<ItemId> {
        self.parent_id
    }

    /// Member table of a stream entity
    pub(crate) fn container(&self) -> Option<&Arc<Container>> {
        self.container.as_ref()
    }

    /// Whether lifecycle hooks of `item()` belong to this entity
    pub(crate) fn owns_item(&self) -> bool {
        self.kind != EntityKind::Reference
    }

    fn counts_in_parent(&self) -> bool {
        !self.kind.is_stream()
    }

    pub(crate) fn state(&self) -> ItemState {
        self.slot.lock().state
    }

    pub(crate) fn is_available(&self) -> bool {
        self.state() == ItemState::Available
    }

    pub(crate) fn lock_id(&self) -> Option<LockId> {
        self.slot.lock().lock_id
    }

    pub(crate) fn unlock_count(&self) -> u64 {
        self.slot.lock().unlock_count
    }

    pub(crate) fn backout_count(&self) -> u64 {
        self.slot.lock().backout_count
    }

    pub(crate) fn reference_count(&self) -> u64 {
        self.slot.lock().reference_count
    }

    /// Transaction adding this entity, while it is being added
    pub(crate) fn adding_transaction(&self) -> Option<TransactionId> {
        let slot = self.slot.lock();
        match slot.state {
            ItemState::Adding => slot.txn,
            _ => None,
        }
    }

    /// Record describing this entity for the persistence manager
    pub(crate) fn entity_record(&self, data: Vec<DataSlice>) -> EntityRecord {
        EntityRecord {
            id: self.id,
            parent: self.parent_id,
            kind: self.kind,
            type_name: if self.owns_item() {
                self.item.type_name().to_string()
            } else {
                String::new()
            },
            strategy: self.strategy,
            priority: self.priority,
            sequence: self.sequence,
            expiry_deadline: self.expiry_deadline,
            referred: self.referred,
            data,
        }
    }

    fn set_state(&self, slot: &mut MutexGuard<'_, LinkSlot>, to: ItemState) {
        let from = slot.state;
        if self.counts_in_parent() {
            if let Some(parent) = self.parent.upgrade() {
                parent.record_transition(from, to);
            }
        }
        slot.state = to;
        trace!(
            target: "msgstore::store",
            id = %self.id,
            from = from.as_str(),
            to = to.as_str(),
            "State transition"
        );
    }

    /// Finish a transitional state; a mismatch is a bug in the caller
    fn complete(
        &self,
        expected: ItemState,
        to: ItemState,
        operation: &'static str,
        clear_lock: bool,
    ) -> bool {
        let mut slot = self.slot.lock();
        if slot.state != expected {
            error!(
                target: "msgstore::store",
                id = %self.id,
                state = slot.state.as_str(),
                operation,
                "Unexpected state while completing transition"
            );
            return false;
        }
        self.set_state(&mut slot, to);
        slot.txn = None;
        if clear_lock {
            slot.lock_id = None;
        }
        true
    }

    // ========================================================================
    // Add
    // ========================================================================

    /// NotInStore → Adding
    pub(crate) fn begin_add(&self, tx: TransactionId) -> StoreResult<()> {
        let mut slot = self.slot.lock();
        if slot.state != ItemState::NotInStore {
            return Err(StoreError::invalid_state(self.id, slot.state, "add"));
        }
        if self.counts_in_parent() {
            if let Some(parent) = self.parent.upgrade() {
                parent.admit()?;
            }
        }
        slot.state = ItemState::Adding;
        slot.txn = Some(tx);
        trace!(target: "msgstore::store", id = %self.id, txn = %tx, "Adding");
        Ok(())
    }

    /// Adding → Available
    pub(crate) fn commit_add(&self) -> bool {
        self.complete(ItemState::Adding, ItemState::Available, "commit add", false)
    }

    /// Adding → NotInStore
    pub(crate) fn rollback_add(&self) -> bool {
        self.complete(ItemState::Adding, ItemState::NotInStore, "rollback add", false)
    }

    /// NotInStore → Available or PersistentlyLocked, during recovery
    pub(crate) fn restore(&self, lock_id: Option<LockId>) -> StoreResult<()> {
        let mut slot = self.slot.lock();
        if slot.state != ItemState::NotInStore {
            return Err(StoreError::invalid_state(self.id, slot.state, "restore"));
        }
        let to = if lock_id.is_some() {
            ItemState::PersistentlyLocked
        } else {
            ItemState::Available
        };
        self.set_state(&mut slot, to);
        slot.lock_id = lock_id;
        Ok(())
    }

    // ========================================================================
    // Locking
    // ========================================================================

    /// Available → Locked if the entity is available
    pub(crate) fn try_lock(&self, lock_id: LockId) -> bool {
        let mut slot = self.slot.lock();
        if slot.state != ItemState::Available {
            return false;
        }
        self.set_state(&mut slot, ItemState::Locked);
        slot.lock_id = Some(lock_id);
        true
    }

    /// Available → Locked
    pub(crate) fn lock(&self, lock_id: LockId) -> StoreResult<()> {
        let mut slot = self.slot.lock();
        if slot.state != ItemState::Available {
            return Err(StoreError::invalid_state(self.id, slot.state, "lock"));
        }
        self.set_state(&mut slot, ItemState::Locked);
        slot.lock_id = Some(lock_id);
        Ok(())
    }

    /// Fail unless the entity is locked by `lock_id`; returns the lock state
    pub(crate) fn check_lock(&self, lock_id: LockId, operation: &'static str) -> StoreResult<ItemState> {
        let slot = self.slot.lock();
        Self::check_lock_held(self.id, &slot, lock_id, operation)
    }

    fn check_lock_held(
        id: ItemId,
        slot: &LinkSlot,
        lock_id: LockId,
        operation: &'static str,
    ) -> StoreResult<ItemState> {
        if slot.persist_pending {
            return Err(StoreError::invalid_state(id, slot.state, operation));
        }
        match slot.state {
            ItemState::Locked | ItemState::PersistentlyLocked => match slot.lock_id {
                Some(held) if held == lock_id => Ok(slot.state),
                Some(held) => Err(StoreError::LockIdMismatch {
                    id,
                    expected: held,
                    actual: lock_id,
                }),
                None => Err(StoreError::invalid_state(id, slot.state, operation)),
            },
            state => Err(StoreError::invalid_state(id, state, operation)),
        }
    }

    /// Hold a `Locked` entity's lock until the persist-lock commits or
    /// rolls back; unlock and remove fail meanwhile
    pub(crate) fn reserve_persist_lock(&self, lock_id: LockId) -> StoreResult<()> {
        let mut slot = self.slot.lock();
        match Self::check_lock_held(self.id, &slot, lock_id, "persist lock")? {
            ItemState::Locked => {
                slot.persist_pending = true;
                Ok(())
            }
            state => Err(StoreError::invalid_state(self.id, state, "persist lock")),
        }
    }

    /// Drop a reservation taken by `reserve_persist_lock`
    pub(crate) fn release_persist_lock(&self) {
        self.slot.lock().persist_pending = false;
    }

    /// Locked → PersistentlyLocked
    pub(crate) fn commit_persist_lock(&self, lock_id: LockId) -> bool {
        let mut slot = self.slot.lock();
        slot.persist_pending = false;
        if slot.state != ItemState::Locked || slot.lock_id != Some(lock_id) {
            error!(
                target: "msgstore::store",
                id = %self.id,
                state = slot.state.as_str(),
                "Persistent lock lost before commit"
            );
            return false;
        }
        self.set_state(&mut slot, ItemState::PersistentlyLocked);
        true
    }

    /// Locked / PersistentlyLocked → Available
    pub(crate) fn unlock(&self, lock_id: LockId) -> StoreResult<()> {
        let mut slot = self.slot.lock();
        Self::check_lock_held(self.id, &slot, lock_id, "unlock")?;
        self.set_state(&mut slot, ItemState::Available);
        slot.lock_id = None;
        slot.unlock_count += 1;
        Ok(())
    }

    // ========================================================================
    // Remove
    // ========================================================================

    /// Available (no lock id) or Locked (matching lock id) → Removing
    pub(crate) fn begin_remove(&self, tx: TransactionId, lock_id: Option<LockId>) -> StoreResult<()> {
        let mut slot = self.slot.lock();
        match (slot.state, lock_id) {
            (ItemState::Available, None) => {}
            (ItemState::Locked | ItemState::PersistentlyLocked, Some(presented)) => {
                Self::check_lock_held(self.id, &slot, presented, "remove")?;
            }
            (state, _) => return Err(StoreError::invalid_state(self.id, state, "remove")),
        }
        slot.prior = Some((slot.state, slot.lock_id));
        self.set_state(&mut slot, ItemState::Removing);
        slot.txn = Some(tx);
        Ok(())
    }

    /// Available → Removing if the entity is available
    pub(crate) fn try_begin_remove(&self, tx: TransactionId) -> bool {
        let mut slot = self.slot.lock();
        if slot.state != ItemState::Available {
            return false;
        }
        slot.prior = Some((ItemState::Available, None));
        self.set_state(&mut slot, ItemState::Removing);
        slot.txn = Some(tx);
        true
    }

    /// Removing → NotInStore
    pub(crate) fn commit_remove(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.state != ItemState::Removing {
            error!(
                target: "msgstore::store",
                id = %self.id,
                state = slot.state.as_str(),
                "Unexpected state while committing remove"
            );
            return false;
        }
        self.set_state(&mut slot, ItemState::NotInStore);
        slot.lock_id = None;
        slot.prior = None;
        slot.txn = None;
        true
    }

    /// Removing → the state the remove started from
    pub(crate) fn rollback_remove(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.state != ItemState::Removing {
            error!(
                target: "msgstore::store",
                id = %self.id,
                state = slot.state.as_str(),
                "Unexpected state while rolling back remove"
            );
            return false;
        }
        let (state, lock_id) = slot.prior.take().unwrap_or((ItemState::Available, None));
        self.set_state(&mut slot, state);
        slot.lock_id = lock_id;
        slot.txn = None;
        slot.backout_count += 1;
        true
    }

    // ========================================================================
    // Update
    // ========================================================================

    /// Available → Updating
    pub(crate) fn begin_update(&self, tx: TransactionId) -> StoreResult<()> {
        let mut slot = self.slot.lock();
        if slot.state != ItemState::Available {
            return Err(StoreError::invalid_state(self.id, slot.state, "request update"));
        }
        self.set_state(&mut slot, ItemState::Updating);
        slot.txn = Some(tx);
        Ok(())
    }

    /// Updating → Available
    pub(crate) fn finish_update(&self) -> bool {
        self.complete(ItemState::Updating, ItemState::Available, "finish update", false)
    }

    // ========================================================================
    // Expiry
    // ========================================================================

    /// Available → Expiring if the entity is available
    pub(crate) fn try_begin_expiry(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.state != ItemState::Available {
            return false;
        }
        self.set_state(&mut slot, ItemState::Expiring);
        slot.lock_id = Some(LockId::EXPIRY);
        true
    }

    /// Expiring → NotInStore
    pub(crate) fn commit_expiry(&self) -> bool {
        self.complete(ItemState::Expiring, ItemState::NotInStore, "commit expiry", true)
    }

    /// Expiring → Available
    pub(crate) fn rollback_expiry(&self) -> bool {
        self.complete(ItemState::Expiring, ItemState::Available, "rollback expiry", true)
    }

    // ========================================================================
    // References
    // ========================================================================

    pub(crate) fn increment_references(&self) {
        self.slot.lock().reference_count += 1;
    }

    pub(crate) fn decrement_references(&self) {
        let mut slot = self.slot.lock();
        slot.reference_count = slot.reference_count.saturating_sub(1);
    }
}

impl std::fmt::Debug for ItemLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("ItemLink")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &slot.state)
            .field("lock_id", &slot.lock_id)
            .field("priority", &self.priority)
            .field("sequence", &self.sequence)
            .finish()
    }
}
