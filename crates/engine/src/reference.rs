//! Reference streams
//!
//! A [`ReferenceStream`] orders references to items held elsewhere in the
//! same stream tree. A reference owns nothing: it names the referred item
//! by id and shares its value so filters can match against it. Adding a
//! reference bumps the referred item's reference count; removing it (or a
//! rollback of the add) drops the count again.

use crate::container::Container;
use crate::cursor::{LockingCursor, NonLockingCursor};
use crate::handle::ItemHandle;
use crate::link::ItemLink;
use crate::statistics::Statistics;
use crate::store::{AddRequest, StoreInner};
use crate::tasks::RemoveTask;
use msgstore_concurrency::Transaction;
use msgstore_core::{Filter, Item, ItemId, ItemState, StorageStrategy, StoreError, StoreResult};
use msgstore_durability::EntityKind;
use std::sync::Arc;

/// Ordered collection of references
#[derive(Clone)]
pub struct ReferenceStream {
    store: Arc<StoreInner>,
    link: Arc<ItemLink>,
    container: Arc<Container>,
}

impl ReferenceStream {
    pub(crate) fn from_link(store: Arc<StoreInner>, link: Arc<ItemLink>) -> Option<Self> {
        if link.kind() != EntityKind::ReferenceStream {
            return None;
        }
        let container = Arc::clone(link.container()?);
        Some(ReferenceStream {
            store,
            link,
            container,
        })
    }

    /// Stream id
    pub fn id(&self) -> ItemId {
        self.link.id()
    }

    /// Application descriptor of the stream
    pub fn descriptor(&self) -> Arc<dyn Item> {
        Arc::clone(self.link.item())
    }

    /// Lifecycle state of the stream itself
    pub fn state(&self) -> ItemState {
        self.link.state()
    }

    /// Most durable strategy a reference in this stream may have
    pub fn storage_strategy(&self) -> StorageStrategy {
        self.link.strategy()
    }

    /// Item stream this reference stream is nested in
    pub fn owning_stream_id(&self) -> Option<ItemId> {
        self.link.parent_id()
    }

    /// Handle to the stream's own entity
    pub fn handle(&self) -> ItemHandle {
        ItemHandle::new(Arc::clone(&self.store), Arc::clone(&self.link))
    }

    fn handle_for(&self, link: Arc<ItemLink>) -> ItemHandle {
        ItemHandle::new(Arc::clone(&self.store), link)
    }

    /// Add a reference to `target` under `tx`
    ///
    /// The reference takes the referred item's priority and the less
    /// durable of the item's and this stream's strategies.
    ///
    /// # Errors
    /// - `InvalidAddOperation` if `target` is not an item or not in the store
    /// - `ReferenceConsistencyViolation` if `target` is still being added by
    ///   another transaction, or lives in a stream that is neither this
    ///   stream's owner nor one of its ancestors
    pub fn add_reference(&self, target: &ItemHandle, tx: &Transaction) -> StoreResult<ItemHandle> {
        let runtime = self.store.runtime()?;
        let target = target.link();

        if target.kind() != EntityKind::Item {
            return Err(StoreError::invalid_add(format!(
                "{} is a {:?}, only items can be referenced",
                target.id(),
                target.kind()
            )));
        }
        match target.state() {
            ItemState::NotInStore => {
                return Err(StoreError::invalid_add(format!(
                    "{} is not in the store",
                    target.id()
                )));
            }
            ItemState::Adding if target.adding_transaction() != Some(tx.id()) => {
                return Err(StoreError::reference_violation(format!(
                    "{} is being added by another transaction than {}",
                    target.id(),
                    tx.id()
                )));
            }
            _ => {}
        }

        let within_tree = match (target.parent_id(), self.link.parent_id()) {
            (Some(item_stream), Some(owner)) => runtime.is_same_or_ancestor(item_stream, owner),
            _ => false,
        };
        if !within_tree {
            return Err(StoreError::reference_violation(format!(
                "{} is not held by the stream owning reference stream {}",
                target.id(),
                self.id()
            )));
        }

        let link = runtime.add_entity(
            &self.container,
            Some(&self.link),
            AddRequest {
                kind: EntityKind::Reference,
                item: Arc::clone(target.item()),
                referred: Some(Arc::clone(target)),
            },
            tx,
        )?;
        Ok(self.handle_for(link))
    }

    /// First available reference whose referred item matches `filter`
    pub fn find_first_matching_reference(
        &self,
        filter: Option<&dyn Filter>,
    ) -> StoreResult<Option<ItemHandle>> {
        self.store.runtime()?;
        Ok(self
            .container
            .first_available(filter)
            .map(|link| self.handle_for(link)))
    }

    /// Claim the first available matching reference and remove it under
    /// `tx`; the referred item stays
    pub fn remove_first_matching_reference(
        &self,
        filter: Option<&dyn Filter>,
        tx: &Transaction,
    ) -> StoreResult<Option<ItemHandle>> {
        let runtime = self.store.runtime()?;
        runtime.check_transaction(tx)?;
        let tx_id = tx.id();
        let claimed = self
            .container
            .claim_next(None, filter, |link| link.try_begin_remove(tx_id));
        match claimed {
            Some((_, link)) => {
                tx.enlist(Box::new(RemoveTask::remove(runtime, Arc::clone(&link))))?;
                Ok(Some(self.handle_for(link)))
            }
            None => Ok(None),
        }
    }

    /// Cursor that locks each reference it returns
    pub fn new_locking_reference_cursor(
        &self,
        filter: Option<Arc<dyn Filter>>,
    ) -> StoreResult<LockingCursor> {
        let runtime = self.store.runtime()?;
        let lock_id = runtime.unique_lock_id(self.link.strategy())?;
        Ok(LockingCursor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.container),
            filter,
            lock_id,
        ))
    }

    /// Cursor that observes available references
    pub fn new_non_locking_reference_cursor(
        &self,
        filter: Option<Arc<dyn Filter>>,
    ) -> StoreResult<NonLockingCursor> {
        self.store.runtime()?;
        Ok(NonLockingCursor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.container),
            filter,
        ))
    }

    /// Current counts
    pub fn get_statistics(&self) -> Statistics {
        self.container.statistics()
    }

    /// Spill state, as for item streams
    pub fn is_spilling(&self) -> bool {
        self.container.is_spilling()
    }

    /// Override the store-wide spill limits for this stream
    pub fn set_spill_limits(&self, upper: u64, lower: u64) -> StoreResult<()> {
        self.container.set_spill_limits(upper, lower)
    }

    /// Limit the number of references; `None` removes the limit
    pub fn set_maximum_depth(&self, depth: Option<u64>) {
        self.container.set_maximum_depth(depth);
    }

    /// Remove this stream under `tx`; it must be empty
    pub fn remove_reference_stream(&self, tx: &Transaction) -> StoreResult<()> {
        self.handle().remove(tx, None)
    }
}

impl std::fmt::Debug for ReferenceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceStream")
            .field("id", &self.link.id())
            .field("state", &self.link.state())
            .field("statistics", &self.container.statistics())
            .finish()
    }
}
