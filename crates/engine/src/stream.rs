//! Item streams
//!
//! An [`ItemStream`] is an ordered collection of items, optionally holding
//! nested item streams and reference streams. Members are ordered by
//! priority (highest first) and then insertion order. Every operation that
//! hands out an item claims it through the item's link, so two callers can
//! never both obtain the same item.
//!
//! A stream is itself a stored entity described by an application item
//! (its descriptor). [`StreamDescriptor`] is a ready-made descriptor type
//! that the store can always restore.

use crate::container::Container;
use crate::cursor::{LockingCursor, NonLockingCursor};
use crate::handle::ItemHandle;
use crate::link::ItemLink;
use crate::reference::ReferenceStream;
use crate::statistics::Statistics;
use crate::store::{AddRequest, StoreInner};
use crate::tasks::RemoveTask;
use msgstore_concurrency::Transaction;
use msgstore_core::{
    downcast_item, filter_matches, DataSlice, Filter, Item, ItemId, ItemState, PersistentData,
    StorageStrategy, StoreError, StoreResult,
};
use msgstore_durability::EntityKind;
use std::any::Any;
use std::sync::Arc;

/// Type name under which [`StreamDescriptor`] is registered
pub const STREAM_DESCRIPTOR_TYPE: &str = "msgstore.stream";

const NO_STRATEGY: u8 = u8::MAX;

/// Named stream descriptor with an optional storage strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    name: String,
    strategy: Option<StorageStrategy>,
}

impl StreamDescriptor {
    /// Descriptor inheriting its strategy from the parent
    pub fn new(name: impl Into<String>) -> Self {
        StreamDescriptor {
            name: name.into(),
            strategy: None,
        }
    }

    /// Set the stream's storage strategy
    pub fn with_strategy(mut self, strategy: StorageStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filter selecting streams described by a descriptor called `name`
    pub fn named(name: impl Into<String>) -> impl Filter {
        let name = name.into();
        move |item: &dyn Item| {
            downcast_item::<StreamDescriptor>(item).map_or(false, |d| d.name == name)
        }
    }

    /// Restore function registered for [`STREAM_DESCRIPTOR_TYPE`]
    pub fn restore(data: &[DataSlice]) -> StoreResult<Arc<dyn Item>> {
        let (name, strategy) = match data {
            [name, strategy] => (name, strategy),
            _ => {
                return Err(StoreError::Corruption(format!(
                    "stream descriptor has {} slices, expected 2",
                    data.len()
                )))
            }
        };
        let name = String::from_utf8(name.as_bytes().to_vec())
            .map_err(|e| StoreError::Corruption(format!("stream name: {}", e)))?;
        let strategy = match strategy.as_bytes() {
            [NO_STRATEGY] => None,
            [0] => Some(StorageStrategy::Never),
            [1] => Some(StorageStrategy::Maybe),
            [2] => Some(StorageStrategy::Eventually),
            [3] => Some(StorageStrategy::Always),
            other => {
                return Err(StoreError::Corruption(format!(
                    "stream strategy bytes {:?}",
                    other
                )))
            }
        };
        Ok(Arc::new(StreamDescriptor { name, strategy }))
    }
}

impl Item for StreamDescriptor {
    fn type_name(&self) -> &'static str {
        STREAM_DESCRIPTOR_TYPE
    }

    fn storage_strategy(&self) -> Option<StorageStrategy> {
        self.strategy
    }

    fn persistent_data(&self) -> StoreResult<PersistentData> {
        let strategy = match self.strategy {
            None => NO_STRATEGY,
            Some(StorageStrategy::Never) => 0,
            Some(StorageStrategy::Maybe) => 1,
            Some(StorageStrategy::Eventually) => 2,
            Some(StorageStrategy::Always) => 3,
        };
        Ok(vec![
            DataSlice::from(self.name.as_str()),
            DataSlice::new(vec![strategy]),
        ])
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Ordered collection of items
#[derive(Clone)]
pub struct ItemStream {
    store: Arc<StoreInner>,
    link: Arc<ItemLink>,
    container: Arc<Container>,
}

impl ItemStream {
    pub(crate) fn from_link(store: Arc<StoreInner>, link: Arc<ItemLink>) -> Option<Self> {
        if link.kind() != EntityKind::ItemStream {
            return None;
        }
        let container = Arc::clone(link.container()?);
        Some(ItemStream {
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

    /// Most durable strategy an item in this stream may have
    pub fn storage_strategy(&self) -> StorageStrategy {
        self.link.strategy()
    }

    /// Handle to the stream's own entity
    pub fn handle(&self) -> ItemHandle {
        ItemHandle::new(Arc::clone(&self.store), Arc::clone(&self.link))
    }

    fn handle_for(&self, link: Arc<ItemLink>) -> ItemHandle {
        ItemHandle::new(Arc::clone(&self.store), link)
    }

    /// Add `item` under `tx`
    ///
    /// The item is linked at once in the `Adding` state and becomes
    /// visible when `tx` commits.
    ///
    /// # Errors
    /// - `InvalidAddOperation` if the item asks for a more durable strategy
    ///   than the stream
    /// - `StreamFull` / `CacheSpaceExhausted` when a limit is reached
    pub fn add_item(&self, item: Arc<dyn Item>, tx: &Transaction) -> StoreResult<ItemHandle> {
        let runtime = self.store.runtime()?;
        let link = runtime.add_entity(
            &self.container,
            Some(&self.link),
            AddRequest {
                kind: EntityKind::Item,
                item,
                referred: None,
            },
            tx,
        )?;
        Ok(self.handle_for(link))
    }

    /// First available item matching `filter`; no state change
    pub fn find_first_matching_item(
        &self,
        filter: Option<&dyn Filter>,
    ) -> StoreResult<Option<ItemHandle>> {
        self.store.runtime()?;
        Ok(self
            .container
            .first_available(filter)
            .map(|link| self.handle_for(link)))
    }

    /// Claim the first available item matching `filter` and remove it
    /// under `tx`
    pub fn remove_first_matching_item(
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

    /// Oldest available item among those of the highest priority
    pub fn find_oldest_item(&self) -> StoreResult<Option<ItemHandle>> {
        self.store.runtime()?;
        Ok(self
            .container
            .oldest_available()
            .map(|link| self.handle_for(link)))
    }

    /// Cursor that locks each item it returns
    pub fn new_locking_item_cursor(
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

    /// Cursor that observes available items
    pub fn new_non_locking_item_cursor(
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

    /// Whether occupancy crossed the spill upper limit and has not yet
    /// fallen to the lower limit
    pub fn is_spilling(&self) -> bool {
        self.container.is_spilling()
    }

    /// Override the store-wide spill limits for this stream
    pub fn set_spill_limits(&self, upper: u64, lower: u64) -> StoreResult<()> {
        self.container.set_spill_limits(upper, lower)
    }

    /// Current spill limits as `(upper, lower)`
    pub fn spill_limits(&self) -> (u64, u64) {
        self.container.spill_limits()
    }

    /// Limit the number of items; `None` removes the limit
    pub fn set_maximum_depth(&self, depth: Option<u64>) {
        self.container.set_maximum_depth(depth);
    }

    /// Current depth limit
    pub fn maximum_depth(&self) -> Option<u64> {
        self.container.maximum_depth()
    }

    /// Nest a new item stream described by `descriptor`
    pub fn add_item_stream(
        &self,
        descriptor: Arc<dyn Item>,
        tx: &Transaction,
    ) -> StoreResult<ItemStream> {
        let runtime = self.store.runtime()?;
        let link = runtime.add_entity(
            &self.container,
            Some(&self.link),
            AddRequest {
                kind: EntityKind::ItemStream,
                item: descriptor,
                referred: None,
            },
            tx,
        )?;
        ItemStream::from_link(Arc::clone(&self.store), link)
            .ok_or_else(|| StoreError::internal("item stream link without container"))
    }

    /// Nest a new reference stream described by `descriptor`
    pub fn add_reference_stream(
        &self,
        descriptor: Arc<dyn Item>,
        tx: &Transaction,
    ) -> StoreResult<ReferenceStream> {
        let runtime = self.store.runtime()?;
        let link = runtime.add_entity(
            &self.container,
            Some(&self.link),
            AddRequest {
                kind: EntityKind::ReferenceStream,
                item: descriptor,
                referred: None,
            },
            tx,
        )?;
        ReferenceStream::from_link(Arc::clone(&self.store), link)
            .ok_or_else(|| StoreError::internal("reference stream link without container"))
    }

    fn nested(&self, kind: EntityKind) -> Vec<Arc<ItemLink>> {
        self.container
            .streams()
            .into_iter()
            .filter(|link| link.kind() == kind && link.state().is_in_store())
            .collect()
    }

    /// Nested item streams
    pub fn item_streams(&self) -> Vec<ItemStream> {
        self.nested(EntityKind::ItemStream)
            .into_iter()
            .filter_map(|link| ItemStream::from_link(Arc::clone(&self.store), link))
            .collect()
    }

    /// Nested reference streams
    pub fn reference_streams(&self) -> Vec<ReferenceStream> {
        self.nested(EntityKind::ReferenceStream)
            .into_iter()
            .filter_map(|link| ReferenceStream::from_link(Arc::clone(&self.store), link))
            .collect()
    }

    /// First available nested item stream whose descriptor matches `filter`
    pub fn find_first_matching_item_stream(
        &self,
        filter: Option<&dyn Filter>,
    ) -> StoreResult<Option<ItemStream>> {
        self.store.runtime()?;
        Ok(self.item_streams().into_iter().find(|stream| {
            stream.state() == ItemState::Available
                && filter_matches(filter, stream.descriptor().as_ref())
        }))
    }

    /// First available nested reference stream whose descriptor matches
    /// `filter`
    pub fn find_first_matching_reference_stream(
        &self,
        filter: Option<&dyn Filter>,
    ) -> StoreResult<Option<ReferenceStream>> {
        self.store.runtime()?;
        Ok(self.reference_streams().into_iter().find(|stream| {
            stream.state() == ItemState::Available
                && filter_matches(filter, stream.descriptor().as_ref())
        }))
    }

    /// Remove this stream under `tx`; it must be empty
    pub fn remove_item_stream(&self, tx: &Transaction) -> StoreResult<()> {
        self.handle().remove(tx, None)
    }
}

impl std::fmt::Debug for ItemStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemStream")
            .field("id", &self.link.id())
            .field("state", &self.link.state())
            .field("statistics", &self.container.statistics())
            .finish()
    }
}
