//! Stream containers
//!
//! A [`Container`] is the member table of one stream. Items and references
//! are kept in a `BTreeMap` ordered by priority (highest first) and then
//! insertion sequence (oldest first), which is the order finds, removes and
//! cursors walk. Nested streams are kept in a separate table so they never
//! count towards the stream's statistics.
//!
//! The container owns its member links. Links point back at their
//! container weakly, so dropping a stream drops everything in it.
//!
//! Lock order: member table, then a member's slot, then the statistics.
//! Adds and stream removal also take the owning stream's slot right after
//! its member tables.

use crate::link::ItemLink;
use crate::statistics::{ListStatistics, Statistics};
use msgstore_core::{filter_matches, Filter, ItemId, ItemState, StorageStrategy, StoreResult};
use parking_lot::{Mutex, RwLock};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Position of a member in stream order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct OrderKey {
    rank: Reverse<u8>,
    sequence: u64,
}

impl OrderKey {
    pub(crate) fn new(priority: u8, sequence: u64) -> Self {
        OrderKey {
            rank: Reverse(priority),
            sequence,
        }
    }
}

/// Member table and statistics of one stream
pub(crate) struct Container {
    id: ItemId,
    strategy: StorageStrategy,
    members: RwLock<BTreeMap<OrderKey, Arc<ItemLink>>>,
    streams: RwLock<BTreeMap<ItemId, Arc<ItemLink>>>,
    stats: Mutex<ListStatistics>,
    next_sequence: AtomicU64,
}

impl Container {
    pub(crate) fn new(
        id: ItemId,
        strategy: StorageStrategy,
        spill_upper_limit: u64,
        spill_lower_limit: u64,
    ) -> Self {
        Container {
            id,
            strategy,
            members: RwLock::new(BTreeMap::new()),
            streams: RwLock::new(BTreeMap::new()),
            stats: Mutex::new(ListStatistics::new(spill_upper_limit, spill_lower_limit)),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Id of the owning stream
    pub(crate) fn id(&self) -> ItemId {
        self.id
    }

    /// Most durable strategy a member may have
    pub(crate) fn strategy(&self) -> StorageStrategy {
        self.strategy
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Make sure future sequences sort after a recovered one
    pub(crate) fn observe_sequence(&self, sequence: u64) {
        self.next_sequence
            .fetch_max(sequence.saturating_add(1), Ordering::Relaxed);
    }

    pub(crate) fn record_transition(&self, from: ItemState, to: ItemState) {
        self.stats.lock().record_transition(from, to);
    }

    /// Depth check and first transition of an add, as one step
    pub(crate) fn admit(&self) -> StoreResult<()> {
        let mut stats = self.stats.lock();
        stats.check_depth(self.id)?;
        stats.record_transition(ItemState::NotInStore, ItemState::Adding);
        Ok(())
    }

    /// Link a new member once `admit` succeeds under the member tables
    ///
    /// `claim_if_empty` holds the same locks, so a stream being removed
    /// never gains a member after its emptiness check.
    pub(crate) fn insert_admitted<F>(&self, link: &Arc<ItemLink>, admit: F) -> StoreResult<()>
    where
        F: FnOnce() -> StoreResult<()>,
    {
        let mut members = self.members.write();
        let mut streams = self.streams.write();
        admit()?;
        if link.kind().is_stream() {
            streams.insert(link.id(), Arc::clone(link));
        } else {
            members.insert(link.order_key(), Arc::clone(link));
        }
        Ok(())
    }

    pub(crate) fn insert(&self, link: &Arc<ItemLink>) {
        if link.kind().is_stream() {
            self.streams.write().insert(link.id(), Arc::clone(link));
        } else {
            self.members.write().insert(link.order_key(), Arc::clone(link));
        }
    }

    pub(crate) fn remove(&self, link: &ItemLink) {
        if link.kind().is_stream() {
            self.streams.write().remove(&link.id());
        } else {
            self.members.write().remove(&link.order_key());
        }
    }

    pub(crate) fn statistics(&self) -> Statistics {
        self.stats.lock().snapshot()
    }

    pub(crate) fn is_spilling(&self) -> bool {
        self.stats.lock().is_spilling()
    }

    pub(crate) fn set_spill_limits(&self, upper: u64, lower: u64) -> StoreResult<()> {
        self.stats.lock().set_spill_limits(upper, lower)
    }

    pub(crate) fn spill_limits(&self) -> (u64, u64) {
        self.stats.lock().spill_limits()
    }

    pub(crate) fn set_maximum_depth(&self, depth: Option<u64>) {
        self.stats.lock().set_maximum_depth(depth);
    }

    pub(crate) fn maximum_depth(&self) -> Option<u64> {
        self.stats.lock().maximum_depth()
    }

    /// Run `claim` if no member or nested stream is linked, keeping new
    /// members out until it returns; `None` if the container is not empty
    pub(crate) fn claim_if_empty<R>(&self, claim: impl FnOnce() -> R) -> Option<R> {
        let members = self.members.write();
        let streams = self.streams.write();
        if members.is_empty() && streams.is_empty() {
            Some(claim())
        } else {
            None
        }
    }

    /// First member after `position` that matches `filter` and that `claim`
    /// accepts
    ///
    /// `claim` runs under the member's slot lock (via the link), so the
    /// availability check and the state change it makes are one step. The
    /// member table lock is released before this returns.
    pub(crate) fn claim_next<F>(
        &self,
        position: Option<OrderKey>,
        filter: Option<&dyn Filter>,
        mut claim: F,
    ) -> Option<(OrderKey, Arc<ItemLink>)>
    where
        F: FnMut(&ItemLink) -> bool,
    {
        let members = self.members.read();
        let lower = match position {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        for (key, link) in members.range((lower, Bound::Unbounded)) {
            if !link.is_available() {
                continue;
            }
            if !filter_matches(filter, link.item().as_ref()) {
                continue;
            }
            if claim(link) {
                return Some((*key, Arc::clone(link)));
            }
        }
        None
    }

    /// First available member matching `filter`
    pub(crate) fn first_available(&self, filter: Option<&dyn Filter>) -> Option<Arc<ItemLink>> {
        self.claim_next(None, filter, |link| link.is_available())
            .map(|(_, link)| link)
    }

    /// Oldest available member of the highest priority present
    pub(crate) fn oldest_available(&self) -> Option<Arc<ItemLink>> {
        let members = self.members.read();
        members
            .values()
            .find(|link| link.is_available())
            .cloned()
    }

    /// Nested streams in id order
    pub(crate) fn streams(&self) -> Vec<Arc<ItemLink>> {
        self.streams.read().values().cloned().collect()
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("strategy", &self.strategy)
            .field("members", &self.members.read().len())
            .field("streams", &self.streams.read().len())
            .finish()
    }
}
