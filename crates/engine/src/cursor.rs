//! Stream cursors
//!
//! A cursor remembers the position of the last entity it returned and
//! resumes the scan after it, so removal of other entities never disturbs
//! it. Only `Available` entities are returned.
//!
//! A [`LockingCursor`] locks every entity it returns with the cursor's lock
//! id; the lock is claimed through the entity's link, so a concurrent
//! remove, expiry or second cursor can never get the same entity. A
//! [`NonLockingCursor`] only observes.

use crate::container::{Container, OrderKey};
use crate::handle::ItemHandle;
use crate::store::StoreInner;
use msgstore_core::{Filter, LockId, StoreResult};
use std::sync::Arc;

/// Cursor that locks what it returns
pub struct LockingCursor {
    store: Arc<StoreInner>,
    container: Arc<Container>,
    filter: Option<Arc<dyn Filter>>,
    position: Option<OrderKey>,
    lock_id: LockId,
}

impl LockingCursor {
    pub(crate) fn new(
        store: Arc<StoreInner>,
        container: Arc<Container>,
        filter: Option<Arc<dyn Filter>>,
        lock_id: LockId,
    ) -> Self {
        LockingCursor {
            store,
            container,
            filter,
            position: None,
            lock_id,
        }
    }

    /// Lock id given to every entity this cursor returns
    pub fn lock_id(&self) -> LockId {
        self.lock_id
    }

    /// Next available matching entity, now locked by this cursor
    pub fn next(&mut self) -> StoreResult<Option<ItemHandle>> {
        self.store.runtime()?;
        let lock_id = self.lock_id;
        let claimed = self
            .container
            .claim_next(self.position, self.filter.as_deref(), |link| link.try_lock(lock_id));
        Ok(claimed.map(|(key, link)| {
            self.position = Some(key);
            ItemHandle::new(Arc::clone(&self.store), link)
        }))
    }
}

impl std::fmt::Debug for LockingCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockingCursor")
            .field("stream", &self.container.id())
            .field("position", &self.position)
            .field("lock_id", &self.lock_id)
            .finish()
    }
}

/// Cursor that only observes
pub struct NonLockingCursor {
    store: Arc<StoreInner>,
    container: Arc<Container>,
    filter: Option<Arc<dyn Filter>>,
    position: Option<OrderKey>,
}

impl NonLockingCursor {
    pub(crate) fn new(
        store: Arc<StoreInner>,
        container: Arc<Container>,
        filter: Option<Arc<dyn Filter>>,
    ) -> Self {
        NonLockingCursor {
            store,
            container,
            filter,
            position: None,
        }
    }

    /// Next available matching entity
    pub fn next(&mut self) -> StoreResult<Option<ItemHandle>> {
        self.store.runtime()?;
        let claimed = self
            .container
            .claim_next(self.position, self.filter.as_deref(), |link| link.is_available());
        Ok(claimed.map(|(key, link)| {
            self.position = Some(key);
            ItemHandle::new(Arc::clone(&self.store), link)
        }))
    }

    /// Count the remaining available matching entities
    pub fn count_remaining(&mut self) -> StoreResult<usize> {
        let mut count = 0;
        while self.next()?.is_some() {
            count += 1;
        }
        Ok(count)
    }
}

impl std::fmt::Debug for NonLockingCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonLockingCursor")
            .field("stream", &self.container.id())
            .field("position", &self.position)
            .finish()
    }
}
