//! Application item capabilities
//!
//! Applications store their own types by implementing [`Item`]. Lifecycle
//! notifications are opt-in: an item type implements only the hook traits
//! it cares about and advertises them through [`Item::hooks`]. The store
//! consults that capability table and calls the hooks that are present.
//!
//! # Example
//!
//! ```
//! use std::any::Any;
//! use msgstore_core::{DataSlice, Item, ItemHooks, OnCommitAdd, PersistentData, StoreResult, TransactionId};
//!
//! struct Order { body: String }
//!
//! impl OnCommitAdd for Order {
//!     fn on_commit_add(&self, _tx: TransactionId) {}
//! }
//!
//! impl Item for Order {
//!     fn type_name(&self) -> &'static str { "order" }
//!     fn persistent_data(&self) -> StoreResult<PersistentData> {
//!         Ok(vec![DataSlice::from(self.body.as_str())])
//!     }
//!     fn hooks(&self) -> ItemHooks<'_> { ItemHooks::none().with_commit_add(self) }
//!     fn as_any(&self) -> &dyn Any { self }
//! }
//! ```

use crate::data::{DataSlice, PersistentData};
use crate::error::StoreResult;
use crate::types::{StorageStrategy, TransactionId, DEFAULT_PRIORITY};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// In-memory size assumed for items that do not report one
pub const DEFAULT_IN_MEMORY_SIZE: usize = 256;

/// An application-defined stored unit
///
/// Everything except [`Item::type_name`] and [`Item::as_any`] has a default.
/// Item values are shared (`Arc<dyn Item>`) and treated as immutable by the
/// store; an update re-reads [`Item::persistent_data`] when it commits.
pub trait Item: Send + Sync + 'static {
    /// Stable name used to find the restore function after a restart
    fn type_name(&self) -> &'static str;

    /// Durability policy; `None` inherits the owning stream's strategy
    fn storage_strategy(&self) -> Option<StorageStrategy> {
        None
    }

    /// How long the item may stay in the store; `None` or zero never expires
    fn maximum_time_in_store(&self) -> Option<Duration> {
        None
    }

    /// Ordering priority, `MIN_PRIORITY..=MAX_PRIORITY` (higher first)
    fn priority(&self) -> u8 {
        DEFAULT_PRIORITY
    }

    /// Skip the expiry notification when this item expires
    fn can_expire_silently(&self) -> bool {
        false
    }

    /// Approximate in-memory footprint, charged against the cache limit
    fn in_memory_size(&self) -> usize {
        DEFAULT_IN_MEMORY_SIZE
    }

    /// Durable representation of the item
    fn persistent_data(&self) -> StoreResult<PersistentData> {
        Ok(Vec::new())
    }

    /// Lifecycle hooks this item implements
    fn hooks(&self) -> ItemHooks<'_> {
        ItemHooks::none()
    }

    /// Downcasting support
    fn as_any(&self) -> &dyn Any;
}

/// Rebuilds an item from its persistent data after a restart
pub type ItemRestorer = Arc<dyn Fn(&[DataSlice]) -> StoreResult<Arc<dyn Item>> + Send + Sync>;

/// Called before an add commits; an error rolls the transaction back
pub trait OnPrecommitAdd {
    /// Veto or accept the add
    fn on_precommit_add(&self, tx: TransactionId) -> StoreResult<()>;
}

/// Called after an add committed
pub trait OnCommitAdd {
    /// The item is now available
    fn on_commit_add(&self, tx: TransactionId);
}

/// Called after an add rolled back
pub trait OnRollbackAdd {
    /// The item is no longer in the store
    fn on_rollback_add(&self, tx: TransactionId);
}

/// Called after a remove (or expiry) committed
pub trait OnCommitRemove {
    /// The item has left the store
    fn on_commit_remove(&self, tx: TransactionId);
}

/// Called after a remove rolled back
pub trait OnRollbackRemove {
    /// The item is back in its previous state
    fn on_rollback_remove(&self, tx: TransactionId);
}

/// Called after an update committed
pub trait OnCommitUpdate {
    /// The new persistent data is in effect
    fn on_commit_update(&self, tx: TransactionId);
}

/// Called after an update rolled back
pub trait OnRollbackUpdate {
    /// The update was discarded
    fn on_rollback_update(&self, tx: TransactionId);
}

/// Called when a lock is released
pub trait OnUnlocked {
    /// The item is available again
    fn on_unlocked(&self);
}

/// Called when the expirer removes the item
pub trait OnExpiry {
    /// The item's maximum time in store has elapsed
    fn on_expiry(&self, tx: TransactionId);
}

/// Called when the item has been restored during start-up
pub trait OnRestored {
    /// The item is back in its stream
    fn on_restored(&self);
}

/// Capability table of the hooks an item implements
#[derive(Clone, Copy, Default)]
pub struct ItemHooks<'a> {
    /// Pre-commit add veto
    pub precommit_add: Option<&'a dyn OnPrecommitAdd>,
    /// Post-commit add
    pub commit_add: Option<&'a dyn OnCommitAdd>,
    /// Post-rollback add
    pub rollback_add: Option<&'a dyn OnRollbackAdd>,
    /// Post-commit remove
    pub commit_remove: Option<&'a dyn OnCommitRemove>,
    /// Post-rollback remove
    pub rollback_remove: Option<&'a dyn OnRollbackRemove>,
    /// Post-commit update
    pub commit_update: Option<&'a dyn OnCommitUpdate>,
    /// Post-rollback update
    pub rollback_update: Option<&'a dyn OnRollbackUpdate>,
    /// Unlock
    pub unlocked: Option<&'a dyn OnUnlocked>,
    /// Expiry
    pub expiry: Option<&'a dyn OnExpiry>,
    /// Restore
    pub restored: Option<&'a dyn OnRestored>,
}

impl<'a> ItemHooks<'a> {
    /// No hooks at all
    pub fn none() -> Self {
        Self::default()
    }

    /// Register a pre-commit add hook
    pub fn with_precommit_add(mut self, hook: &'a dyn OnPrecommitAdd) -> Self {
        self.precommit_add = Some(hook);
        self
    }

    /// Register a post-commit add hook
    pub fn with_commit_add(mut self, hook: &'a dyn OnCommitAdd) -> Self {
        self.commit_add = Some(hook);
        self
    }

    /// Register a post-rollback add hook
    pub fn with_rollback_add(mut self, hook: &'a dyn OnRollbackAdd) -> Self {
        self.rollback_add = Some(hook);
        self
    }

    /// Register a post-commit remove hook
    pub fn with_commit_remove(mut self, hook: &'a dyn OnCommitRemove) -> Self {
        self.commit_remove = Some(hook);
        self
    }

    /// Register a post-rollback remove hook
    pub fn with_rollback_remove(mut self, hook: &'a dyn OnRollbackRemove) -> Self {
        self.rollback_remove = Some(hook);
        self
    }

    /// Register a post-commit update hook
    pub fn with_commit_update(mut self, hook: &'a dyn OnCommitUpdate) -> Self {
        self.commit_update = Some(hook);
        self
    }

    /// Register a post-rollback update hook
    pub fn with_rollback_update(mut self, hook: &'a dyn OnRollbackUpdate) -> Self {
        self.rollback_update = Some(hook);
        self
    }

    /// Register an unlock hook
    pub fn with_unlocked(mut self, hook: &'a dyn OnUnlocked) -> Self {
        self.unlocked = Some(hook);
        self
    }

    /// Register an expiry hook
    pub fn with_expiry(mut self, hook: &'a dyn OnExpiry) -> Self {
        self.expiry = Some(hook);
        self
    }

    /// Register a restore hook
    pub fn with_restored(mut self, hook: &'a dyn OnRestored) -> Self {
        self.restored = Some(hook);
        self
    }
}

impl std::fmt::Debug for ItemHooks<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemHooks")
            .field("precommit_add", &self.precommit_add.is_some())
            .field("commit_add", &self.commit_add.is_some())
            .field("rollback_add", &self.rollback_add.is_some())
            .field("commit_remove", &self.commit_remove.is_some())
            .field("rollback_remove", &self.rollback_remove.is_some())
            .field("commit_update", &self.commit_update.is_some())
            .field("rollback_update", &self.rollback_update.is_some())
            .field("unlocked", &self.unlocked.is_some())
            .field("expiry", &self.expiry.is_some())
            .field("restored", &self.restored.is_some())
            .finish()
    }
}

/// Downcast a shared item to a concrete type
pub fn downcast_item<T: Item>(item: &dyn Item) -> Option<&T> {
    item.as_any().downcast_ref::<T>()
}
