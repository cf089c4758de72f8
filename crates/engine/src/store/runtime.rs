//! Started-store internals
//!
//! A [`Runtime`] exists while the store is started. It owns the persistence
//! manager, the transaction manager, the id generators, the registry of
//! live entities, the root container and the expirer. Handles reach it
//! through the store, which refuses access unless the store is started.

use super::config::StoreConfig;
use super::recovery;
use crate::container::Container;
use crate::expirer::Expirer;
use crate::link::{ItemLink, LinkSpec};
use crate::tasks::AddTask;
use dashmap::DashMap;
use msgstore_concurrency::{Transaction, TransactionManager};
use msgstore_core::{
    now_millis, Item, ItemId, ItemRestorer, ItemState, LockId, StorageStrategy, StoreError, StoreResult,
    MAX_PRIORITY,
};
use msgstore_durability::{
    create_persistence_manager, EntityKind, IdGeneratorKind, PersistenceManager, StartOptions,
    UniqueIdGenerator,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Id of the invisible container that holds root streams
pub(crate) const ROOT_ID: ItemId = ItemId::new(0);

/// An entity waiting to be added
pub(crate) struct AddRequest {
    pub(crate) kind: EntityKind,
    pub(crate) item: Arc<dyn Item>,
    pub(crate) referred: Option<Arc<ItemLink>>,
}

pub(crate) struct Runtime {
    config: StoreConfig,
    persistence: Arc<dyn PersistenceManager>,
    transactions: Arc<TransactionManager>,
    item_ids: UniqueIdGenerator,
    lock_ids: UniqueIdGenerator,
    ticks: UniqueIdGenerator,
    local_lock_ids: AtomicU64,
    registry: DashMap<ItemId, Arc<ItemLink>>,
    root: Arc<Container>,
    expirer: Expirer,
    cache_used: AtomicU64,
}

impl Runtime {
    /// Start persistence, recover and rebuild the live entity set
    pub(crate) fn start(
        config: StoreConfig,
        item_types: &HashMap<String, ItemRestorer>,
    ) -> StoreResult<Arc<Self>> {
        config.validate()?;
        let kind = config.persistence_kind()?;
        let persistence = create_persistence_manager(kind, config.persistence_config());
        persistence.start(&StartOptions {
            clean: config.clean_persistence_on_start,
        })?;

        match Self::recover(config, Arc::clone(&persistence), item_types) {
            Ok(runtime) => Ok(runtime),
            Err(e) => {
                if let Err(stop_err) = persistence.stop() {
                    warn!(
                        target: "msgstore::store",
                        error = %stop_err,
                        "Failed to stop persistence after start-up failure"
                    );
                }
                Err(e)
            }
        }
    }

    fn recover(
        config: StoreConfig,
        persistence: Arc<dyn PersistenceManager>,
        item_types: &HashMap<String, ItemRestorer>,
    ) -> StoreResult<Arc<Self>> {
        let recovered = persistence.recover()?;

        let max_lock = recovered
            .entities()
            .filter_map(|e| e.persistent_lock)
            .map(|l| l.as_u64())
            .max()
            .unwrap_or(0);
        let item_start = recovered
            .high_water(IdGeneratorKind::Item)
            .max(recovered.max_entity_id().saturating_add(1))
            .max(1);
        let lock_start = recovered
            .high_water(IdGeneratorKind::Lock)
            .max(max_lock.saturating_add(1))
            .max(1);
        let tick_start = recovered.high_water(IdGeneratorKind::Tick).max(1);
        let block = config.unique_id_block_size;

        let runtime = Arc::new(Runtime {
            item_ids: UniqueIdGenerator::new(
                IdGeneratorKind::Item,
                item_start,
                block,
                Arc::clone(&persistence),
            ),
            lock_ids: UniqueIdGenerator::new(
                IdGeneratorKind::Lock,
                lock_start,
                block,
                Arc::clone(&persistence),
            ),
            ticks: UniqueIdGenerator::new(
                IdGeneratorKind::Tick,
                tick_start,
                block,
                Arc::clone(&persistence),
            ),
            local_lock_ids: AtomicU64::new(1),
            transactions: Arc::new(TransactionManager::new(Arc::clone(&persistence))),
            registry: DashMap::new(),
            root: Arc::new(Container::new(
                ROOT_ID,
                StorageStrategy::Always,
                config.spill_upper_limit,
                config.spill_lower_limit,
            )),
            expirer: Expirer::new(config.expiry_interval()),
            cache_used: AtomicU64::new(0),
            persistence,
            config,
        });

        let summary = recovery::rebuild(&runtime, &recovered, item_types)?;
        info!(
            target: "msgstore::recovery",
            restored = summary.restored,
            dropped = summary.dropped,
            frames = recovered.stats().frames_applied,
            next_item_id = item_start,
            "Recovery complete"
        );
        Ok(runtime)
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn persistence(&self) -> &Arc<dyn PersistenceManager> {
        &self.persistence
    }

    pub(crate) fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub(crate) fn expirer(&self) -> &Expirer {
        &self.expirer
    }

    pub(crate) fn root(&self) -> &Arc<Container> {
        &self.root
    }

    /// Fail unless `tx` was issued by this store and is still active
    pub(crate) fn check_transaction(&self, tx: &Transaction) -> StoreResult<()> {
        if !tx.belongs_to(&self.transactions) {
            return Err(StoreError::TransactionMismatch(format!(
                "transaction {} was issued by another store",
                tx.id()
            )));
        }
        tx.ensure_active()
    }

    pub(crate) fn next_item_id(&self) -> StoreResult<ItemId> {
        self.item_ids.next_id().map(ItemId::new)
    }

    /// Lock id; non-durable entities draw from a local counter
    pub(crate) fn unique_lock_id(&self, strategy: StorageStrategy) -> StoreResult<LockId> {
        if strategy == StorageStrategy::Never {
            return Ok(LockId::new(self.local_lock_ids.fetch_add(1, Ordering::Relaxed)));
        }
        self.lock_ids.next_id().map(LockId::new)
    }

    pub(crate) fn unique_tick(&self) -> StoreResult<u64> {
        self.ticks.next_id()
    }

    // ========================================================================
    // Registry
    // ========================================================================

    pub(crate) fn link(&self, id: ItemId) -> Option<Arc<ItemLink>> {
        self.registry.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn register(&self, link: &Arc<ItemLink>) {
        self.registry.insert(link.id(), Arc::clone(link));
    }

    /// Take an entity that left the store out of every index
    pub(crate) fn unlink(&self, link: &Arc<ItemLink>) {
        if let Some(parent) = link.parent() {
            parent.remove(link);
        }
        self.registry
            .remove_if(&link.id(), |_, registered| Arc::ptr_eq(registered, link));
        self.release_cache(link.in_memory_size());
        self.expirer.forget(link);
    }

    pub(crate) fn entity_count(&self) -> usize {
        self.registry.len()
    }

    /// Whether `stream` is `start` or one of its ancestors
    pub(crate) fn is_same_or_ancestor(&self, stream: ItemId, start: ItemId) -> bool {
        let mut current = Some(start);
        while let Some(id) = current {
            if id == stream {
                return true;
            }
            current = self.link(id).and_then(|link| link.parent_id());
        }
        false
    }

    // ========================================================================
    // Cache accounting
    // ========================================================================

    fn reserve_cache(&self, bytes: u64) -> StoreResult<()> {
        let limit = self.config.cache_size_limit;
        if limit == 0 {
            self.cache_used.fetch_add(bytes, Ordering::Relaxed);
            return Ok(());
        }
        self.cache_used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                let next = used.saturating_add(bytes);
                if next > limit {
                    None
                } else {
                    Some(next)
                }
            })
            .map(|_| ())
            .map_err(|_| StoreError::CacheSpaceExhausted {
                requested: bytes,
                limit,
            })
    }

    /// Charge restored items without enforcing the limit
    pub(crate) fn charge_cache(&self, bytes: u64) {
        self.cache_used.fetch_add(bytes, Ordering::Relaxed);
    }

    fn release_cache(&self, bytes: u64) {
        let _ = self
            .cache_used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    pub(crate) fn cache_used(&self) -> u64 {
        self.cache_used.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Add
    // ========================================================================

    /// Link a new entity into `parent` in the Adding state and enlist the
    /// task that finishes the add
    ///
    /// `owner` is the link of the stream owning `parent`, `None` for the
    /// root container.
    pub(crate) fn add_entity(
        self: &Arc<Self>,
        parent: &Arc<Container>,
        owner: Option<&Arc<ItemLink>>,
        request: AddRequest,
        tx: &Transaction,
    ) -> StoreResult<Arc<ItemLink>> {
        self.check_transaction(tx)?;
        if let Some(owner) = owner {
            check_open(owner)?;
        }

        let AddRequest {
            kind,
            item,
            referred,
        } = request;

        let strategy = match (&referred, item.storage_strategy()) {
            (Some(target), _) => target.strategy().min(parent.strategy()),
            (None, Some(requested)) if requested > parent.strategy() => {
                return Err(StoreError::invalid_add(format!(
                    "storage strategy {} exceeds the stream's {}",
                    requested,
                    parent.strategy()
                )));
            }
            (None, Some(requested)) => requested,
            (None, None) => parent.strategy(),
        };
        let priority = match &referred {
            Some(target) => target.priority(),
            None => item.priority().min(MAX_PRIORITY),
        };
        let (expiry_deadline, in_memory_size) = if kind == EntityKind::Item {
            let deadline = item
                .maximum_time_in_store()
                .filter(|d| !d.is_zero())
                .map(|d| now_millis().saturating_add(d.as_millis() as u64));
            (deadline, item.in_memory_size() as u64)
        } else {
            (None, 0)
        };

        let id = self.next_item_id()?;
        let container = kind.is_stream().then(|| {
            Arc::new(Container::new(
                id,
                strategy,
                self.config.spill_upper_limit,
                self.config.spill_lower_limit,
            ))
        });
        let link = Arc::new(ItemLink::new(
            LinkSpec {
                id,
                kind,
                item,
                strategy,
                priority,
                sequence: parent.next_sequence(),
                expiry_deadline,
                referred: referred.as_ref().map(|r| r.id()),
                in_memory_size,
            },
            parent,
            owner.map(|o| o.id()),
            container,
        ));

        self.reserve_cache(in_memory_size)?;
        let admitted = parent.insert_admitted(&link, || {
            if let Some(owner) = owner {
                check_open(owner)?;
            }
            link.begin_add(tx.id())
        });
        if let Err(e) = admitted {
            self.release_cache(in_memory_size);
            return Err(e);
        }
        self.register(&link);
        if let Some(target) = &referred {
            target.increment_references();
        }

        debug!(
            target: "msgstore::store",
            id = %id,
            kind = ?kind,
            parent = %parent.id(),
            txn = %tx.id(),
            strategy = strategy.as_str(),
            "Adding entity"
        );
        tx.enlist(Box::new(AddTask::new(Arc::clone(self), Arc::clone(&link), referred)))?;
        Ok(link)
    }
}

/// Fail unless `stream` can take new members
fn check_open(stream: &ItemLink) -> StoreResult<()> {
    let state = stream.state();
    if !state.is_in_store() || state == ItemState::Removing {
        return Err(StoreError::invalid_state(stream.id(), state, "add to stream"));
    }
    Ok(())
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("persistence", &self.persistence.name())
            .field("entities", &self.registry.len())
            .field("expiry_index", &self.expirer.len())
            .finish()
    }
}
