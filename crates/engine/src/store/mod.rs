//! The message store facade
//!
//! [`MessageStore`] walks the lifecycle `Created → Initialized → Started →
//! Stopped → Destroyed`. Everything that touches stored data goes through
//! the started runtime; once the store is stopped, or if `start()`
//! failed, those operations fail with `StoreError::Unavailable`, carrying
//! the start-up failure as its source when there was one.
//!
//! A stopped store cannot be restarted. Open a fresh instance instead.

mod config;
mod recovery;
mod runtime;

pub use config::{StoreConfig, CONFIG_FILE_NAME};
pub(crate) use runtime::{AddRequest, Runtime};

use crate::expirer::ExpirerStats;
use crate::handle::ItemHandle;
use crate::stream::{ItemStream, StreamDescriptor, STREAM_DESCRIPTOR_TYPE};
use crate::tasks::RemoveTask;
use msgstore_concurrency::{Transaction, TransactionKind, TransactionMetrics};
use msgstore_core::{
    filter_matches, DataSlice, Filter, Item, ItemId, ItemRestorer, ItemState, LockId,
    StorageStrategy, StoreError, StoreResult,
};
use msgstore_durability::{EntityKind, PersistenceCounters};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Lifecycle state of a [`MessageStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreState {
    /// Constructed, not yet configured
    Created,
    /// Configured; ready to start
    Initialized,
    /// Serving requests
    Started,
    /// Shut down; cannot be restarted
    Stopped,
    /// Released
    Destroyed,
}

impl StoreState {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreState::Created => "created",
            StoreState::Initialized => "initialized",
            StoreState::Started => "started",
            StoreState::Stopped => "stopped",
            StoreState::Destroyed => "destroyed",
        }
    }
}

impl std::fmt::Display for StoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the store is able to serve requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthState {
    /// Started successfully
    Healthy,
    /// `start()` failed
    Unhealthy,
    /// Not started, or stopped
    Inactive,
}

struct Lifecycle {
    state: StoreState,
    config: StoreConfig,
    runtime: Option<Arc<Runtime>>,
    startup_failure: Option<Arc<StoreError>>,
}

/// State shared between the facade and every handle it gives out
pub(crate) struct StoreInner {
    lifecycle: RwLock<Lifecycle>,
    item_types: RwLock<HashMap<String, ItemRestorer>>,
}

impl StoreInner {
    /// The started runtime, or `Unavailable`
    pub(crate) fn runtime(&self) -> StoreResult<Arc<Runtime>> {
        let lifecycle = self.lifecycle.read();
        match (&lifecycle.runtime, lifecycle.state) {
            (Some(runtime), StoreState::Started) => Ok(Arc::clone(runtime)),
            _ => Err(StoreError::unavailable(
                format!("message store is {}", lifecycle.state),
                lifecycle.startup_failure.clone(),
            )),
        }
    }
}

/// Persistent, transactional store of application items
///
/// Dropping a started store stops it with the configured stop timeout.
///
/// # Example
///
/// ```no_run
/// use msgstore_engine::{MessageStore, StoreConfig, StreamDescriptor};
/// use std::sync::Arc;
///
/// let store = MessageStore::open(StoreConfig::in_memory())?;
/// let tx = store.begin_local()?;
/// let orders = store.add_item_stream(Arc::new(StreamDescriptor::new("orders")), &tx)?;
/// tx.commit()?;
/// assert_eq!(orders.get_statistics().total_item_count, 0);
/// store.stop_default()?;
/// # Ok::<(), msgstore_core::StoreError>(())
/// ```
pub struct MessageStore {
    inner: Arc<StoreInner>,
}

impl MessageStore {
    /// New store in the `Created` state
    ///
    /// [`StreamDescriptor`] is registered as an item type up front.
    pub fn new() -> Self {
        let mut item_types: HashMap<String, ItemRestorer> = HashMap::new();
        item_types.insert(
            STREAM_DESCRIPTOR_TYPE.to_string(),
            Arc::new(StreamDescriptor::restore),
        );
        MessageStore {
            inner: Arc::new(StoreInner {
                lifecycle: RwLock::new(Lifecycle {
                    state: StoreState::Created,
                    config: StoreConfig::default(),
                    runtime: None,
                    startup_failure: None,
                }),
                item_types: RwLock::new(item_types),
            }),
        }
    }

    /// `new`, `initialize` and `start` in one call
    ///
    /// Item types other than [`StreamDescriptor`] cannot be registered
    /// before start this way, so use the three steps when restoring
    /// application items.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let store = MessageStore::new();
        store.initialize(config)?;
        store.start()?;
        Ok(store)
    }

    /// Initialize from `msgstore.toml` in `dir`
    pub fn initialize_from_directory(&self, dir: impl AsRef<Path>) -> StoreResult<()> {
        self.initialize(StoreConfig::load_from_directory(dir)?)
    }

    /// Created → Initialized
    pub fn initialize(&self, config: StoreConfig) -> StoreResult<()> {
        config.validate()?;
        let mut lifecycle = self.inner.lifecycle.write();
        if lifecycle.state != StoreState::Created {
            return Err(StoreError::InvalidStoreState {
                state: lifecycle.state.to_string(),
                operation: "initialize",
            });
        }
        lifecycle.config = config;
        lifecycle.state = StoreState::Initialized;
        Ok(())
    }

    /// Register the restore function for items whose `type_name()` is
    /// `type_name`
    ///
    /// Every item type that may be found in the store's persisted data must
    /// be registered before `start()`, or recovery fails with
    /// `UnknownItemType`.
    pub fn register_item_type<F>(&self, type_name: &str, restore: F)
    where
        F: Fn(&[DataSlice]) -> StoreResult<Arc<dyn Item>> + Send + Sync + 'static,
    {
        self.inner
            .item_types
            .write()
            .insert(type_name.to_string(), Arc::new(restore));
    }

    /// Initialized → Started
    ///
    /// Starts persistence, recovers stored data and starts the expirer.
    ///
    /// # Errors
    /// If anything fails the store stays unstarted and unhealthy; this and
    /// every later data operation fails with `Unavailable` whose source is
    /// the original failure.
    pub fn start(&self) -> StoreResult<()> {
        let mut lifecycle = self.inner.lifecycle.write();
        if lifecycle.state != StoreState::Initialized {
            return Err(StoreError::InvalidStoreState {
                state: lifecycle.state.to_string(),
                operation: "start",
            });
        }
        let item_types = self.inner.item_types.read().clone();

        match Runtime::start(lifecycle.config.clone(), &item_types) {
            Ok(runtime) => {
                runtime.expirer().start(&runtime);
                info!(
                    target: "msgstore::store",
                    persistence = runtime.persistence().name(),
                    entities = runtime.entity_count(),
                    "Message store started"
                );
                lifecycle.runtime = Some(runtime);
                lifecycle.startup_failure = None;
                lifecycle.state = StoreState::Started;
                Ok(())
            }
            Err(e) => {
                error!(target: "msgstore::store", error = %e, "Message store failed to start");
                let cause = Arc::new(e);
                lifecycle.startup_failure = Some(Arc::clone(&cause));
                Err(StoreError::unavailable("start failed", Some(cause)))
            }
        }
    }

    /// Started → Stopped
    ///
    /// New transactions are refused at once. Active ones get up to
    /// `timeout` to finish; then the expirer stops and persistence is
    /// flushed and closed. Stopping a stopped store does nothing.
    pub fn stop(&self, timeout: Duration) -> StoreResult<()> {
        let runtime = {
            let mut lifecycle = self.inner.lifecycle.write();
            match lifecycle.state {
                StoreState::Stopped => return Ok(()),
                StoreState::Started => {}
                state => {
                    return Err(StoreError::InvalidStoreState {
                        state: state.to_string(),
                        operation: "stop",
                    })
                }
            }
            lifecycle.state = StoreState::Stopped;
            lifecycle.runtime.take()
        };
        let Some(runtime) = runtime else {
            return Ok(());
        };

        let transactions = runtime.transactions();
        transactions.stop_accepting();
        if !transactions.wait_for_idle(timeout) {
            warn!(
                target: "msgstore::store",
                active = transactions.active_count(),
                timeout_ms = timeout.as_millis() as u64,
                "Stopping with transactions still active"
            );
        }
        runtime.expirer().stop();

        let persistence = runtime.persistence();
        let flushed = persistence.flush();
        let stopped = persistence.stop();
        info!(target: "msgstore::store", "Message store stopped");
        flushed.and(stopped)
    }

    /// Stop with the configured `stop_timeout_ms`
    pub fn stop_default(&self) -> StoreResult<()> {
        let timeout = self.inner.lifecycle.read().config.stop_timeout();
        self.stop(timeout)
    }

    /// Stopped (or Initialized) → Destroyed
    pub fn destroy(&self) -> StoreResult<()> {
        let mut lifecycle = self.inner.lifecycle.write();
        match lifecycle.state {
            StoreState::Stopped | StoreState::Initialized => {
                lifecycle.state = StoreState::Destroyed;
                lifecycle.runtime = None;
                Ok(())
            }
            state => Err(StoreError::InvalidStoreState {
                state: state.to_string(),
                operation: "destroy",
            }),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> StoreState {
        self.inner.lifecycle.read().state
    }

    /// Whether the store can serve requests
    pub fn health_state(&self) -> HealthState {
        let lifecycle = self.inner.lifecycle.read();
        if lifecycle.state == StoreState::Started {
            HealthState::Healthy
        } else if lifecycle.startup_failure.is_some() {
            HealthState::Unhealthy
        } else {
            HealthState::Inactive
        }
    }

    /// Error that made `start()` fail, if it did
    pub fn startup_failure(&self) -> Option<Arc<StoreError>> {
        self.inner.lifecycle.read().startup_failure.clone()
    }

    /// Configuration given to `initialize()`
    pub fn config(&self) -> StoreConfig {
        self.inner.lifecycle.read().config.clone()
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begin a local transaction, completed by `commit()` or `rollback()`
    pub fn begin_local(&self) -> StoreResult<Transaction> {
        self.inner.runtime()?.transactions().begin(TransactionKind::Local)
    }

    /// Begin an auto-commit transaction; each enlisted operation commits
    /// on its own
    pub fn begin_auto_commit(&self) -> StoreResult<Transaction> {
        self.inner
            .runtime()?
            .transactions()
            .begin(TransactionKind::AutoCommit)
    }

    // ========================================================================
    // Root streams
    // ========================================================================

    /// Add a root item stream described by `descriptor`
    pub fn add_item_stream(
        &self,
        descriptor: Arc<dyn Item>,
        tx: &Transaction,
    ) -> StoreResult<ItemStream> {
        let runtime = self.inner.runtime()?;
        let link = runtime.add_entity(
            runtime.root(),
            None,
            AddRequest {
                kind: EntityKind::ItemStream,
                item: descriptor,
                referred: None,
            },
            tx,
        )?;
        ItemStream::from_link(Arc::clone(&self.inner), link)
            .ok_or_else(|| StoreError::internal("item stream link without container"))
    }

    /// Root item streams that are in the store
    pub fn item_streams(&self) -> StoreResult<Vec<ItemStream>> {
        let runtime = self.inner.runtime()?;
        Ok(runtime
            .root()
            .streams()
            .into_iter()
            .filter(|link| link.kind() == EntityKind::ItemStream && link.state().is_in_store())
            .filter_map(|link| ItemStream::from_link(Arc::clone(&self.inner), link))
            .collect())
    }

    /// First available root item stream whose descriptor matches `filter`
    pub fn find_first_matching_item_stream(
        &self,
        filter: Option<&dyn Filter>,
    ) -> StoreResult<Option<ItemStream>> {
        let runtime = self.inner.runtime()?;
        Ok(runtime
            .root()
            .streams()
            .into_iter()
            .find(|link| {
                link.kind() == EntityKind::ItemStream
                    && link.is_available()
                    && filter_matches(filter, link.item().as_ref())
            })
            .and_then(|link| ItemStream::from_link(Arc::clone(&self.inner), link)))
    }

    /// Claim the first available, empty root item stream matching `filter`
    /// and remove it under `tx`
    pub fn remove_first_matching_item_stream(
        &self,
        filter: Option<&dyn Filter>,
        tx: &Transaction,
    ) -> StoreResult<Option<ItemStream>> {
        let runtime = self.inner.runtime()?;
        runtime.check_transaction(tx)?;
        let claimed = runtime.root().streams().into_iter().find(|link| {
            link.kind() == EntityKind::ItemStream
                && link.is_available()
                && filter_matches(filter, link.item().as_ref())
                && link
                    .container()
                    .and_then(|c| c.claim_if_empty(|| link.try_begin_remove(tx.id())))
                    .unwrap_or(false)
        });
        match claimed {
            Some(link) => {
                tx.enlist(Box::new(RemoveTask::remove(
                    Arc::clone(&runtime),
                    Arc::clone(&link),
                )))?;
                Ok(ItemStream::from_link(Arc::clone(&self.inner), link))
            }
            None => Ok(None),
        }
    }

    /// Handle to any entity in the store by id
    pub fn find_by_id(&self, id: ItemId) -> StoreResult<Option<ItemHandle>> {
        let runtime = self.inner.runtime()?;
        Ok(runtime
            .link(id)
            .filter(|link| link.state() != ItemState::NotInStore)
            .map(|link| ItemHandle::new(Arc::clone(&self.inner), link)))
    }

    // ========================================================================
    // Unique values
    // ========================================================================

    /// Lock id that will never be issued again; for `Never` items the id is
    /// only unique within this store instance
    pub fn get_unique_lock_id(&self, strategy: StorageStrategy) -> StoreResult<LockId> {
        self.inner.runtime()?.unique_lock_id(strategy)
    }

    /// Monotonic tick count that never repeats across restarts
    pub fn get_unique_tick_count(&self) -> StoreResult<u64> {
        self.inner.runtime()?.unique_tick()
    }

    // ========================================================================
    // Expirer
    // ========================================================================

    /// Start the expirer thread; does nothing if it runs or expiry is
    /// disabled
    pub fn expirer_start(&self) -> StoreResult<()> {
        let runtime = self.inner.runtime()?;
        runtime.expirer().start(&runtime);
        Ok(())
    }

    /// Stop the expirer thread; pending deadlines are kept
    pub fn expirer_stop(&self) -> StoreResult<()> {
        self.inner.runtime()?.expirer().stop();
        Ok(())
    }

    /// Run one expiry pass on the calling thread; returns how many items
    /// expired
    pub fn run_expiry_pass(&self) -> StoreResult<usize> {
        let runtime = self.inner.runtime()?;
        Ok(runtime.expirer().run_pass(&runtime))
    }

    /// Items waiting in the expiry index
    pub fn expiry_index_size(&self) -> StoreResult<usize> {
        Ok(self.inner.runtime()?.expirer().len())
    }

    /// Expiry counters
    pub fn expirer_stats(&self) -> StoreResult<ExpirerStats> {
        Ok(self.inner.runtime()?.expirer().stats())
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Transaction counters
    pub fn transaction_metrics(&self) -> StoreResult<TransactionMetrics> {
        Ok(self.inner.runtime()?.transactions().metrics())
    }

    /// Persistence counters
    pub fn persistence_counters(&self) -> StoreResult<PersistenceCounters> {
        Ok(self.inner.runtime()?.persistence().counters())
    }

    /// Bytes of item data charged against `cache_size_limit`
    pub fn cache_used(&self) -> StoreResult<u64> {
        Ok(self.inner.runtime()?.cache_used())
    }

    /// Force deferred (`Eventually`) writes to disk
    pub fn flush(&self) -> StoreResult<()> {
        self.inner.runtime()?.persistence().flush()
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MessageStore {
    fn drop(&mut self) {
        if self.state() == StoreState::Started {
            if let Err(e) = self.stop_default() {
                warn!(target: "msgstore::store", error = %e, "Stop on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lifecycle = self.inner.lifecycle.read();
        f.debug_struct("MessageStore")
            .field("state", &lifecycle.state)
            .field("runtime", &lifecycle.runtime)
            .finish()
    }
}
