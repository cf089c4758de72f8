//! Shared helpers for the store integration suite.

#![allow(dead_code)]

pub use msgstore::*;
use parking_lot::Mutex;
use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Type name of [`Message`]
pub const MESSAGE_TYPE: &str = "test.message";

// ============================================================================
// Event recording
// ============================================================================

/// Hook notifications in the order they arrived, as `"hook:body"`.
#[derive(Default)]
pub struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, event: String) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, hook: &str) -> usize {
        let prefix = format!("{}:", hook);
        self.0.lock().iter().filter(|e| e.starts_with(&prefix)).count()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

// ============================================================================
// Test item
// ============================================================================

/// Application item used throughout the suite.
pub struct Message {
    pub body: String,
    pub priority: u8,
    pub strategy: Option<StorageStrategy>,
    pub ttl: Option<Duration>,
    pub silent_expiry: bool,
    pub veto: bool,
    pub events: Option<Arc<EventLog>>,
}

impl Message {
    pub fn new(body: impl Into<String>) -> Self {
        Message {
            body: body.into(),
            priority: DEFAULT_PRIORITY,
            strategy: None,
            ttl: None,
            silent_expiry: false,
            veto: false,
            events: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_strategy(mut self, strategy: StorageStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_events(mut self, events: &Arc<EventLog>) -> Self {
        self.events = Some(Arc::clone(events));
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent_expiry = true;
        self
    }

    pub fn vetoing(mut self) -> Self {
        self.veto = true;
        self
    }

    pub fn shared(self) -> Arc<dyn Item> {
        Arc::new(self)
    }

    fn log(&self, hook: &str) {
        if let Some(events) = &self.events {
            events.record(format!("{}:{}", hook, self.body));
        }
    }

    /// Restore function registered for [`MESSAGE_TYPE`]
    pub fn restore(data: &[DataSlice]) -> StoreResult<Arc<dyn Item>> {
        match data {
            [body, priority] => {
                let body = String::from_utf8(body.as_bytes().to_vec())
                    .map_err(|e| StoreError::Corruption(e.to_string()))?;
                let priority = priority.as_bytes().first().copied().unwrap_or(DEFAULT_PRIORITY);
                Ok(Arc::new(Message::new(body).with_priority(priority)))
            }
            _ => Err(StoreError::Corruption("message needs two slices".into())),
        }
    }
}

impl OnPrecommitAdd for Message {
    fn on_precommit_add(&self, _tx: TransactionId) -> StoreResult<()> {
        self.log("precommit_add");
        if self.veto {
            return Err(StoreError::internal(format!("{} vetoed", self.body)));
        }
        Ok(())
    }
}

impl OnCommitAdd for Message {
    fn on_commit_add(&self, _tx: TransactionId) {
        self.log("commit_add");
    }
}

impl OnRollbackAdd for Message {
    fn on_rollback_add(&self, _tx: TransactionId) {
        self.log("rollback_add");
    }
}

impl OnCommitRemove for Message {
    fn on_commit_remove(&self, _tx: TransactionId) {
        self.log("commit_remove");
    }
}

impl OnRollbackRemove for Message {
    fn on_rollback_remove(&self, _tx: TransactionId) {
        self.log("rollback_remove");
    }
}

impl OnCommitUpdate for Message {
    fn on_commit_update(&self, _tx: TransactionId) {
        self.log("commit_update");
    }
}

impl OnRollbackUpdate for Message {
    fn on_rollback_update(&self, _tx: TransactionId) {
        self.log("rollback_update");
    }
}

impl OnUnlocked for Message {
    fn on_unlocked(&self) {
        self.log("unlocked");
    }
}

impl OnExpiry for Message {
    fn on_expiry(&self, _tx: TransactionId) {
        self.log("expiry");
    }
}

impl Item for Message {
    fn type_name(&self) -> &'static str {
        MESSAGE_TYPE
    }

    fn storage_strategy(&self) -> Option<StorageStrategy> {
        self.strategy
    }

    fn maximum_time_in_store(&self) -> Option<Duration> {
        self.ttl
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn can_expire_silently(&self) -> bool {
        self.silent_expiry
    }

    fn persistent_data(&self) -> StoreResult<PersistentData> {
        Ok(vec![
            DataSlice::from(self.body.as_str()),
            DataSlice::new(vec![self.priority]),
        ])
    }

    fn hooks(&self) -> ItemHooks<'_> {
        ItemHooks::none()
            .with_precommit_add(self)
            .with_commit_add(self)
            .with_rollback_add(self)
            .with_commit_remove(self)
            .with_rollback_remove(self)
            .with_commit_update(self)
            .with_rollback_update(self)
            .with_unlocked(self)
            .with_expiry(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Filter selecting messages with the given body
pub fn body_is(body: &str) -> impl Filter {
    let body = body.to_string();
    move |item: &dyn Item| downcast_item::<Message>(item).map_or(false, |m| m.body == body)
}

/// Body of the message behind `handle`
pub fn body(handle: &ItemHandle) -> String {
    handle
        .downcast::<Message>()
        .map(|m| m.body.clone())
        .expect("handle is not a message")
}

// ============================================================================
// Store setup
// ============================================================================

/// In-memory configuration with the expirer thread disabled
pub fn memory_config() -> StoreConfig {
    StoreConfig {
        expiry_interval_ms: 0,
        ..StoreConfig::in_memory()
    }
}

/// File-backed configuration under `dir` with the expirer thread disabled
pub fn file_config(dir: &Path) -> StoreConfig {
    StoreConfig {
        expiry_interval_ms: 0,
        ..StoreConfig::for_directory(dir)
    }
}

/// Started store that can restore [`Message`]s
pub fn open_store(config: StoreConfig) -> MessageStore {
    let store = MessageStore::new();
    store.register_item_type(MESSAGE_TYPE, Message::restore);
    store.initialize(config).unwrap();
    store.start().unwrap();
    store
}

pub fn memory_store() -> MessageStore {
    open_store(memory_config())
}

/// Root stream added and committed on its own
pub fn add_stream(store: &MessageStore, name: &str) -> ItemStream {
    let tx = store.begin_auto_commit().unwrap();
    store
        .add_item_stream(Arc::new(StreamDescriptor::new(name)), &tx)
        .unwrap()
}

/// Message added and committed on its own
pub fn add_message(store: &MessageStore, stream: &ItemStream, message: Message) -> ItemHandle {
    let tx = store.begin_auto_commit().unwrap();
    stream.add_item(message.shared(), &tx).unwrap()
}
