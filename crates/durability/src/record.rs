//! Persisted record types
//!
//! Every durable change the store makes is one [`PersistedRecord`]. A
//! committed transaction produces a [`CommitBatch`]: its records, each
//! tagged with the storage strategy that decides where (and whether) the
//! record is written.

use msgstore_core::{DataSlice, ItemId, LockId, StorageStrategy, TransactionId};
use serde::{Deserialize, Serialize};

/// What kind of entity a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// Application item inside an item stream
    Item,
    /// Reference inside a reference stream
    Reference,
    /// Item stream (root or nested)
    ItemStream,
    /// Reference stream nested in an item stream
    ReferenceStream,
}

impl EntityKind {
    /// Whether the entity is a container
    pub fn is_stream(&self) -> bool {
        matches!(self, EntityKind::ItemStream | EntityKind::ReferenceStream)
    }
}

/// Full description of a stored entity at the time it was added
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Entity id
    pub id: ItemId,
    /// Owning stream; `None` for root streams
    pub parent: Option<ItemId>,
    /// Entity kind
    pub kind: EntityKind,
    /// Registered item type used to restore the payload
    pub type_name: String,
    /// Effective storage strategy
    pub strategy: StorageStrategy,
    /// Ordering priority
    pub priority: u8,
    /// Insertion sequence within the parent
    pub sequence: u64,
    /// Absolute expiry deadline in milliseconds since the epoch
    pub expiry_deadline: Option<u64>,
    /// Referred item (references only)
    pub referred: Option<ItemId>,
    /// Application payload
    pub data: Vec<DataSlice>,
}

/// Which unique id generator a reservation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdGeneratorKind {
    /// Entity ids
    Item,
    /// Cursor lock ids
    Lock,
    /// Tick counts
    Tick,
}

impl IdGeneratorKind {
    /// Short name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            IdGeneratorKind::Item => "item",
            IdGeneratorKind::Lock => "lock",
            IdGeneratorKind::Tick => "tick",
        }
    }
}

/// One durable change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistedRecord {
    /// Entity added
    Add(EntityRecord),
    /// Entity payload replaced
    Update {
        /// Entity id
        id: ItemId,
        /// New payload
        data: Vec<DataSlice>,
    },
    /// Entity removed (or expired)
    Remove {
        /// Entity id
        id: ItemId,
    },
    /// Cursor lock made durable
    PersistLock {
        /// Entity id
        id: ItemId,
        /// Lock id held
        lock_id: LockId,
    },
    /// Durable lock released
    PersistUnlock {
        /// Entity id
        id: ItemId,
    },
    /// Ids up to `high_water` (exclusive) may have been handed out
    IdReservation {
        /// Generator
        generator: IdGeneratorKind,
        /// First id never handed out
        high_water: u64,
    },
}

impl PersistedRecord {
    /// Entity the record is about, if any
    pub fn entity_id(&self) -> Option<ItemId> {
        match self {
            PersistedRecord::Add(entity) => Some(entity.id),
            PersistedRecord::Update { id, .. }
            | PersistedRecord::Remove { id }
            | PersistedRecord::PersistLock { id, .. }
            | PersistedRecord::PersistUnlock { id } => Some(*id),
            PersistedRecord::IdReservation { .. } => None,
        }
    }
}

/// Unit written to a store file
///
/// The log holds one `Commit` frame per committed transaction, so a torn
/// write loses the whole transaction rather than part of it. The permanent
/// store file holds one `Snapshot` frame per live record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFrame {
    /// Records of one commit, applied all or nothing
    Commit {
        /// Committing transaction, `None` for store-internal writes
        tx: Option<TransactionId>,
        /// Records in commit order
        records: Vec<PersistedRecord>,
    },
    /// One record of a checkpoint
    Snapshot(PersistedRecord),
}

impl LogFrame {
    /// Records carried by the frame
    pub fn records(&self) -> &[PersistedRecord] {
        match self {
            LogFrame::Commit { records, .. } => records,
            LogFrame::Snapshot(record) => std::slice::from_ref(record),
        }
    }
}

/// A record plus where it must go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    /// The change
    pub record: PersistedRecord,
    /// Strategy of the entity the record belongs to
    pub strategy: StorageStrategy,
    /// For `Maybe` records: whether the owning stream is spilling
    pub spill: bool,
}

/// Records produced by one committing transaction
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    /// Committing transaction
    pub tx: Option<TransactionId>,
    /// Records in commit order
    pub entries: Vec<BatchEntry>,
}

impl CommitBatch {
    /// Empty batch for a transaction
    pub fn new(tx: TransactionId) -> Self {
        Self {
            tx: Some(tx),
            entries: Vec::new(),
        }
    }

    /// Append a record
    pub fn push(&mut self, record: PersistedRecord, strategy: StorageStrategy, spill: bool) {
        self.entries.push(BatchEntry {
            record,
            strategy,
            spill,
        });
    }

    /// Whether there is nothing to write
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether any record demands an fsync before commit returns
    pub fn requires_sync(&self) -> bool {
        self.entries.iter().any(|e| e.strategy.requires_sync())
    }

    /// Records destined for the log (survive a restart)
    pub fn log_records(&self) -> impl Iterator<Item = &PersistedRecord> {
        self.entries
            .iter()
            .filter(|e| e.strategy.survives_restart())
            .map(|e| &e.record)
    }

    /// Records destined for the temporary spill store
    pub fn spill_records(&self) -> impl Iterator<Item = &PersistedRecord> {
        self.entries
            .iter()
            .filter(|e| e.strategy == StorageStrategy::Maybe && e.spill)
            .map(|e| &e.record)
    }
}
