//! Record replay
//!
//! Replaying persisted records in order yields the set of live entities at
//! the time of the last durable commit. Both the file persistence manager
//! (for its checkpoint image) and the store (for restart) consume the
//! resulting [`RecoveredState`].
//!
//! Replay is forgiving about records that name entities it has never seen
//! (for example an update of an item whose add was checkpointed away and
//! then removed): they are counted as orphans and skipped.

use crate::record::{EntityRecord, IdGeneratorKind, LogFrame, PersistedRecord};
use msgstore_core::{ItemId, LockId};
use std::collections::BTreeMap;
use tracing::trace;

/// A live entity after replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredEntity {
    /// Entity as added, with the latest payload
    pub record: EntityRecord,
    /// Durable lock held at the time of the last commit
    pub persistent_lock: Option<LockId>,
}

/// Statistics from replay
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    /// Frames replayed
    pub frames_applied: usize,
    /// Add records applied
    pub adds_applied: usize,
    /// Update records applied
    pub updates_applied: usize,
    /// Remove records applied
    pub removes_applied: usize,
    /// Lock and unlock records applied
    pub locks_applied: usize,
    /// Records naming an entity that is not live
    pub orphaned_records: usize,
}

/// Live entities and id reservations reconstructed from records
#[derive(Debug, Default, Clone)]
pub struct RecoveredState {
    entities: BTreeMap<ItemId, RecoveredEntity>,
    high_water: BTreeMap<IdGeneratorKind, u64>,
    stats: ReplayStats,
}

impl RecoveredState {
    /// Empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay every record of a frame
    pub fn apply_frame(&mut self, frame: &LogFrame) {
        for record in frame.records() {
            self.apply(record);
        }
        self.stats.frames_applied += 1;
    }

    /// Replay one record
    pub fn apply(&mut self, record: &PersistedRecord) {
        match record {
            PersistedRecord::Add(entity) => {
                self.entities.insert(
                    entity.id,
                    RecoveredEntity {
                        record: entity.clone(),
                        persistent_lock: None,
                    },
                );
                self.stats.adds_applied += 1;
            }
            PersistedRecord::Update { id, data } => match self.entities.get_mut(id) {
                Some(entity) => {
                    entity.record.data = data.clone();
                    self.stats.updates_applied += 1;
                }
                None => self.orphan(record),
            },
            PersistedRecord::Remove { id } => {
                if self.entities.remove(id).is_some() {
                    self.stats.removes_applied += 1;
                } else {
                    self.orphan(record);
                }
            }
            PersistedRecord::PersistLock { id, lock_id } => match self.entities.get_mut(id) {
                Some(entity) => {
                    entity.persistent_lock = Some(*lock_id);
                    self.stats.locks_applied += 1;
                }
                None => self.orphan(record),
            },
            PersistedRecord::PersistUnlock { id } => match self.entities.get_mut(id) {
                Some(entity) => {
                    entity.persistent_lock = None;
                    self.stats.locks_applied += 1;
                }
                None => self.orphan(record),
            },
            PersistedRecord::IdReservation {
                generator,
                high_water,
            } => {
                let current = self.high_water.entry(*generator).or_insert(0);
                *current = (*current).max(*high_water);
            }
        }
    }

    fn orphan(&mut self, record: &PersistedRecord) {
        trace!(
            target: "msgstore::recovery",
            entity = ?record.entity_id(),
            "Skipping record for an entity that is not live"
        );
        self.stats.orphaned_records += 1;
    }

    /// Live entities in id order (parents before children)
    pub fn entities(&self) -> impl Iterator<Item = &RecoveredEntity> {
        self.entities.values()
    }

    /// Look up one live entity
    pub fn get(&self, id: ItemId) -> Option<&RecoveredEntity> {
        self.entities.get(&id)
    }

    /// Highest reserved id for a generator (0 when never reserved)
    pub fn high_water(&self, generator: IdGeneratorKind) -> u64 {
        self.high_water.get(&generator).copied().unwrap_or(0)
    }

    /// Highest entity id seen, live or reserved
    pub fn max_entity_id(&self) -> u64 {
        self.entities
            .keys()
            .next_back()
            .map(|id| id.as_u64())
            .unwrap_or(0)
    }

    /// Number of live entities
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether nothing is live
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Replay statistics
    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    /// Minimal record sequence that reproduces this state
    ///
    /// Used to write a checkpoint: one add per live entity (with its
    /// current payload), one lock per durable lock, one reservation per
    /// generator.
    pub fn to_records(&self) -> Vec<PersistedRecord> {
        let mut records = Vec::with_capacity(self.entities.len() + self.high_water.len());
        for (generator, high_water) in &self.high_water {
            records.push(PersistedRecord::IdReservation {
                generator: *generator,
                high_water: *high_water,
            });
        }
        for entity in self.entities.values() {
            records.push(PersistedRecord::Add(entity.record.clone()));
            if let Some(lock_id) = entity.persistent_lock {
                records.push(PersistedRecord::PersistLock {
                    id: entity.record.id,
                    lock_id,
                });
            }
        }
        records
    }
}
