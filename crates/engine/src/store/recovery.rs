//! Rebuild the live entity set after a restart
//!
//! Recovered entities arrive in id order. A stream is always created before
//! anything placed in it and an item before any reference to it, so one
//! pass is enough: each entity finds its parent container (and, for a
//! reference, its referred item) among the entities already rebuilt.
//!
//! Entities whose parent or referred item did not survive are dropped and
//! a durable remove is written for them, so they do not come back on the
//! next restart either.

use super::runtime::Runtime;
use crate::container::Container;
use crate::link::{ItemLink, LinkSpec};
use msgstore_core::{Item, ItemRestorer, StorageStrategy, StoreError, StoreResult};
use msgstore_durability::{CommitBatch, EntityKind, PersistedRecord, RecoveredState};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecoverySummary {
    pub(crate) restored: usize,
    pub(crate) dropped: usize,
}

pub(crate) fn rebuild(
    runtime: &Arc<Runtime>,
    recovered: &RecoveredState,
    item_types: &HashMap<String, ItemRestorer>,
) -> StoreResult<RecoverySummary> {
    let mut summary = RecoverySummary::default();
    let mut dropped = CommitBatch::new(runtime.transactions().next_txn_id());

    for entity in recovered.entities() {
        let record = &entity.record;

        let parent: Arc<Container> = match record.parent {
            None => Arc::clone(runtime.root()),
            Some(parent_id) => match runtime.link(parent_id).and_then(|l| l.container().cloned()) {
                Some(container) => container,
                None => {
                    warn!(
                        target: "msgstore::recovery",
                        id = %record.id,
                        parent = %parent_id,
                        "Parent stream missing; dropping entity"
                    );
                    dropped.push(
                        PersistedRecord::Remove { id: record.id },
                        StorageStrategy::Always,
                        false,
                    );
                    continue;
                }
            },
        };

        let (item, referred): (Arc<dyn Item>, Option<Arc<ItemLink>>) = match record.kind {
            EntityKind::Reference => match record.referred.and_then(|id| runtime.link(id)) {
                Some(target) => (Arc::clone(target.item()), Some(target)),
                None => {
                    warn!(
                        target: "msgstore::recovery",
                        id = %record.id,
                        "Referred item missing; dropping reference"
                    );
                    dropped.push(
                        PersistedRecord::Remove { id: record.id },
                        StorageStrategy::Always,
                        false,
                    );
                    continue;
                }
            },
            _ => {
                let restorer = item_types
                    .get(&record.type_name)
                    .ok_or_else(|| StoreError::UnknownItemType(record.type_name.clone()))?;
                (restorer(&record.data)?, None)
            }
        };

        let in_memory_size = if record.kind == EntityKind::Item {
            item.in_memory_size() as u64
        } else {
            0
        };
        let container = record.kind.is_stream().then(|| {
            let config = runtime.config();
            Arc::new(Container::new(
                record.id,
                record.strategy,
                config.spill_upper_limit,
                config.spill_lower_limit,
            ))
        });
        let link = Arc::new(ItemLink::new(
            LinkSpec {
                id: record.id,
                kind: record.kind,
                item,
                strategy: record.strategy,
                priority: record.priority,
                sequence: record.sequence,
                expiry_deadline: record.expiry_deadline,
                referred: record.referred,
                in_memory_size,
            },
            &parent,
            record.parent,
            container,
        ));

        parent.observe_sequence(record.sequence);
        link.restore(entity.persistent_lock)?;
        parent.insert(&link);
        runtime.register(&link);
        runtime.charge_cache(in_memory_size);
        if let Some(target) = &referred {
            target.increment_references();
        }
        runtime.expirer().track(&link);
        if link.owns_item() {
            if let Some(hook) = link.item().hooks().restored {
                hook.on_restored();
            }
        }
        summary.restored += 1;
    }

    summary.dropped = dropped.len();
    if !dropped.is_empty() {
        runtime.persistence().write(&dropped)?;
        debug!(
            target: "msgstore::recovery",
            dropped = summary.dropped,
            "Wrote removes for dropped entities"
        );
    }
    Ok(summary)
}
