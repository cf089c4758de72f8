//! Per-stream statistics and spill state
//!
//! Counts are kept per lifecycle state and updated only by
//! [`ListStatistics::record_transition`], which the item link calls while
//! holding the item's slot lock. A count therefore never disagrees with the
//! state of the items it describes.
//!
//! Spilling uses hysteresis: it turns on when the total reaches the upper
//! limit and turns off only once the total has fallen to the lower limit.

use msgstore_core::{ItemId, ItemState, StoreError, StoreResult};

/// Snapshot of a stream's counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Entities linked into the stream in any state
    pub total_item_count: u64,
    /// Entities visible to finds and cursors
    pub available_item_count: u64,
    /// Entities linked but not visible
    pub unavailable_item_count: u64,
    /// Entities being added
    pub adding_item_count: u64,
    /// Entities locked (in memory or persistently)
    pub locked_item_count: u64,
    /// Entities being updated
    pub updating_item_count: u64,
    /// Entities being removed
    pub removing_item_count: u64,
    /// Entities being expired
    pub expiring_item_count: u64,
}

/// Live counters of one stream
#[derive(Debug, Clone)]
pub(crate) struct ListStatistics {
    adding: u64,
    available: u64,
    locked: u64,
    updating: u64,
    removing: u64,
    expiring: u64,
    spilling: bool,
    spill_upper_limit: u64,
    spill_lower_limit: u64,
    maximum_depth: Option<u64>,
}

impl ListStatistics {
    pub(crate) fn new(spill_upper_limit: u64, spill_lower_limit: u64) -> Self {
        ListStatistics {
            adding: 0,
            available: 0,
            locked: 0,
            updating: 0,
            removing: 0,
            expiring: 0,
            spilling: false,
            spill_upper_limit,
            spill_lower_limit,
            maximum_depth: None,
        }
    }

    fn bucket(&mut self, state: ItemState) -> Option<&mut u64> {
        match state {
            ItemState::NotInStore => None,
            ItemState::Adding => Some(&mut self.adding),
            ItemState::Available => Some(&mut self.available),
            ItemState::Locked | ItemState::PersistentlyLocked => Some(&mut self.locked),
            ItemState::Updating => Some(&mut self.updating),
            ItemState::Removing => Some(&mut self.removing),
            ItemState::Expiring => Some(&mut self.expiring),
        }
    }

    /// Entities linked in any state
    pub(crate) fn total(&self) -> u64 {
        self.adding + self.available + self.locked + self.updating + self.removing + self.expiring
    }

    /// Move one entity between states
    pub(crate) fn record_transition(&mut self, from: ItemState, to: ItemState) {
        if from == to {
            return;
        }
        if let Some(count) = self.bucket(from) {
            *count = count.saturating_sub(1);
        }
        if let Some(count) = self.bucket(to) {
            *count += 1;
        }
        self.update_spilling();
    }

    /// Refuse an add that would exceed the maximum depth
    pub(crate) fn check_depth(&self, stream: ItemId) -> StoreResult<()> {
        match self.maximum_depth {
            Some(limit) if self.total() >= limit => Err(StoreError::StreamFull { stream, limit }),
            _ => Ok(()),
        }
    }

    fn update_spilling(&mut self) {
        let total = self.total();
        if !self.spilling && total >= self.spill_upper_limit {
            self.spilling = true;
        } else if self.spilling && total <= self.spill_lower_limit {
            self.spilling = false;
        }
    }

    pub(crate) fn is_spilling(&self) -> bool {
        self.spilling
    }

    pub(crate) fn set_spill_limits(&mut self, upper: u64, lower: u64) -> StoreResult<()> {
        if lower >= upper {
            return Err(StoreError::invalid_config(format!(
                "spill lower limit {} must be below upper limit {}",
                lower, upper
            )));
        }
        self.spill_upper_limit = upper;
        self.spill_lower_limit = lower;
        self.update_spilling();
        Ok(())
    }

    pub(crate) fn spill_limits(&self) -> (u64, u64) {
        (self.spill_upper_limit, self.spill_lower_limit)
    }

    pub(crate) fn set_maximum_depth(&mut self, depth: Option<u64>) {
        self.maximum_depth = depth;
    }

    pub(crate) fn maximum_depth(&self) -> Option<u64> {
        self.maximum_depth
    }

    pub(crate) fn snapshot(&self) -> Statistics {
        let total = self.total();
        Statistics {
            total_item_count: total,
            available_item_count: self.available,
            unavailable_item_count: total - self.available,
            adding_item_count: self.adding,
            locked_item_count: self.locked,
            updating_item_count: self.updating,
            removing_item_count: self.removing,
            expiring_item_count: self.expiring,
        }
    }
}
