//! Item filters
//!
//! Every find, remove and cursor operation takes an optional filter. A
//! missing filter matches everything.

use crate::item::Item;

/// Predicate over stored items
pub trait Filter: Send + Sync {
    /// Whether `item` is selected
    fn matches(&self, item: &dyn Item) -> bool;
}

impl<F> Filter for F
where
    F: Fn(&dyn Item) -> bool + Send + Sync,
{
    fn matches(&self, item: &dyn Item) -> bool {
        self(item)
    }
}

/// Filter that selects every item
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAll;

impl Filter for MatchAll {
    fn matches(&self, _item: &dyn Item) -> bool {
        true
    }
}

/// Apply an optional filter; `None` always matches
pub fn filter_matches(filter: Option<&dyn Filter>, item: &dyn Item) -> bool {
    filter.map_or(true, |f| f.matches(item))
}
