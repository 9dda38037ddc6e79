//! Published timeline state and the minimal diffs between successive snapshots.

use std::{collections::HashSet, sync::Arc};

use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::trace;

use crate::{
    channel::ViewChannels,
    types::{PaginationState, TimelineItem, TimelineItemId},
};

/// One positional change to a published item list.
///
/// Applying the diffs of an update in order to the previous item list yields
/// the new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineDiff {
    Insert { index: usize, item: TimelineItem },
    Update { index: usize, item: TimelineItem },
    Remove { index: usize },
    /// Replace everything; sent to subscribers that fell behind.
    Reset { items: Vec<TimelineItem> },
}

/// Errors that can occur while applying diffs to a local copy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiffError {
    #[error("diff index {index} is out of bounds for {len} items")]
    IndexOutOfBounds { index: usize, len: usize },
}

/// Immutable, versioned state of one room's timeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimelineSnapshot {
    pub version: u64,
    pub items: Vec<TimelineItem>,
    pub pagination: PaginationState,
    pub pinned: Vec<String>,
}

/// A new snapshot together with the diffs from the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineUpdate {
    pub snapshot: Arc<TimelineSnapshot>,
    pub diffs: Vec<TimelineDiff>,
}

/// Holds the last published snapshot and fans updates out to subscribers.
#[derive(Debug)]
pub struct TimelineView {
    current: watch::Sender<Arc<TimelineSnapshot>>,
    updates: broadcast::Sender<Arc<TimelineUpdate>>,
}

impl TimelineView {
    pub fn new(update_buffer: usize) -> Self {
        let (current, _) = watch::channel(Arc::new(TimelineSnapshot::default()));
        let (updates, _) = broadcast::channel(update_buffer.max(1));
        Self { current, updates }
    }

    pub fn current(&self) -> Arc<TimelineSnapshot> {
        self.current.borrow().clone()
    }

    /// Subscription endpoints that can outlive a borrow of the view.
    pub fn channels(&self) -> ViewChannels {
        ViewChannels::new(self.updates.clone(), self.current.subscribe())
    }

    /// Publish a reconciliation result.
    ///
    /// Returns `None` when nothing observable changed.
    pub fn publish(
        &self,
        items: Vec<TimelineItem>,
        pagination: PaginationState,
        pinned: Vec<String>,
    ) -> Option<Arc<TimelineUpdate>> {
        let previous = self.current();
        let diffs = compute_diff(&previous.items, &items);
        if diffs.is_empty() && previous.pagination == pagination && previous.pinned == pinned {
            return None;
        }

        let snapshot = Arc::new(TimelineSnapshot {
            version: previous.version + 1,
            items,
            pagination,
            pinned,
        });
        trace!(
            version = snapshot.version,
            items = snapshot.items.len(),
            diffs = diffs.len(),
            "publishing timeline snapshot"
        );

        // Snapshot first, so a subscriber that lags always finds at least this version.
        self.current.send_replace(snapshot.clone());
        let update = Arc::new(TimelineUpdate { snapshot, diffs });
        let _ = self.updates.send(update.clone());
        Some(update)
    }
}

/// Minimal positional diff from `old` to `new`, matching items by continuity key.
///
/// Removals come first (highest index first); then a single forward walk emits
/// updates, moves (remove plus insert) and inserts.
pub fn compute_diff(old: &[TimelineItem], new: &[TimelineItem]) -> Vec<TimelineDiff> {
    let new_keys: HashSet<TimelineItemId> = new.iter().map(TimelineItem::continuity_key).collect();
    let mut diffs = Vec::new();
    let mut working: Vec<&TimelineItem> = Vec::with_capacity(old.len());

    let mut removed = Vec::new();
    for (index, item) in old.iter().enumerate() {
        if new_keys.contains(&item.continuity_key()) {
            working.push(item);
        } else {
            removed.push(index);
        }
    }
    diffs.extend(
        removed
            .into_iter()
            .rev()
            .map(|index| TimelineDiff::Remove { index }),
    );

    for (index, item) in new.iter().enumerate() {
        let key = item.continuity_key();
        match working.get(index) {
            Some(existing) if existing.continuity_key() == key => {
                if *existing != item {
                    diffs.push(TimelineDiff::Update {
                        index,
                        item: item.clone(),
                    });
                    working[index] = item;
                }
            }
            _ => {
                let later = working
                    .iter()
                    .skip(index + 1)
                    .position(|candidate| candidate.continuity_key() == key)
                    .map(|offset| index + 1 + offset);
                if let Some(from) = later {
                    working.remove(from);
                    diffs.push(TimelineDiff::Remove { index: from });
                }
                working.insert(index, item);
                diffs.push(TimelineDiff::Insert {
                    index,
                    item: item.clone(),
                });
            }
        }
    }

    diffs
}

/// Apply diffs in order to a local copy of the item list.
pub fn apply_diff(items: &mut Vec<TimelineItem>, diffs: &[TimelineDiff]) -> Result<(), DiffError> {
    for diff in diffs {
        match diff {
            TimelineDiff::Insert { index, item } => {
                check_index(*index, items.len(), true)?;
                items.insert(*index, item.clone());
            }
            TimelineDiff::Update { index, item } => {
                check_index(*index, items.len(), false)?;
                items[*index] = item.clone();
            }
            TimelineDiff::Remove { index } => {
                check_index(*index, items.len(), false)?;
                items.remove(*index);
            }
            TimelineDiff::Reset { items: replacement } => *items = replacement.clone(),
        }
    }
    Ok(())
}

fn check_index(index: usize, len: usize, at_end_ok: bool) -> Result<(), DiffError> {
    if index < len || (at_end_ok && index == len) {
        Ok(())
    } else {
        Err(DiffError::IndexOutOfBounds { index, len })
    }
}
