use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::warn;

use crate::view::{TimelineDiff, TimelineSnapshot, TimelineUpdate};

/// Cloneable subscription endpoints of one room's [`TimelineView`](crate::view::TimelineView).
#[derive(Clone, Debug)]
pub struct ViewChannels {
    update_tx: broadcast::Sender<Arc<TimelineUpdate>>,
    latest_rx: watch::Receiver<Arc<TimelineSnapshot>>,
}

impl ViewChannels {
    pub(crate) fn new(
        update_tx: broadcast::Sender<Arc<TimelineUpdate>>,
        latest_rx: watch::Receiver<Arc<TimelineSnapshot>>,
    ) -> Self {
        Self {
            update_tx,
            latest_rx,
        }
    }

    /// Latest published snapshot.
    pub fn latest(&self) -> Arc<TimelineSnapshot> {
        self.latest_rx.borrow().clone()
    }

    /// Subscribe to the current snapshot plus every later update.
    pub fn subscribe(&self) -> TimelineSubscription {
        // Receiver first: anything published after the snapshot read is queued.
        let rx = self.update_tx.subscribe();
        let initial = self.latest();
        TimelineSubscription {
            last_version: initial.version,
            initial,
            rx,
            latest: self.latest_rx.clone(),
        }
    }
}

/// "Current value plus future updates" stream for one subscriber.
#[derive(Debug)]
pub struct TimelineSubscription {
    initial: Arc<TimelineSnapshot>,
    last_version: u64,
    rx: broadcast::Receiver<Arc<TimelineUpdate>>,
    latest: watch::Receiver<Arc<TimelineSnapshot>>,
}

impl TimelineSubscription {
    /// Snapshot current at subscription time.
    pub fn initial(&self) -> &Arc<TimelineSnapshot> {
        &self.initial
    }

    /// Version of the last snapshot this subscriber has seen.
    pub fn last_version(&self) -> u64 {
        self.last_version
    }

    /// Next update, or `None` once the room timeline is shut down.
    ///
    /// A subscriber that falls behind receives a single `Reset` to the latest snapshot.
    pub async fn next(&mut self) -> Option<Arc<TimelineUpdate>> {
        loop {
            let received = tokio::select! {
                biased;
                received = self.rx.recv() => received,
                changed = self.latest.changed() => {
                    // The view owns the only watch sender; once it is gone nothing
                    // more will be published.
                    if changed.is_err() {
                        return None;
                    }
                    continue;
                }
            };

            match received {
                Ok(update) if update.snapshot.version <= self.last_version => continue,
                Ok(update) => {
                    self.last_version = update.snapshot.version;
                    return Some(update);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let snapshot = self.latest.borrow_and_update().clone();
                    warn!(
                        skipped,
                        version = snapshot.version,
                        "timeline subscriber lagged; resetting"
                    );
                    if snapshot.version <= self.last_version {
                        continue;
                    }
                    self.last_version = snapshot.version;
                    return Some(Arc::new(TimelineUpdate {
                        diffs: vec![TimelineDiff::Reset {
                            items: snapshot.items.clone(),
                        }],
                        snapshot,
                    }));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
