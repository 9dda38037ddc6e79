use std::{collections::HashMap, sync::Arc};

use timeline_core::{Decryptor, SyncBatch, TimelineConfig, TimelineFocus};
use timeline_transport::RoomTransport;
use tokio::{sync::Mutex, task::JoinSet};
use tracing::{debug, info, trace, warn};

use crate::room::{RoomTimelineHandle, spawn_room_timeline};

/// Owns the room timeline actors of one signed-in user.
///
/// Rooms are opened lazily; sync batches are fanned out to every open room
/// concurrently and events for rooms nobody opened are dropped.
pub struct TimelineClient<T> {
    own_user_id: String,
    transport: Arc<T>,
    decryptor: Arc<dyn Decryptor>,
    config: TimelineConfig,
    rooms: Mutex<HashMap<String, RoomTimelineHandle>>,
}

impl<T: RoomTransport> TimelineClient<T> {
    pub fn new(
        own_user_id: impl Into<String>,
        transport: Arc<T>,
        decryptor: Arc<dyn Decryptor>,
        config: TimelineConfig,
    ) -> Self {
        Self {
            own_user_id: own_user_id.into(),
            transport,
            decryptor,
            config,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn own_user_id(&self) -> &str {
        &self.own_user_id
    }

    pub fn config(&self) -> &TimelineConfig {
        &self.config
    }

    /// Handle for `room_id`, spawning its actor on first use.
    ///
    /// An already-open room is returned as is, whatever `focus` is passed;
    /// close it first to reopen at a different focus.
    pub async fn open_room(&self, room_id: &str, focus: TimelineFocus) -> RoomTimelineHandle {
        let mut rooms = self.rooms.lock().await;
        if let Some(handle) = rooms.get(room_id)
            && !handle.is_closed()
        {
            trace!(%room_id, "room timeline already open");
            return handle.clone();
        }

        let handle = spawn_room_timeline(
            room_id,
            self.own_user_id.clone(),
            focus,
            Arc::clone(&self.transport),
            Arc::clone(&self.decryptor),
            &self.config,
        );
        rooms.insert(room_id.to_owned(), handle.clone());
        handle
    }

    pub async fn room(&self, room_id: &str) -> Option<RoomTimelineHandle> {
        self.rooms
            .lock()
            .await
            .get(room_id)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    pub async fn open_rooms(&self) -> Vec<String> {
        let rooms = self.rooms.lock().await;
        let mut ids: Vec<String> = rooms
            .iter()
            .filter(|(_, handle)| !handle.is_closed())
            .map(|(room_id, _)| room_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Shut a room's actor down; returns whether the room was open.
    pub async fn close_room(&self, room_id: &str) -> bool {
        let Some(handle) = self.rooms.lock().await.remove(room_id) else {
            return false;
        };
        handle.shutdown();
        debug!(%room_id, "room timeline closed");
        true
    }

    /// Route one sync batch to the open rooms; returns how many rooms took events.
    pub async fn ingest_sync(&self, batch: SyncBatch) -> usize {
        let targets: Vec<_> = {
            let rooms = self.rooms.lock().await;
            batch
                .rooms
                .into_iter()
                .filter_map(|(room_id, events)| match rooms.get(&room_id) {
                    Some(handle) => Some((handle.clone(), events)),
                    None => {
                        trace!(%room_id, count = events.len(), "sync events for unopened room dropped");
                        None
                    }
                })
                .collect()
        };

        let mut deliveries = JoinSet::new();
        for (handle, events) in targets {
            deliveries.spawn(async move {
                let result = handle.ingest_sync(events).await;
                (handle, result)
            });
        }

        let mut delivered = 0;
        let mut stale = Vec::new();
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((_, Ok(()))) => delivered += 1,
                Ok((handle, Err(err))) => {
                    warn!(room_id = %handle.room_id(), %err, "sync delivery to closed room");
                    stale.push(handle.room_id().to_owned());
                }
                Err(err) => warn!(%err, "sync delivery task failed"),
            }
        }

        if !stale.is_empty() {
            let mut rooms = self.rooms.lock().await;
            for room_id in stale {
                if rooms.get(&room_id).is_some_and(RoomTimelineHandle::is_closed) {
                    rooms.remove(&room_id);
                }
            }
        }
        delivered
    }

    /// Shut every room down.
    pub async fn shutdown(&self) {
        let rooms = std::mem::take(&mut *self.rooms.lock().await);
        info!(rooms = rooms.len(), "timeline client shutting down");
        for handle in rooms.into_values() {
            handle.shutdown();
        }
    }
}
