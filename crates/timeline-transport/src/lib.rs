use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use thiserror::Error;
use timeline_core::{
    DecryptionError, Decryptor, Direction, EncryptedEvent, ErrorCategory, EventContent, EventPage,
    IncomingEvent, SyncBatch, TimelineEvent, TransportError,
};
use tokio::sync::watch;
use tracing::debug;

/// Fetches pages of historical events for a room.
pub trait PaginationTransport: Send + Sync + 'static {
    fn fetch_events(
        &self,
        room_id: &str,
        cursor: Option<&str>,
        direction: Direction,
        limit: u16,
    ) -> impl Future<Output = Result<EventPage, TransportError>> + Send;
}

/// Sends one event to a room and resolves to the server-assigned event ID.
pub trait SendTransport: Send + Sync + 'static {
    fn send_event(
        &self,
        room_id: &str,
        transaction_id: &str,
        content: &EventContent,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;
}

/// Everything a room timeline needs from the network.
pub trait RoomTransport: PaginationTransport + SendTransport {}

impl<T: PaginationTransport + SendTransport> RoomTransport for T {}

/// Transport bound to a single room.
pub struct ScopedTransport<T> {
    inner: Arc<T>,
    room_id: String,
}

impl<T> Clone for ScopedTransport<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            room_id: self.room_id.clone(),
        }
    }
}

impl<T: RoomTransport> ScopedTransport<T> {
    pub fn new(inner: Arc<T>, room_id: impl Into<String>) -> Self {
        Self {
            inner,
            room_id: room_id.into(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub async fn fetch(
        &self,
        cursor: Option<&str>,
        direction: Direction,
        limit: u16,
    ) -> Result<EventPage, TransportError> {
        self.inner
            .fetch_events(&self.room_id, cursor, direction, limit)
            .await
    }

    pub async fn send(
        &self,
        transaction_id: &str,
        content: &EventContent,
    ) -> Result<String, TransportError> {
        self.inner
            .send_event(&self.room_id, transaction_id, content)
            .await
    }
}

#[derive(Debug, Default)]
struct ServerState {
    rooms: HashMap<String, Vec<IncomingEvent>>,
    pending_sync: SyncBatch,
    fetch_failures: VecDeque<TransportError>,
    send_failures: VecDeque<TransportError>,
    fetch_calls: usize,
    send_calls: usize,
    next_event: u64,
}

#[derive(Debug)]
struct ServerInner {
    own_user_id: String,
    state: Mutex<ServerState>,
    fetch_paused: watch::Sender<bool>,
    send_paused: watch::Sender<bool>,
}

/// Scriptable in-memory homeserver used by tests and the smoke binary.
///
/// Each room has an append-only history. Cursors are positions in that
/// history: backward pages end before the cursor (newest first), forward
/// pages start at it.
#[derive(Debug, Clone)]
pub struct InMemoryRoomServer {
    inner: Arc<ServerInner>,
}

impl InMemoryRoomServer {
    pub fn new(own_user_id: impl Into<String>) -> Self {
        let (fetch_paused, _) = watch::channel(false);
        let (send_paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServerInner {
                own_user_id: own_user_id.into(),
                state: Mutex::new(ServerState::default()),
                fetch_paused,
                send_paused,
            }),
        }
    }

    /// Append events to a room's history without delivering them through sync.
    pub fn seed<I, E>(&self, room_id: &str, events: I)
    where
        I: IntoIterator<Item = E>,
        E: Into<IncomingEvent>,
    {
        let mut state = self.lock();
        let history = state.rooms.entry(room_id.to_owned()).or_default();
        history.extend(events.into_iter().map(Into::into));
    }

    /// Append an event from another user and queue it for the next sync.
    pub fn deliver_remote(&self, room_id: &str, event: impl Into<IncomingEvent>) {
        let event = event.into();
        let mut state = self.lock();
        state
            .rooms
            .entry(room_id.to_owned())
            .or_default()
            .push(event.clone());
        state.pending_sync.push(room_id, event);
    }

    /// Drain everything queued for sync since the last call.
    pub fn take_pending_sync(&self) -> SyncBatch {
        std::mem::take(&mut self.lock().pending_sync)
    }

    pub fn history(&self, room_id: &str) -> Vec<IncomingEvent> {
        self.lock().rooms.get(room_id).cloned().unwrap_or_default()
    }

    /// Cursor positioned at `event_id`: forward pages include it, backward pages end before it.
    pub fn cursor_at(&self, room_id: &str, event_id: &str) -> Option<String> {
        self.lock()
            .rooms
            .get(room_id)?
            .iter()
            .position(|event| event.event_id() == event_id)
            .map(|index| index.to_string())
    }

    pub fn fetch_calls(&self) -> usize {
        self.lock().fetch_calls
    }

    pub fn send_calls(&self) -> usize {
        self.lock().send_calls
    }

    /// Fail the next fetch with `error`; failures queue up in order.
    pub fn fail_next_fetch(&self, error: TransportError) {
        self.lock().fetch_failures.push_back(error);
    }

    /// Fail the next send attempt with `error`; failures queue up in order.
    pub fn fail_next_send(&self, error: TransportError) {
        self.lock().send_failures.push_back(error);
    }

    /// Hold every fetch until [`resume_fetches`](Self::resume_fetches).
    pub fn pause_fetches(&self) {
        self.inner.fetch_paused.send_replace(true);
    }

    pub fn resume_fetches(&self) {
        self.inner.fetch_paused.send_replace(false);
    }

    /// Hold every send until [`resume_sends`](Self::resume_sends).
    pub fn pause_sends(&self) {
        self.inner.send_paused.send_replace(true);
    }

    pub fn resume_sends(&self) {
        self.inner.send_paused.send_replace(false);
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl PaginationTransport for InMemoryRoomServer {
    async fn fetch_events(
        &self,
        room_id: &str,
        cursor: Option<&str>,
        direction: Direction,
        limit: u16,
    ) -> Result<EventPage, TransportError> {
        self.lock().fetch_calls += 1;
        wait_until_resumed(&self.inner.fetch_paused).await;

        let mut state = self.lock();
        if let Some(error) = state.fetch_failures.pop_front() {
            debug!(%room_id, ?direction, %error, "scripted fetch failure");
            return Err(error);
        }
        let history = state
            .rooms
            .get(room_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        page_of(history, cursor, direction, usize::from(limit))
    }
}

impl SendTransport for InMemoryRoomServer {
    async fn send_event(
        &self,
        room_id: &str,
        transaction_id: &str,
        content: &EventContent,
    ) -> Result<String, TransportError> {
        self.lock().send_calls += 1;
        wait_until_resumed(&self.inner.send_paused).await;

        let mut state = self.lock();
        if let Some(error) = state.send_failures.pop_front() {
            debug!(%room_id, %transaction_id, %error, "scripted send failure");
            return Err(error);
        }

        state.next_event += 1;
        let event_id = format!("$srv{}", state.next_event);
        let history = state.rooms.entry(room_id.to_owned()).or_default();
        let origin_server_ts = history
            .iter()
            .map(origin_server_ts)
            .max()
            .map_or(1, |latest| latest + 1);
        let event = TimelineEvent::new(
            event_id.clone(),
            self.inner.own_user_id.clone(),
            origin_server_ts,
            content.clone(),
        )
        .with_transaction_id(transaction_id);
        history.push(event.clone().into());
        state.pending_sync.push(room_id, event);
        debug!(%room_id, %transaction_id, %event_id, "event accepted");
        Ok(event_id)
    }
}

async fn wait_until_resumed(paused: &watch::Sender<bool>) {
    let mut rx = paused.subscribe();
    // The sender lives as long as the server, so this only ends by resuming.
    let _ = rx.wait_for(|paused| !*paused).await;
}

fn origin_server_ts(event: &IncomingEvent) -> u64 {
    match event {
        IncomingEvent::Plain(event) => event.origin_server_ts,
        IncomingEvent::Encrypted(event) => event.origin_server_ts,
    }
}

fn page_of(
    history: &[IncomingEvent],
    cursor: Option<&str>,
    direction: Direction,
    limit: usize,
) -> Result<EventPage, TransportError> {
    let len = history.len();
    let position = match cursor {
        None => len,
        Some(token) => token
            .parse::<usize>()
            .ok()
            .filter(|position| *position <= len)
            .ok_or_else(|| {
                TransportError::new(
                    ErrorCategory::Config,
                    "invalid_cursor",
                    format!("unknown pagination cursor '{token}'"),
                )
            })?,
    };

    let page = match direction {
        Direction::Backward => {
            let start = position.saturating_sub(limit);
            EventPage {
                events: history[start..position].iter().rev().cloned().collect(),
                next_cursor: (start > 0).then(|| start.to_string()),
            }
        }
        Direction::Forward => {
            let end = position.saturating_add(limit).min(len);
            EventPage {
                events: history[position..end].to_vec(),
                next_cursor: (end < len).then(|| end.to_string()),
            }
        }
    };
    Ok(page)
}

/// Errors produced while sealing events for the in-memory decryptor.
#[derive(Debug, Error)]
pub enum SealError {
    #[error("failed to encode event content: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Decryptor that knows a configurable set of session keys.
///
/// Ciphertext is the JSON encoding of the event content.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDecryptor {
    sessions: Arc<RwLock<HashSet<String>>>,
}

impl InMemoryDecryptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the keys for `session_id` available.
    pub fn add_session(&self, session_id: impl Into<String>) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.into());
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(session_id)
    }

    /// Encrypt `event` under `session_id`.
    pub fn seal(
        event: &TimelineEvent,
        session_id: impl Into<String>,
    ) -> Result<EncryptedEvent, SealError> {
        Ok(EncryptedEvent {
            event_id: event.event_id.clone(),
            sender: event.sender.clone(),
            origin_server_ts: event.origin_server_ts,
            session_id: session_id.into(),
            ciphertext: serde_json::to_string(&event.content)?,
            transaction_id: event.transaction_id.clone(),
        })
    }
}

impl Decryptor for InMemoryDecryptor {
    fn decrypt(&self, event: &EncryptedEvent) -> Result<TimelineEvent, DecryptionError> {
        if !self.has_session(&event.session_id) {
            return Err(DecryptionError::MissingSession(event.session_id.clone()));
        }
        let content: EventContent = serde_json::from_str(&event.ciphertext)
            .map_err(|err| DecryptionError::Malformed(err.to_string()))?;
        Ok(TimelineEvent {
            event_id: event.event_id.clone(),
            sender: event.sender.clone(),
            origin_server_ts: event.origin_server_ts,
            content,
            transaction_id: event.transaction_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use timeline_core::MessageContent;

    use super::*;

    const ROOM: &str = "!room:example.org";

    fn message(event_id: &str, ts: u64) -> TimelineEvent {
        TimelineEvent::new(
            event_id,
            "@alice:example.org",
            ts,
            EventContent::Message(MessageContent::text(event_id)),
        )
    }

    fn ids(page: &EventPage) -> Vec<&str> {
        page.events.iter().map(IncomingEvent::event_id).collect()
    }

    fn seeded() -> InMemoryRoomServer {
        let server = InMemoryRoomServer::new("@me:example.org");
        server.seed(ROOM, (1..=5).map(|n| message(&format!("${n}"), n)));
        server
    }

    #[tokio::test]
    async fn backward_pages_walk_history_newest_first() {
        let server = seeded();

        let first = server
            .fetch_events(ROOM, None, Direction::Backward, 2)
            .await
            .expect("first page");
        assert_eq!(ids(&first), vec!["$5", "$4"]);

        let second = server
            .fetch_events(ROOM, first.next_cursor.as_deref(), Direction::Backward, 10)
            .await
            .expect("second page");
        assert_eq!(ids(&second), vec!["$3", "$2", "$1"]);
        assert_eq!(second.next_cursor, None);
        assert_eq!(server.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn forward_pages_start_at_cursor() {
        let server = seeded();
        let cursor = server.cursor_at(ROOM, "$3").expect("event is in history");

        let forward = server
            .fetch_events(ROOM, Some(&cursor), Direction::Forward, 2)
            .await
            .expect("forward page");
        assert_eq!(ids(&forward), vec!["$3", "$4"]);
        assert_eq!(forward.next_cursor.as_deref(), Some("4"));

        let backward = server
            .fetch_events(ROOM, Some(&cursor), Direction::Backward, 5)
            .await
            .expect("backward page");
        assert_eq!(ids(&backward), vec!["$2", "$1"]);
    }

    #[tokio::test]
    async fn rejects_unknown_cursor() {
        let server = seeded();
        let err = server
            .fetch_events(ROOM, Some("nope"), Direction::Backward, 5)
            .await
            .expect_err("cursor is invalid");
        assert_eq!(err.code, "invalid_cursor");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let server = seeded();
        server.fail_next_send(TransportError::from_http_status(503, "unavailable"));

        let err = server
            .send_event(ROOM, "tx1", &EventContent::Message(MessageContent::text("hi")))
            .await
            .expect_err("first send fails");
        assert_eq!(err.code, "http_503");

        let event_id = server
            .send_event(ROOM, "tx1", &EventContent::Message(MessageContent::text("hi")))
            .await
            .expect("second send succeeds");
        assert_eq!(server.send_calls(), 2);

        let sync = server.take_pending_sync();
        let IncomingEvent::Plain(event) = &sync.rooms[ROOM][0] else {
            panic!("sent events are plaintext");
        };
        assert_eq!(event.event_id, event_id);
        assert_eq!(event.transaction_id.as_deref(), Some("tx1"));
        assert_eq!(event.origin_server_ts, 6);
        assert!(server.take_pending_sync().rooms.is_empty());
    }

    #[tokio::test]
    async fn paused_sends_wait_for_resume() {
        let server = InMemoryRoomServer::new("@me:example.org");
        server.pause_sends();

        let task = tokio::spawn({
            let server = server.clone();
            async move {
                server
                    .send_event(ROOM, "tx1", &EventContent::Message(MessageContent::text("hi")))
                    .await
            }
        });
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        server.resume_sends();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("send resumes")
            .expect("task joins");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn scoped_transport_targets_its_room() {
        let server = Arc::new(seeded());
        let scoped = ScopedTransport::new(server.clone(), ROOM);
        let other = ScopedTransport::new(server, "!other:example.org");

        let page = scoped
            .fetch(None, Direction::Backward, 1)
            .await
            .expect("fetch in seeded room");
        assert_eq!(ids(&page), vec!["$5"]);

        let empty = other
            .fetch(None, Direction::Backward, 1)
            .await
            .expect("fetch in empty room");
        assert!(empty.events.is_empty());
        assert_eq!(empty.next_cursor, None);
    }

    #[test]
    fn decrypts_only_known_sessions() {
        let decryptor = InMemoryDecryptor::new();
        let sealed = InMemoryDecryptor::seal(&message("$1", 1), "s1").expect("seal");

        assert_eq!(
            decryptor.decrypt(&sealed),
            Err(DecryptionError::MissingSession("s1".into()))
        );

        decryptor.add_session("s1");
        let opened = decryptor.decrypt(&sealed).expect("keys are known");
        assert_eq!(opened, message("$1", 1));
    }

    #[test]
    fn malformed_ciphertext_is_reported() {
        let decryptor = InMemoryDecryptor::new();
        decryptor.add_session("s1");
        let mut sealed = InMemoryDecryptor::seal(&message("$1", 1), "s1").expect("seal");
        sealed.ciphertext = "not json".into();
        assert!(matches!(
            decryptor.decrypt(&sealed),
            Err(DecryptionError::Malformed(_))
        ));
    }

    struct OfflineTransport;

    impl PaginationTransport for OfflineTransport {
        async fn fetch_events(
            &self,
            _room_id: &str,
            _cursor: Option<&str>,
            _direction: Direction,
            _limit: u16,
        ) -> Result<EventPage, TransportError> {
            Err(TransportError::network("offline"))
        }
    }

    impl SendTransport for OfflineTransport {
        async fn send_event(
            &self,
            _room_id: &str,
            _transaction_id: &str,
            _content: &EventContent,
        ) -> Result<String, TransportError> {
            Err(TransportError::network("offline"))
        }
    }

    #[tokio::test]
    async fn failure_propagates_through_scoped_transport() {
        let scoped = ScopedTransport::new(Arc::new(OfflineTransport), ROOM);
        let err = scoped
            .send("tx1", &EventContent::Message(MessageContent::text("hi")))
            .await
            .expect_err("send must fail");
        assert_eq!(err, TransportError::network("offline"));
        assert!(err.is_retryable());
    }
}
