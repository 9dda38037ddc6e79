use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Message type carried by room messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum MessageType {
    /// Standard text message (`m.text`).
    #[default]
    Text,
    /// Notice message (`m.notice`), usually non-intrusive/system-like.
    Notice,
    /// Emote message (`m.emote`).
    Emote,
}

/// Body of a room message plus its reply/thread references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageContent {
    /// Display text.
    pub body: String,
    /// Message kind (`m.text`/`m.notice`/`m.emote`).
    pub msgtype: MessageType,
    /// Event this message replies to.
    pub in_reply_to: Option<String>,
    /// Root event of the thread this message belongs to.
    pub thread_root: Option<String>,
}

impl MessageContent {
    /// Plain `m.text` message without reply or thread metadata.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            msgtype: MessageType::Text,
            in_reply_to: None,
            thread_root: None,
        }
    }

    /// Mark this message as a reply to `event_id`.
    pub fn in_reply_to(mut self, event_id: impl Into<String>) -> Self {
        self.in_reply_to = Some(event_id.into());
        self
    }

    /// Attach this message to the thread rooted at `event_id`.
    pub fn in_thread(mut self, event_id: impl Into<String>) -> Self {
        self.thread_root = Some(event_id.into());
        self
    }
}

/// Coarse event kind, retained on redaction tombstones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Edit,
    Reaction,
    Redaction,
    StateChange,
    Poll,
    CallNotify,
    PinnedEvents,
    Encrypted,
}

impl EventKind {
    /// Kinds whose only effect is on another event; they never render on their own.
    pub fn is_annotation(self) -> bool {
        matches!(
            self,
            Self::Edit | Self::Reaction | Self::Redaction | Self::PinnedEvents
        )
    }
}

/// Content of a confirmed timeline event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventContent {
    /// Room message.
    Message(MessageContent),
    /// Replacement body for an earlier message.
    Edit { target: String, new_body: String },
    /// Annotation (emoji or free-form key) on an earlier event.
    Reaction { target: String, key: String },
    /// Request to erase the content of an earlier event.
    Redaction {
        redacts: String,
        reason: Option<String>,
    },
    /// Generic room state change (membership, topic, name, ...).
    StateChange {
        kind: String,
        state_key: String,
        summary: String,
    },
    /// Poll start.
    Poll {
        question: String,
        answers: Vec<String>,
    },
    /// Call notification.
    CallNotify { call_id: String },
    /// Full list of pinned events (`m.room.pinned_events`).
    PinnedEvents { pinned: Vec<String> },
    /// Placeholder for an encrypted event whose keys are not available yet.
    UnableToDecrypt { session_id: String },
    /// Tombstone left behind by a redaction.
    Redacted {
        reason: Option<String>,
        original: EventKind,
    },
}

impl EventContent {
    /// Event kind of this content; tombstones report the kind they replaced.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Message(_) => EventKind::Message,
            Self::Edit { .. } => EventKind::Edit,
            Self::Reaction { .. } => EventKind::Reaction,
            Self::Redaction { .. } => EventKind::Redaction,
            Self::StateChange { .. } => EventKind::StateChange,
            Self::Poll { .. } => EventKind::Poll,
            Self::CallNotify { .. } => EventKind::CallNotify,
            Self::PinnedEvents { .. } => EventKind::PinnedEvents,
            Self::UnableToDecrypt { .. } => EventKind::Encrypted,
            Self::Redacted { original, .. } => *original,
        }
    }

    /// Event this content relates to, if any.
    pub fn relation_target(&self) -> Option<&str> {
        match self {
            Self::Edit { target, .. } | Self::Reaction { target, .. } => Some(target),
            Self::Redaction { redacts, .. } => Some(redacts),
            _ => None,
        }
    }

    /// Tombstone replacing this content after redaction.
    pub fn redacted(&self, reason: Option<String>) -> Self {
        Self::Redacted {
            reason,
            original: self.kind(),
        }
    }

    pub fn is_redacted(&self) -> bool {
        matches!(self, Self::Redacted { .. })
    }
}

/// Immutable, server-confirmed timeline event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineEvent {
    /// Globally unique (within the room) event ID.
    pub event_id: String,
    /// Sender user ID.
    pub sender: String,
    /// Origin server timestamp in milliseconds since Unix epoch.
    pub origin_server_ts: u64,
    /// Event payload.
    pub content: EventContent,
    /// Client transaction ID, present on the sender's own events when sync echoes it back.
    pub transaction_id: Option<String>,
}

impl TimelineEvent {
    pub fn new(
        event_id: impl Into<String>,
        sender: impl Into<String>,
        origin_server_ts: u64,
        content: EventContent,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            sender: sender.into(),
            origin_server_ts,
            content,
            transaction_id: None,
        }
    }

    /// Attach the originating client transaction ID.
    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }
}

/// Encrypted envelope as delivered by sync or pagination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedEvent {
    pub event_id: String,
    pub sender: String,
    pub origin_server_ts: u64,
    /// Megolm session the payload was encrypted with.
    pub session_id: String,
    /// Opaque ciphertext.
    pub ciphertext: String,
    pub transaction_id: Option<String>,
}

/// Event as received from a transport, before the decryption step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum IncomingEvent {
    Plain(TimelineEvent),
    Encrypted(EncryptedEvent),
}

impl IncomingEvent {
    pub fn event_id(&self) -> &str {
        match self {
            Self::Plain(event) => &event.event_id,
            Self::Encrypted(event) => &event.event_id,
        }
    }
}

impl From<TimelineEvent> for IncomingEvent {
    fn from(event: TimelineEvent) -> Self {
        Self::Plain(event)
    }
}

impl From<EncryptedEvent> for IncomingEvent {
    fn from(event: EncryptedEvent) -> Self {
        Self::Encrypted(event)
    }
}

/// Events delivered by one sync response, grouped per room.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncBatch {
    pub rooms: BTreeMap<String, Vec<IncomingEvent>>,
}

impl SyncBatch {
    pub fn push(&mut self, room_id: impl Into<String>, event: impl Into<IncomingEvent>) {
        self.rooms
            .entry(room_id.into())
            .or_default()
            .push(event.into());
    }
}

/// Pagination direction relative to the live edge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Towards older events.
    Backward,
    /// Towards newer events.
    Forward,
}

/// One page returned by the pagination transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventPage {
    pub events: Vec<IncomingEvent>,
    /// Cursor for the next request in the same direction; `None` when exhausted.
    pub next_cursor: Option<String>,
}

/// Where a room timeline starts when it is opened.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimelineFocus {
    /// Follow the live edge; forward pagination is exhausted from the start.
    #[default]
    Live,
    /// Start at a pagination cursor and load history in both directions.
    Cursor(String),
}

/// Stable identity an item presents to observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimelineItemId {
    EventId(String),
    TransactionId(String),
}

impl TimelineItemId {
    pub fn event_id(&self) -> Option<&str> {
        match self {
            Self::EventId(id) => Some(id),
            Self::TransactionId(_) => None,
        }
    }
}

/// Send state of a local echo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SendState {
    /// The transport call is still in flight.
    Sending,
    /// The transport gave up; the echo waits for retry or discard.
    SendingFailed { error: TransportError },
    /// The server accepted the event but it has not been seen in the store yet.
    Sent { event_id: String },
}

impl SendState {
    /// Sending or sent: the optimistic effect should be rendered.
    pub fn is_optimistic(&self) -> bool {
        !matches!(self, Self::SendingFailed { .. })
    }
}

/// Relation kind of an event rendered without its target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelationKind {
    Edit,
    Reaction,
}

/// Rendered content of a timeline item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ItemContent {
    Message(MessageContent),
    Redacted {
        reason: Option<String>,
    },
    StateChange {
        kind: String,
        state_key: String,
        summary: String,
    },
    Poll {
        question: String,
        answers: Vec<String>,
    },
    CallNotify {
        call_id: String,
    },
    /// Encrypted event that could not be decrypted (yet).
    UnableToDecrypt {
        session_id: String,
    },
    /// Edit or reaction whose target is not loaded.
    DetachedRelation {
        kind: RelationKind,
        target: String,
        body: String,
    },
}

/// Aggregated reactions for one key on one item.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionGroup {
    pub senders: BTreeSet<String>,
    /// The local user is among the senders.
    pub own: bool,
    /// Part of the group is an unconfirmed local echo.
    pub pending: bool,
}

impl ReactionGroup {
    pub fn count(&self) -> usize {
        self.senders.len()
    }
}

/// Kind of an unconfirmed change folded onto an item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PendingKind {
    Edit,
    Reaction,
    Redaction,
    Pin,
    Unpin,
}

/// Unconfirmed local change applied to an existing item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingChange {
    pub transaction_id: String,
    pub kind: PendingKind,
    pub state: SendState,
}

/// One rendered row of the timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineItem {
    pub id: TimelineItemId,
    /// Originating transaction for the local user's own messages.
    pub transaction_id: Option<String>,
    pub sender: String,
    pub timestamp_ms: u64,
    pub content: ItemContent,
    /// Content reflects an edit (confirmed or pending).
    pub edited: bool,
    pub reactions: BTreeMap<String, ReactionGroup>,
    pub pinned: bool,
    /// Present on local echoes only.
    pub send_state: Option<SendState>,
    /// Unconfirmed edits, reactions, redactions and pins targeting this item.
    pub pending: Vec<PendingChange>,
}

impl TimelineItem {
    /// Key that links a local echo to the confirmed event replacing it.
    pub fn continuity_key(&self) -> TimelineItemId {
        match &self.transaction_id {
            Some(transaction_id) => TimelineItemId::TransactionId(transaction_id.clone()),
            None => self.id.clone(),
        }
    }

    pub fn event_id(&self) -> Option<&str> {
        self.id.event_id()
    }

    /// Text body when the item renders a message.
    pub fn body(&self) -> Option<&str> {
        match &self.content {
            ItemContent::Message(message) => Some(&message.body),
            ItemContent::DetachedRelation { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn is_local_echo(&self) -> bool {
        self.send_state.is_some()
    }
}

/// Per-direction pagination status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PaginationStatus {
    #[default]
    Idle,
    Loading,
    Exhausted,
    Failed {
        error: TransportError,
    },
}

/// Pagination status for both directions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaginationState {
    pub backward: PaginationStatus,
    pub forward: PaginationStatus,
}

impl PaginationState {
    pub fn get(&self, direction: Direction) -> &PaginationStatus {
        match direction {
            Direction::Backward => &self.backward,
            Direction::Forward => &self.forward,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_content_is_tagged_by_type() {
        let content = EventContent::Reaction {
            target: "$1".into(),
            key: "👍".into(),
        };
        let json = serde_json::to_value(&content).expect("content serializes");
        assert_eq!(
            json,
            serde_json::json!({ "type": "reaction", "target": "$1", "key": "👍" })
        );
    }

    #[test]
    fn tombstone_reports_original_kind() {
        let edit = EventContent::Edit {
            target: "$1".into(),
            new_body: "fixed".into(),
        };
        let tombstone = edit.redacted(Some("spam".into()));
        assert!(tombstone.is_redacted());
        assert_eq!(tombstone.kind(), EventKind::Edit);
        assert!(tombstone.kind().is_annotation());
        assert_eq!(tombstone.relation_target(), None);
    }

    #[test]
    fn continuity_key_prefers_transaction_id() {
        let item = TimelineItem {
            id: TimelineItemId::EventId("$srv".into()),
            transaction_id: Some("tx1".into()),
            sender: "@me:example.org".into(),
            timestamp_ms: 0,
            content: ItemContent::Message(MessageContent::text("hi")),
            edited: false,
            reactions: BTreeMap::new(),
            pinned: false,
            send_state: None,
            pending: Vec::new(),
        };
        assert_eq!(item.continuity_key(), TimelineItemId::TransactionId("tx1".into()));
        assert_eq!(item.event_id(), Some("$srv"));
        assert_eq!(item.body(), Some("hi"));
        assert!(!item.is_local_echo());
    }
}
