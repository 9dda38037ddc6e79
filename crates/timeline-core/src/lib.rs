//! Room timeline reconciliation core.
//!
//! This crate owns the timeline data model and the synchronous pieces of the
//! engine: the event store, local echo tracking, reconciliation of both into a
//! rendered item list, pagination state, and the published view with its
//! subscription channels.

/// Subscription endpoints for published timeline views.
pub mod channel;
/// Environment-backed timeline tuning.
pub mod config;
/// Decryption step that runs before events enter the store.
pub mod decryption;
/// Stable transport error payload and per-surface error enums.
pub mod error;
/// Confirmed-event storage with deterministic ordering.
pub mod event_store;
/// Optimistic local actions awaiting server confirmation.
pub mod local_echo;
/// Per-direction pagination state machine.
pub mod pagination;
/// Merge of confirmed events and local echoes into rendered items.
pub mod reconciler;
/// Backoff policy used by send retry loops.
pub mod retry;
/// Events, items and other data model types.
pub mod types;
/// Published snapshots and diffing.
pub mod view;

pub use channel::{TimelineSubscription, ViewChannels};
pub use config::{ConfigError, TimelineConfig};
pub use decryption::{Decrypted, Decryptor, decrypt_incoming};
pub use error::{
    DecryptionError, EchoError, ErrorCategory, PaginationError, RedactionError, SendError,
    TransportError, classify_http_status,
};
pub use event_store::{EventStore, InsertOutcome, OrderKey};
pub use local_echo::{LocalEcho, LocalEchoTracker};
pub use pagination::{PaginationController, PaginationStart, bounded_paginate_limit};
pub use reconciler::{Reconciler, Reconciliation};
pub use retry::RetryPolicy;
pub use types::{
    Direction, EncryptedEvent, EventContent, EventKind, EventPage, IncomingEvent, ItemContent,
    MessageContent, MessageType, PaginationState, PaginationStatus, PendingChange, PendingKind,
    ReactionGroup, RelationKind, SendState, SyncBatch, TimelineEvent, TimelineFocus, TimelineItem,
    TimelineItemId,
};
pub use view::{
    DiffError, TimelineDiff, TimelineSnapshot, TimelineUpdate, TimelineView, apply_diff,
    compute_diff,
};
