use std::{
    collections::{BTreeSet, HashMap},
    ops::Bound,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    decryption::{Decrypted, Decryptor, decrypt_envelope, decrypt_incoming},
    error::RedactionError,
    types::{EncryptedEvent, EventContent, IncomingEvent, TimelineEvent},
};

/// Result of inserting an event into the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The event was not known before.
    Appended,
    /// The event was known as an undecryptable placeholder and now has content.
    Updated,
    /// The event was already stored; nothing changed.
    Duplicate,
}

/// Total order of confirmed events: server timestamp, then event ID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    pub origin_server_ts: u64,
    pub event_id: String,
}

impl OrderKey {
    pub fn of(event: &TimelineEvent) -> Self {
        Self {
            origin_server_ts: event.origin_server_ts,
            event_id: event.event_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredEvent {
    event: TimelineEvent,
    /// Envelope retained while the event could not be decrypted.
    envelope: Option<EncryptedEvent>,
}

/// Ordered store of confirmed events for one room.
///
/// Events are never removed; redaction replaces content with a tombstone in place.
#[derive(Debug, Clone, Default)]
pub struct EventStore {
    events: HashMap<String, StoredEvent>,
    order: BTreeSet<OrderKey>,
    /// Redactions whose target has not arrived yet, keyed by target event ID.
    parked_redactions: HashMap<String, Option<String>>,
    /// Transaction ID -> confirmed event ID.
    transactions: HashMap<String, String>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.events.contains_key(event_id)
    }

    pub fn get(&self, event_id: &str) -> Option<&TimelineEvent> {
        self.events.get(event_id).map(|stored| &stored.event)
    }

    /// All events in timeline order (oldest first).
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &TimelineEvent> + '_ {
        self.order
            .iter()
            .filter_map(move |key| self.events.get(&key.event_id).map(|stored| &stored.event))
    }

    /// Up to `limit` events strictly older than `before`, newest first.
    ///
    /// Without `before` the range starts at the live edge. An unknown cursor yields nothing.
    /// The iterator is lazy and can be recreated from any cursor it produced.
    pub fn range<'a>(
        &'a self,
        before: Option<&str>,
        limit: usize,
    ) -> impl Iterator<Item = &'a TimelineEvent> + 'a {
        let (upper, limit) = match before {
            None => (Bound::Unbounded, limit),
            Some(event_id) => match self.events.get(event_id) {
                Some(stored) => (Bound::Excluded(OrderKey::of(&stored.event)), limit),
                None => (Bound::Unbounded, 0),
            },
        };

        self.order
            .range((Bound::Unbounded, upper))
            .rev()
            .take(limit)
            .filter_map(move |key| self.events.get(&key.event_id).map(|stored| &stored.event))
    }

    /// Insert a confirmed event. Idempotent on `event_id`.
    pub fn insert(&mut self, event: TimelineEvent) -> InsertOutcome {
        if let Some(transaction_id) = &event.transaction_id {
            self.transactions
                .insert(transaction_id.clone(), event.event_id.clone());
        }

        if let Some(stored) = self.events.get_mut(&event.event_id) {
            let was_undecryptable = matches!(
                stored.event.content,
                EventContent::UnableToDecrypt { .. }
            );
            let now_decryptable = !matches!(event.content, EventContent::UnableToDecrypt { .. });
            if was_undecryptable && now_decryptable {
                stored.event.content = event.content;
                stored.envelope = None;
                if stored.event.transaction_id.is_none() {
                    stored.event.transaction_id = event.transaction_id;
                }
                trace!(event_id = %stored.event.event_id, "placeholder replaced by decrypted event");
                return InsertOutcome::Updated;
            }
            return InsertOutcome::Duplicate;
        }

        let mut event = event;
        if let Some(reason) = self.parked_redactions.remove(&event.event_id) {
            debug!(event_id = %event.event_id, "applying parked redaction on arrival");
            event.content = event.content.redacted(reason);
        }

        self.order.insert(OrderKey::of(&event));
        self.events.insert(
            event.event_id.clone(),
            StoredEvent {
                event,
                envelope: None,
            },
        );
        InsertOutcome::Appended
    }

    /// Apply a redaction event to its target.
    ///
    /// When the target is unknown the redaction is parked and applied on insertion,
    /// so the end state does not depend on arrival order.
    pub fn apply_redaction(&mut self, redaction: &TimelineEvent) -> Result<(), RedactionError> {
        let EventContent::Redaction { redacts, reason } = &redaction.content else {
            return Err(RedactionError::NotARedaction(redaction.event_id.clone()));
        };

        match self.events.get_mut(redacts) {
            Some(stored) => {
                if !stored.event.content.is_redacted() {
                    stored.event.content = stored.event.content.redacted(reason.clone());
                }
                stored.envelope = None;
                Ok(())
            }
            None => {
                self.parked_redactions
                    .entry(redacts.clone())
                    .or_insert_with(|| reason.clone());
                Err(RedactionError::NotFound(redacts.clone()))
            }
        }
    }

    /// Insert an event and, when it is a redaction, apply it.
    pub fn ingest(&mut self, event: TimelineEvent) -> InsertOutcome {
        let redaction = matches!(event.content, EventContent::Redaction { .. }).then(|| event.clone());
        let outcome = self.insert(event);

        if let Some(redaction) = redaction
            && outcome != InsertOutcome::Duplicate
            && let Err(err) = self.apply_redaction(&redaction)
        {
            debug!(event_id = %redaction.event_id, error = %err, "redaction parked until target arrives");
        }
        outcome
    }

    /// Decrypt (when needed) and ingest an event received from a transport.
    pub fn ingest_incoming(
        &mut self,
        incoming: IncomingEvent,
        decryptor: &dyn Decryptor,
    ) -> InsertOutcome {
        match decrypt_incoming(incoming, decryptor) {
            Decrypted::Clear(event) => self.ingest(event),
            Decrypted::Undecryptable {
                placeholder,
                envelope,
            } => {
                let event_id = placeholder.event_id.clone();
                let outcome = self.insert(placeholder);
                if outcome == InsertOutcome::Appended
                    && let Some(stored) = self.events.get_mut(&event_id)
                    && !stored.event.content.is_redacted()
                {
                    stored.envelope = Some(envelope);
                }
                outcome
            }
        }
    }

    /// Retry decryption of retained envelopes from the given sessions.
    ///
    /// Returns the IDs of events that were decrypted.
    pub fn retry_decryption(
        &mut self,
        session_ids: &[String],
        decryptor: &dyn Decryptor,
    ) -> Vec<String> {
        let candidates: Vec<EncryptedEvent> = self
            .events
            .values()
            .filter_map(|stored| stored.envelope.as_ref())
            .filter(|envelope| session_ids.contains(&envelope.session_id))
            .cloned()
            .collect();

        let mut decrypted = Vec::new();
        for envelope in candidates {
            match decrypt_envelope(&envelope, decryptor) {
                Ok(event) => {
                    if self.ingest(event) == InsertOutcome::Updated {
                        decrypted.push(envelope.event_id.clone());
                    }
                }
                Err(err) => {
                    trace!(event_id = %envelope.event_id, error = %err, "decryption retry failed");
                }
            }
        }
        decrypted.sort();
        decrypted
    }

    /// Record that `transaction_id` was confirmed as `event_id`.
    pub fn link_transaction(&mut self, transaction_id: impl Into<String>, event_id: impl Into<String>) {
        self.transactions
            .insert(transaction_id.into(), event_id.into());
    }

    /// Confirmed event for a transaction, if that event is already stored.
    pub fn event_for_transaction(&self, transaction_id: &str) -> Option<&TimelineEvent> {
        self.transactions
            .get(transaction_id)
            .and_then(|event_id| self.get(event_id))
    }

    /// Transaction that produced `event_id`, if it was sent from this client.
    pub fn transaction_for_event(&self, event_id: &str) -> Option<&str> {
        let stored = self.events.get(event_id)?;
        if let Some(transaction_id) = stored.event.transaction_id.as_deref() {
            return Some(transaction_id);
        }
        self.transactions
            .iter()
            .find(|(_, linked)| linked.as_str() == event_id)
            .map(|(transaction_id, _)| transaction_id.as_str())
    }

    /// The non-redacted reaction `sender` put on `target` with `key`.
    pub fn find_reaction(&self, target: &str, key: &str, sender: &str) -> Option<&TimelineEvent> {
        self.iter().find(|event| {
            event.sender == sender
                && matches!(
                    &event.content,
                    EventContent::Reaction { target: t, key: k } if t == target && k == key
                )
        })
    }

    /// Whether an undecryptable placeholder still holds its envelope.
    pub fn awaiting_keys(&self, event_id: &str) -> bool {
        self.events
            .get(event_id)
            .is_some_and(|stored| stored.envelope.is_some())
    }
}
