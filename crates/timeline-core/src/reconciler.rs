//! Merges confirmed events and local echoes into one ordered item list.
//!
//! Reconciliation is a pure function of the event store and the echo tracker:
//! it never fails, and the same inputs always produce the same output.

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::{
    event_store::{EventStore, OrderKey},
    local_echo::{LocalEcho, LocalEchoTracker},
    types::{
        EventContent, ItemContent, PendingChange, PendingKind, RelationKind, SendState,
        TimelineEvent, TimelineItem, TimelineItemId,
    },
};

/// Output of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Items in display order (oldest first, local echoes at the live edge).
    pub items: Vec<TimelineItem>,
    /// Effective pinned event IDs, pending pin changes applied.
    pub pinned: Vec<String>,
}

/// Builds the rendered timeline for one room.
#[derive(Debug, Clone)]
pub struct Reconciler {
    own_user_id: String,
}

#[derive(Debug, Clone)]
struct ReactionRef {
    target: String,
    key: String,
    sender: String,
}

impl Reconciler {
    pub fn new(own_user_id: impl Into<String>) -> Self {
        Self {
            own_user_id: own_user_id.into(),
        }
    }

    pub fn own_user_id(&self) -> &str {
        &self.own_user_id
    }

    pub fn reconcile(&self, store: &EventStore, echoes: &LocalEchoTracker) -> Reconciliation {
        let mut items: Vec<TimelineItem> = Vec::new();
        let mut index_of: HashMap<String, usize> = HashMap::new();
        let mut edits: HashMap<&str, &TimelineEvent> = HashMap::new();
        let mut reactions: Vec<&TimelineEvent> = Vec::new();
        let mut pinned_event: Option<&TimelineEvent> = None;

        // Confirmed events, in store order. Relations are collected and folded afterwards
        // because a relation may be ordered before its target.
        for event in store.iter() {
            match &event.content {
                EventContent::Edit { target, new_body } => {
                    if accepts_edit(store.get(target)) {
                        let latest = edits.entry(target.as_str()).or_insert(event);
                        if OrderKey::of(event) > OrderKey::of(*latest) {
                            *latest = event;
                        }
                    } else if !store.contains(target) {
                        trace!(event_id = %event.event_id, %target, "edit target missing; rendering detached");
                        self.push_item(
                            &mut items,
                            &mut index_of,
                            store,
                            event,
                            detached(RelationKind::Edit, target, new_body),
                        );
                    }
                }
                EventContent::Reaction { target, key } => {
                    if store.contains(target) {
                        reactions.push(event);
                    } else {
                        trace!(event_id = %event.event_id, %target, "reaction target missing; rendering detached");
                        self.push_item(
                            &mut items,
                            &mut index_of,
                            store,
                            event,
                            detached(RelationKind::Reaction, target, key),
                        );
                    }
                }
                EventContent::PinnedEvents { .. } => {
                    if pinned_event.is_none_or(|current| OrderKey::of(event) > OrderKey::of(current)) {
                        pinned_event = Some(event);
                    }
                }
                EventContent::Redaction { .. } => {}
                other => {
                    if let Some(content) = render(other) {
                        self.push_item(&mut items, &mut index_of, store, event, content);
                    }
                }
            }
        }

        // Latest confirmed edit wins (server timestamp, then event ID).
        for (target, edit) in edits {
            if let (Some(&index), EventContent::Edit { new_body, .. }) =
                (index_of.get(target), &edit.content)
                && let ItemContent::Message(message) = &mut items[index].content
            {
                message.body = new_body.clone();
                items[index].edited = true;
            }
        }

        let mut reaction_refs: HashMap<&str, ReactionRef> = HashMap::new();
        for reaction in reactions {
            let EventContent::Reaction { target, key } = &reaction.content else {
                continue;
            };
            // Redacted targets carry no reactions, matching a pending redaction.
            if let Some(&index) = index_of.get(target)
                && !matches!(items[index].content, ItemContent::Redacted { .. })
            {
                let group = items[index].reactions.entry(key.clone()).or_default();
                group.senders.insert(reaction.sender.clone());
                group.own |= reaction.sender == self.own_user_id;
                reaction_refs.insert(
                    &reaction.event_id,
                    ReactionRef {
                        target: target.clone(),
                        key: key.clone(),
                        sender: reaction.sender.clone(),
                    },
                );
            }
        }

        let mut pinned: Vec<String> = match pinned_event.map(|event| &event.content) {
            Some(EventContent::PinnedEvents { pinned }) => pinned.clone(),
            _ => Vec::new(),
        };

        // Local echoes, in submission order.
        let mut live_edge: Vec<TimelineItem> = Vec::new();
        for echo in echoes.iter() {
            if self.is_confirmed(store, echo) {
                continue;
            }

            match &echo.target_event_id {
                Some(target) => self.fold_echo(
                    echo,
                    target,
                    &mut items,
                    &index_of,
                    &reaction_refs,
                    &mut pinned,
                    &mut live_edge,
                ),
                None => {
                    if let Some(content) = render(&echo.content) {
                        live_edge.push(self.echo_item(echo, content));
                    }
                }
            }
        }

        for item in &mut items {
            item.pinned = item
                .event_id()
                .is_some_and(|event_id| pinned.iter().any(|pinned| pinned == event_id));
        }

        items.extend(live_edge);
        Reconciliation { items, pinned }
    }

    /// The echo's event is already visible as a confirmed event.
    fn is_confirmed(&self, store: &EventStore, echo: &LocalEcho) -> bool {
        if store.event_for_transaction(&echo.transaction_id).is_some() {
            return true;
        }
        matches!(&echo.state, SendState::Sent { event_id } if store.contains(event_id))
    }

    #[allow(clippy::too_many_arguments)]
    fn fold_echo(
        &self,
        echo: &LocalEcho,
        target: &str,
        items: &mut [TimelineItem],
        index_of: &HashMap<String, usize>,
        reaction_refs: &HashMap<&str, ReactionRef>,
        pinned: &mut Vec<String>,
        live_edge: &mut Vec<TimelineItem>,
    ) {
        let optimistic = echo.state.is_optimistic();

        // Redacting one of our reactions removes it from its group.
        if let (EventContent::Redaction { .. }, Some(reaction)) =
            (&echo.content, reaction_refs.get(target))
        {
            if let Some(&index) = index_of.get(&reaction.target) {
                let item = &mut items[index];
                if optimistic
                    && let Some(group) = item.reactions.get_mut(&reaction.key)
                {
                    group.senders.remove(&reaction.sender);
                    group.own = group.senders.contains(&self.own_user_id);
                    group.pending = true;
                    if group.senders.is_empty() {
                        item.reactions.remove(&reaction.key);
                    }
                }
                item.pending.push(pending(echo, PendingKind::Reaction));
            }
            return;
        }

        if let EventContent::PinnedEvents { pinned: requested } = &echo.content
            && optimistic
        {
            *pinned = requested.clone();
        }

        let Some(&index) = index_of.get(target) else {
            match &echo.content {
                EventContent::Edit { new_body, .. } => live_edge.push(
                    self.echo_item(echo, detached(RelationKind::Edit, target, new_body)),
                ),
                EventContent::Reaction { key, .. } => live_edge.push(
                    self.echo_item(echo, detached(RelationKind::Reaction, target, key)),
                ),
                _ => {
                    trace!(transaction_id = %echo.transaction_id, %target, "echo target not loaded");
                }
            }
            return;
        };

        let item = &mut items[index];
        match &echo.content {
            EventContent::Edit { new_body, .. } => {
                if let ItemContent::Message(message) = &mut item.content {
                    if optimistic {
                        message.body = new_body.clone();
                        item.edited = true;
                    }
                    item.pending.push(pending(echo, PendingKind::Edit));
                }
            }
            EventContent::Reaction { key, .. } => {
                if optimistic && !matches!(item.content, ItemContent::Redacted { .. }) {
                    let group = item.reactions.entry(key.clone()).or_default();
                    group.senders.insert(self.own_user_id.clone());
                    group.own = true;
                    group.pending = true;
                }
                item.pending.push(pending(echo, PendingKind::Reaction));
            }
            EventContent::Redaction { reason, .. } => {
                if optimistic {
                    item.content = ItemContent::Redacted {
                        reason: reason.clone(),
                    };
                    item.reactions = BTreeMap::new();
                    item.edited = false;
                }
                item.pending.push(pending(echo, PendingKind::Redaction));
            }
            EventContent::PinnedEvents { pinned: requested } => {
                let pins = requested.iter().any(|event_id| event_id == target);
                let kind = if pins {
                    PendingKind::Pin
                } else {
                    PendingKind::Unpin
                };
                item.pending.push(pending(echo, kind));
            }
            _ => {}
        }
    }

    fn push_item(
        &self,
        items: &mut Vec<TimelineItem>,
        index_of: &mut HashMap<String, usize>,
        store: &EventStore,
        event: &TimelineEvent,
        content: ItemContent,
    ) {
        index_of.insert(event.event_id.clone(), items.len());
        items.push(TimelineItem {
            id: TimelineItemId::EventId(event.event_id.clone()),
            transaction_id: store
                .transaction_for_event(&event.event_id)
                .map(str::to_owned),
            sender: event.sender.clone(),
            timestamp_ms: event.origin_server_ts,
            content,
            edited: false,
            reactions: BTreeMap::new(),
            pinned: false,
            send_state: None,
            pending: Vec::new(),
        });
    }

    fn echo_item(&self, echo: &LocalEcho, content: ItemContent) -> TimelineItem {
        TimelineItem {
            id: TimelineItemId::TransactionId(echo.transaction_id.clone()),
            transaction_id: Some(echo.transaction_id.clone()),
            sender: self.own_user_id.clone(),
            timestamp_ms: echo.created_at_ms,
            content,
            edited: false,
            reactions: BTreeMap::new(),
            pinned: false,
            send_state: Some(echo.state.clone()),
            pending: Vec::new(),
        }
    }
}

/// Edits only apply to messages that still have content.
fn accepts_edit(target: Option<&TimelineEvent>) -> bool {
    matches!(target.map(|event| &event.content), Some(EventContent::Message(_)))
}

fn render(content: &EventContent) -> Option<ItemContent> {
    match content {
        EventContent::Message(message) => Some(ItemContent::Message(message.clone())),
        EventContent::StateChange {
            kind,
            state_key,
            summary,
        } => Some(ItemContent::StateChange {
            kind: kind.clone(),
            state_key: state_key.clone(),
            summary: summary.clone(),
        }),
        EventContent::Poll { question, answers } => Some(ItemContent::Poll {
            question: question.clone(),
            answers: answers.clone(),
        }),
        EventContent::CallNotify { call_id } => Some(ItemContent::CallNotify {
            call_id: call_id.clone(),
        }),
        EventContent::UnableToDecrypt { session_id } => Some(ItemContent::UnableToDecrypt {
            session_id: session_id.clone(),
        }),
        EventContent::Redacted { reason, original } if !original.is_annotation() => {
            Some(ItemContent::Redacted {
                reason: reason.clone(),
            })
        }
        _ => None,
    }
}

fn detached(kind: RelationKind, target: &str, body: &str) -> ItemContent {
    ItemContent::DetachedRelation {
        kind,
        target: target.to_owned(),
        body: body.to_owned(),
    }
}

fn pending(echo: &LocalEcho, kind: PendingKind) -> PendingChange {
    PendingChange {
        transaction_id: echo.transaction_id.clone(),
        kind,
        state: echo.state.clone(),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{
        error::TransportError,
        types::{EventKind, MessageContent},
    };

    const ME: &str = "@me:example.org";
    const BOB: &str = "@bob:example.org";

    fn text(body: &str) -> EventContent {
        EventContent::Message(MessageContent::text(body))
    }

    fn message(event_id: &str, ts: u64, body: &str) -> TimelineEvent {
        TimelineEvent::new(event_id, BOB, ts, text(body))
    }

    fn edit(event_id: &str, ts: u64, target: &str, body: &str) -> TimelineEvent {
        TimelineEvent::new(
            event_id,
            BOB,
            ts,
            EventContent::Edit {
                target: target.into(),
                new_body: body.into(),
            },
        )
    }

    fn reaction(event_id: &str, sender: &str, target: &str, key: &str) -> TimelineEvent {
        TimelineEvent::new(
            event_id,
            sender,
            900,
            EventContent::Reaction {
                target: target.into(),
                key: key.into(),
            },
        )
    }

    fn redaction(event_id: &str, target: &str) -> TimelineEvent {
        TimelineEvent::new(
            event_id,
            BOB,
            950,
            EventContent::Redaction {
                redacts: target.into(),
                reason: None,
            },
        )
    }

    fn ids(items: &[TimelineItem]) -> Vec<TimelineItemId> {
        items.iter().map(|item| item.id.clone()).collect()
    }

    fn event_id(id: &str) -> TimelineItemId {
        TimelineItemId::EventId(id.into())
    }

    fn txn_id(id: &str) -> TimelineItemId {
        TimelineItemId::TransactionId(id.into())
    }

    #[test]
    fn basic_send_resolves_to_single_confirmed_item() {
        let reconciler = Reconciler::new(ME);
        let mut store = EventStore::new();
        let mut echoes = LocalEchoTracker::new();

        echoes.begin_send("tx1", text("hello")).expect("send");
        let sending = reconciler.reconcile(&store, &echoes);
        assert_eq!(ids(&sending.items), vec![txn_id("tx1")]);
        assert_eq!(sending.items[0].send_state, Some(SendState::Sending));
        assert_eq!(sending.items[0].body(), Some("hello"));

        echoes.mark_sent("tx1", "$evt1").expect("sent");
        store.insert(TimelineEvent::new("$evt1", ME, 100, text("hello")));
        store.link_transaction("tx1", "$evt1");
        echoes.prune_confirmed(&store);

        let done = reconciler.reconcile(&store, &echoes);
        assert_eq!(ids(&done.items), vec![event_id("$evt1")]);
        assert_eq!(done.items[0].body(), Some("hello"));
        assert_eq!(done.items[0].transaction_id.as_deref(), Some("tx1"));
        assert_eq!(done.items[0].send_state, None);
    }

    #[test]
    fn event_arriving_before_send_ack_hides_echo() {
        let reconciler = Reconciler::new(ME);
        let mut store = EventStore::new();
        let mut echoes = LocalEchoTracker::new();

        echoes.begin_send("tx1", text("hello")).expect("send");
        store.insert(TimelineEvent::new("$evt1", ME, 100, text("hello")).with_transaction_id("tx1"));

        let out = reconciler.reconcile(&store, &echoes);
        assert_eq!(ids(&out.items), vec![event_id("$evt1")]);

        echoes.mark_sent("tx1", "$evt1").expect("late ack");
        echoes.prune_confirmed(&store);
        assert!(echoes.is_empty());
        assert_eq!(ids(&reconciler.reconcile(&store, &echoes).items), vec![event_id("$evt1")]);
    }

    #[test]
    fn sent_echo_stays_visible_until_event_arrives() {
        let reconciler = Reconciler::new(ME);
        let store = EventStore::new();
        let mut echoes = LocalEchoTracker::new();
        echoes.begin_send("tx1", text("hello")).expect("send");
        echoes.mark_sent("tx1", "$evt1").expect("sent");

        let out = reconciler.reconcile(&store, &echoes);
        assert_eq!(ids(&out.items), vec![txn_id("tx1")]);
        assert_eq!(
            out.items[0].send_state,
            Some(SendState::Sent {
                event_id: "$evt1".into()
            })
        );
    }

    #[test]
    fn echoes_sit_after_newest_event_in_submission_order() {
        let reconciler = Reconciler::new(ME);
        let mut store = EventStore::new();
        let mut echoes = LocalEchoTracker::new();
        store.insert(message("$1", 100, "a"));
        echoes.begin_send("tx1", text("one")).expect("send");
        echoes.begin_send("tx2", text("two")).expect("send");
        echoes
            .mark_failed("tx1", TransportError::network("offline"))
            .expect("fail");
        store.insert(message("$2", 200, "b"));

        let out = reconciler.reconcile(&store, &echoes);
        assert_eq!(
            ids(&out.items),
            vec![event_id("$1"), event_id("$2"), txn_id("tx1"), txn_id("tx2")]
        );
        assert!(matches!(
            out.items[2].send_state,
            Some(SendState::SendingFailed { .. })
        ));
    }

    #[test]
    fn edit_replaces_target_content() {
        let reconciler = Reconciler::new(ME);
        let mut store = EventStore::new();
        store.insert(message("$evt1", 100, "hi"));
        store.insert(edit("$evt2", 200, "$evt1", "hi!"));

        let out = reconciler.reconcile(&store, &LocalEchoTracker::new());
        assert_eq!(ids(&out.items), vec![event_id("$evt1")]);
        assert_eq!(out.items[0].body(), Some("hi!"));
        assert!(out.items[0].edited);
    }

    #[test]
    fn latest_edit_wins_regardless_of_insert_order() {
        let reconciler = Reconciler::new(ME);
        for order in [[0, 1], [1, 0]] {
            let edits = [
                edit("$evt2", 200, "$evt1", "A"),
                edit("$evt3", 150, "$evt1", "B"),
            ];
            let mut store = EventStore::new();
            store.insert(message("$evt1", 100, "hi"));
            for index in order {
                store.insert(edits[index].clone());
            }
            let out = reconciler.reconcile(&store, &LocalEchoTracker::new());
            assert_eq!(out.items[0].body(), Some("A"));
        }
    }

    #[test]
    fn edit_before_target_is_rendered_detached_until_target_arrives() {
        let reconciler = Reconciler::new(ME);
        let mut store = EventStore::new();
        store.insert(edit("$evt2", 200, "$evt1", "hi!"));

        let early = reconciler.reconcile(&store, &LocalEchoTracker::new());
        assert_eq!(ids(&early.items), vec![event_id("$evt2")]);
        assert!(matches!(
            early.items[0].content,
            ItemContent::DetachedRelation {
                kind: RelationKind::Edit,
                ..
            }
        ));

        store.insert(message("$evt1", 100, "hi"));
        let late = reconciler.reconcile(&store, &LocalEchoTracker::new());
        assert_eq!(ids(&late.items), vec![event_id("$evt1")]);
        assert_eq!(late.items[0].body(), Some("hi!"));
    }

    #[test]
    fn redaction_before_target_renders_tombstone() {
        let reconciler = Reconciler::new(ME);
        let mut store = EventStore::new();
        store.ingest(redaction("$r", "$evt5"));
        store.ingest(message("$evt5", 300, "secret"));

        let out = reconciler.reconcile(&store, &LocalEchoTracker::new());
        assert_eq!(ids(&out.items), vec![event_id("$evt5")]);
        assert_eq!(out.items[0].content, ItemContent::Redacted { reason: None });
    }

    #[test]
    fn reactions_aggregate_per_key() {
        let reconciler = Reconciler::new(ME);
        let mut store = EventStore::new();
        store.insert(message("$1", 100, "hi"));
        store.insert(reaction("$r1", BOB, "$1", "👍"));
        store.insert(reaction("$r2", ME, "$1", "👍"));
        store.insert(reaction("$r3", BOB, "$1", "🎉"));

        let out = reconciler.reconcile(&store, &LocalEchoTracker::new());
        assert_eq!(ids(&out.items), vec![event_id("$1")]);
        let thumbs = &out.items[0].reactions["👍"];
        assert_eq!(thumbs.count(), 2);
        assert!(thumbs.own);
        assert!(!thumbs.pending);
        assert_eq!(out.items[0].reactions["🎉"].count(), 1);
    }

    #[test]
    fn redacted_reactions_disappear() {
        let reconciler = Reconciler::new(ME);
        let mut store = EventStore::new();
        store.insert(message("$1", 100, "hi"));
        store.ingest(reaction("$r1", BOB, "$1", "👍"));
        store.ingest(redaction("$x", "$r1"));

        let out = reconciler.reconcile(&store, &LocalEchoTracker::new());
        assert_eq!(ids(&out.items), vec![event_id("$1")]);
        assert!(out.items[0].reactions.is_empty());
        assert_eq!(
            store.get("$r1").map(|event| event.content.kind()),
            Some(EventKind::Reaction)
        );
    }

    #[test]
    fn pending_edit_and_reaction_fold_onto_target() {
        let reconciler = Reconciler::new(ME);
        let mut store = EventStore::new();
        let mut echoes = LocalEchoTracker::new();
        store.insert(message("$1", 100, "hi"));
        echoes
            .begin_send(
                "tx-edit",
                EventContent::Edit {
                    target: "$1".into(),
                    new_body: "hello".into(),
                },
            )
            .expect("edit echo");
        echoes
            .begin_send(
                "tx-react",
                EventContent::Reaction {
                    target: "$1".into(),
                    key: "👍".into(),
                },
            )
            .expect("reaction echo");

        let out = reconciler.reconcile(&store, &echoes);
        assert_eq!(ids(&out.items), vec![event_id("$1")]);
        let item = &out.items[0];
        assert_eq!(item.body(), Some("hello"));
        assert!(item.edited);
        assert!(item.reactions["👍"].pending);
        assert!(item.reactions["👍"].own);
        let kinds: Vec<_> = item.pending.iter().map(|change| change.kind).collect();
        assert_eq!(kinds, vec![PendingKind::Edit, PendingKind::Reaction]);
    }

    #[test]
    fn failed_edit_keeps_confirmed_content() {
        let reconciler = Reconciler::new(ME);
        let mut store = EventStore::new();
        let mut echoes = LocalEchoTracker::new();
        store.insert(message("$1", 100, "hi"));
        echoes
            .begin_send(
                "tx-edit",
                EventContent::Edit {
                    target: "$1".into(),
                    new_body: "hello".into(),
                },
            )
            .expect("edit echo");
        echoes
            .mark_failed("tx-edit", TransportError::network("offline"))
            .expect("fail");

        let out = reconciler.reconcile(&store, &echoes);
        assert_eq!(out.items[0].body(), Some("hi"));
        assert!(matches!(
            out.items[0].pending[0].state,
            SendState::SendingFailed { .. }
        ));
    }

    #[test]
    fn pending_redaction_of_own_reaction_removes_it() {
        let reconciler = Reconciler::new(ME);
        let mut store = EventStore::new();
        let mut echoes = LocalEchoTracker::new();
        store.insert(message("$1", 100, "hi"));
        store.insert(reaction("$r1", ME, "$1", "👍"));
        echoes
            .begin_send(
                "tx-unreact",
                EventContent::Redaction {
                    redacts: "$r1".into(),
                    reason: None,
                },
            )
            .expect("redaction echo");

        let out = reconciler.reconcile(&store, &echoes);
        assert!(out.items[0].reactions.is_empty());
        assert_eq!(out.items[0].pending[0].kind, PendingKind::Reaction);
    }

    #[test]
    fn redaction_clears_reactions_before_and_after_confirmation() {
        let reconciler = Reconciler::new(ME);
        let mut store = EventStore::new();
        let mut echoes = LocalEchoTracker::new();
        store.insert(message("$1", 100, "hi"));
        store.ingest(reaction("$r1", BOB, "$1", "k"));
        echoes
            .begin_send(
                "tx-redact",
                EventContent::Redaction {
                    redacts: "$1".into(),
                    reason: None,
                },
            )
            .expect("redaction echo");

        let pending = reconciler.reconcile(&store, &echoes);
        assert_eq!(pending.items[0].content, ItemContent::Redacted { reason: None });
        assert!(pending.items[0].reactions.is_empty());

        store.ingest(redaction("$x", "$1").with_transaction_id("tx-redact"));
        echoes.prune_confirmed(&store);
        let confirmed = reconciler.reconcile(&store, &echoes);
        assert_eq!(confirmed.items[0].content, pending.items[0].content);
        assert_eq!(confirmed.items[0].reactions, pending.items[0].reactions);
        assert!(confirmed.items[0].pending.is_empty());

        // A late reaction on the tombstone stays hidden too.
        store.ingest(reaction("$r2", ME, "$1", "k"));
        let late = reconciler.reconcile(&store, &echoes);
        assert!(late.items[0].reactions.is_empty());
    }

    #[test]
    fn pins_follow_latest_state_and_pending_changes() {
        let reconciler = Reconciler::new(ME);
        let mut store = EventStore::new();
        let mut echoes = LocalEchoTracker::new();
        store.insert(message("$1", 100, "a"));
        store.insert(message("$2", 110, "b"));
        store.insert(TimelineEvent::new(
            "$p1",
            BOB,
            120,
            EventContent::PinnedEvents {
                pinned: vec!["$1".into()],
            },
        ));

        let confirmed = reconciler.reconcile(&store, &echoes);
        assert_eq!(confirmed.pinned, vec!["$1".to_owned()]);
        assert!(confirmed.items[0].pinned);
        assert!(!confirmed.items[1].pinned);

        echoes
            .begin_send_with_target(
                "tx-pin",
                EventContent::PinnedEvents {
                    pinned: vec!["$1".into(), "$2".into()],
                },
                Some("$2".into()),
            )
            .expect("pin echo");
        let pending = reconciler.reconcile(&store, &echoes);
        assert_eq!(ids(&pending.items), vec![event_id("$1"), event_id("$2")]);
        assert!(pending.items[1].pinned);
        assert_eq!(pending.items[1].pending[0].kind, PendingKind::Pin);
    }

    #[test]
    fn pending_pin_list_applies_when_target_is_not_rendered() {
        let reconciler = Reconciler::new(ME);
        let mut store = EventStore::new();
        let mut echoes = LocalEchoTracker::new();
        store.insert(message("$1", 100, "a"));
        echoes
            .begin_send_with_target(
                "tx-unpin",
                EventContent::PinnedEvents { pinned: vec!["$1".into()] },
                Some("$unloaded".into()),
            )
            .expect("pin echo");

        let out = reconciler.reconcile(&store, &echoes);
        assert_eq!(out.pinned, vec!["$1".to_owned()]);
        assert!(out.items[0].pinned);
        assert!(out.items[0].pending.is_empty());
    }

    #[test]
    fn hidden_events_do_not_render() {
        let reconciler = Reconciler::new(ME);
        let mut store = EventStore::new();
        store.ingest(message("$1", 100, "hi"));
        store.ingest(redaction("$r", "$missing"));
        store.ingest(TimelineEvent::new(
            "$p",
            BOB,
            120,
            EventContent::PinnedEvents { pinned: vec![] },
        ));

        let out = reconciler.reconcile(&store, &LocalEchoTracker::new());
        assert_eq!(ids(&out.items), vec![event_id("$1")]);
    }

    fn arb_events() -> impl Strategy<Value = Vec<TimelineEvent>> {
        prop::collection::vec((0u8..30, 0u64..10, 0u8..4), 0..40).prop_map(|raw| {
            raw.into_iter()
                .map(|(id, ts, kind)| {
                    let event_id = format!("${id}");
                    let target = format!("${}", id / 2);
                    let content = match kind {
                        0 | 1 => text("body"),
                        2 => EventContent::Edit {
                            target,
                            new_body: format!("edit {id}"),
                        },
                        _ => EventContent::Reaction {
                            target,
                            key: "👍".into(),
                        },
                    };
                    TimelineEvent::new(event_id, BOB, ts, content)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn reconciliation_is_deterministic(events in arb_events()) {
            let reconciler = Reconciler::new(ME);
            let mut forward = EventStore::new();
            let mut backward = EventStore::new();
            let mut seen = std::collections::HashSet::new();
            let unique: Vec<_> = events.into_iter().filter(|e| seen.insert(e.event_id.clone())).collect();
            for event in &unique {
                forward.ingest(event.clone());
            }
            for event in unique.iter().rev() {
                backward.ingest(event.clone());
            }
            let echoes = LocalEchoTracker::new();
            let first = reconciler.reconcile(&forward, &echoes);
            let again = reconciler.reconcile(&forward, &echoes);
            let reordered = reconciler.reconcile(&backward, &echoes);
            prop_assert_eq!(&first, &again);
            prop_assert_eq!(&first, &reordered);

            let mut ids: Vec<_> = first.items.iter().map(|item| item.id.clone()).collect();
            let total = ids.len();
            ids.sort();
            ids.dedup();
            prop_assert_eq!(ids.len(), total);
        }
    }
}
