use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use timeline_core::{
    Decryptor, Direction, EventContent, EventPage, EventStore, IncomingEvent,
    LocalEchoTracker, MessageContent, PaginationController, PaginationError, PaginationStart,
    Reconciler, Reconciliation, RetryPolicy, SendError, SendState, TimelineConfig, TimelineFocus,
    TimelineSnapshot, TimelineSubscription, TimelineView, TransportError, ViewChannels,
};
use timeline_transport::{RoomTransport, ScopedTransport};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// The room timeline has been shut down.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("room timeline is closed")]
pub struct TimelineClosed;

/// What a reaction toggle ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionToggle {
    /// A new reaction was sent.
    Added { event_id: String },
    /// The own confirmed reaction was redacted.
    Removed { redaction_event_id: String },
    /// A still-sending reaction (or un-reaction) was cancelled instead.
    Withdrawn { transaction_id: String },
}

type PaginationReply = oneshot::Sender<Result<(), PaginationError>>;
type SendReply = oneshot::Sender<Result<String, SendError>>;
type UnitReply = oneshot::Sender<Result<(), SendError>>;
type ToggleReply = oneshot::Sender<Result<ReactionToggle, SendError>>;

/// Caller waiting for the outcome of one send.
#[derive(Debug)]
enum Responder {
    EventId(SendReply),
    Unit(UnitReply),
    Toggle { reply: ToggleReply, added: bool },
}

impl Responder {
    fn resolve(self, result: Result<String, SendError>) {
        match self {
            Self::EventId(reply) => {
                let _ = reply.send(result);
            }
            Self::Unit(reply) => {
                let _ = reply.send(result.map(|_| ()));
            }
            Self::Toggle { reply, added } => {
                let _ = reply.send(result.map(|event_id| {
                    if added {
                        ReactionToggle::Added { event_id }
                    } else {
                        ReactionToggle::Removed {
                            redaction_event_id: event_id,
                        }
                    }
                }));
            }
        }
    }
}

#[derive(Debug)]
enum Command {
    Ingest {
        events: Vec<IncomingEvent>,
        reply: oneshot::Sender<()>,
    },
    Paginate {
        direction: Direction,
        request_size: u16,
        reply: PaginationReply,
    },
    PaginationFinished {
        direction: Direction,
        result: Result<EventPage, TransportError>,
    },
    Send {
        content: EventContent,
        responder: Responder,
    },
    ToggleReaction {
        target: String,
        key: String,
        reply: ToggleReply,
    },
    SetPinned {
        event_id: String,
        pinned: bool,
        reply: UnitReply,
    },
    SendFinished {
        transaction_id: String,
        result: Result<String, TransportError>,
    },
    RetrySend {
        transaction_id: String,
        reply: SendReply,
    },
    CancelSend {
        transaction_id: String,
        reply: UnitReply,
    },
    DiscardSend {
        transaction_id: String,
        reply: UnitReply,
    },
    RetryDecryption {
        session_ids: Vec<String>,
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Cloneable handle to one room's timeline actor.
#[derive(Clone, Debug)]
pub struct RoomTimelineHandle {
    room_id: Arc<str>,
    commands: mpsc::Sender<Command>,
    channels: ViewChannels,
    shutdown: CancellationToken,
}

impl RoomTimelineHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Current snapshot plus every later update.
    pub fn subscribe(&self) -> TimelineSubscription {
        self.channels.subscribe()
    }

    pub fn snapshot(&self) -> Arc<TimelineSnapshot> {
        self.channels.latest()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Feed events delivered by sync; resolves once they are reconciled.
    pub async fn ingest_sync(&self, events: Vec<IncomingEvent>) -> Result<(), TimelineClosed> {
        self.request(|reply| Command::Ingest { events, reply })
            .await
            .ok_or(TimelineClosed)
    }

    pub async fn paginate_backwards(&self, request_size: u16) -> Result<(), PaginationError> {
        self.paginate(Direction::Backward, request_size).await
    }

    pub async fn paginate_forwards(&self, request_size: u16) -> Result<(), PaginationError> {
        self.paginate(Direction::Forward, request_size).await
    }

    /// Send a message; resolves to the confirmed event ID.
    pub async fn send_message(&self, message: MessageContent) -> Result<String, SendError> {
        self.send(EventContent::Message(message)).await
    }

    pub async fn send_text(&self, body: impl Into<String>) -> Result<String, SendError> {
        self.send_message(MessageContent::text(body)).await
    }

    pub async fn send_reply(
        &self,
        in_reply_to: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<String, SendError> {
        self.send_message(MessageContent::text(body).in_reply_to(in_reply_to))
            .await
    }

    pub async fn edit_message(
        &self,
        target: impl Into<String>,
        new_body: impl Into<String>,
    ) -> Result<String, SendError> {
        self.send(EventContent::Edit {
            target: target.into(),
            new_body: new_body.into(),
        })
        .await
    }

    pub async fn redact(
        &self,
        target: impl Into<String>,
        reason: Option<String>,
    ) -> Result<String, SendError> {
        self.send(EventContent::Redaction {
            redacts: target.into(),
            reason,
        })
        .await
    }

    pub async fn toggle_reaction(
        &self,
        target: impl Into<String>,
        key: impl Into<String>,
    ) -> Result<ReactionToggle, SendError> {
        let (target, key) = (target.into(), key.into());
        self.request(|reply| Command::ToggleReaction { target, key, reply })
            .await
            .unwrap_or(Err(SendError::Closed))
    }

    pub async fn pin(&self, event_id: impl Into<String>) -> Result<(), SendError> {
        self.set_pinned(event_id.into(), true).await
    }

    pub async fn unpin(&self, event_id: impl Into<String>) -> Result<(), SendError> {
        self.set_pinned(event_id.into(), false).await
    }

    /// Send a failed echo again; resolves to the confirmed event ID.
    pub async fn retry_send(&self, transaction_id: impl Into<String>) -> Result<String, SendError> {
        let transaction_id = transaction_id.into();
        self.request(|reply| Command::RetrySend {
            transaction_id,
            reply,
        })
        .await
        .unwrap_or(Err(SendError::Closed))
    }

    /// Cancel a send that has not resolved yet.
    pub async fn cancel_send(&self, transaction_id: impl Into<String>) -> Result<(), SendError> {
        let transaction_id = transaction_id.into();
        self.request(|reply| Command::CancelSend {
            transaction_id,
            reply,
        })
        .await
        .unwrap_or(Err(SendError::Closed))
    }

    /// Remove a failed echo from the timeline.
    pub async fn discard_send(&self, transaction_id: impl Into<String>) -> Result<(), SendError> {
        let transaction_id = transaction_id.into();
        self.request(|reply| Command::DiscardSend {
            transaction_id,
            reply,
        })
        .await
        .unwrap_or(Err(SendError::Closed))
    }

    /// Re-run decryption for events from `session_ids`; returns the decrypted event IDs.
    pub async fn retry_decryption(
        &self,
        session_ids: Vec<String>,
    ) -> Result<Vec<String>, TimelineClosed> {
        self.request(|reply| Command::RetryDecryption { session_ids, reply })
            .await
            .ok_or(TimelineClosed)
    }

    /// Stop the actor. In-flight requests are abandoned and subscriptions end.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn paginate(
        &self,
        direction: Direction,
        request_size: u16,
    ) -> Result<(), PaginationError> {
        self.request(|reply| Command::Paginate {
            direction,
            request_size,
            reply,
        })
        .await
        .unwrap_or(Err(PaginationError::Closed))
    }

    async fn send(&self, content: EventContent) -> Result<String, SendError> {
        self.request(|reply| Command::Send {
            content,
            responder: Responder::EventId(reply),
        })
        .await
        .unwrap_or(Err(SendError::Closed))
    }

    async fn set_pinned(&self, event_id: String, pinned: bool) -> Result<(), SendError> {
        self.request(|reply| Command::SetPinned {
            event_id,
            pinned,
            reply,
        })
        .await
        .unwrap_or(Err(SendError::Closed))
    }

    async fn request<R>(&self, command: impl FnOnce(oneshot::Sender<R>) -> Command) -> Option<R> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).await.ok()?;
        response.await.ok()
    }
}

/// Spawn the actor that owns one room's timeline state.
pub fn spawn_room_timeline<T: RoomTransport>(
    room_id: impl Into<String>,
    own_user_id: impl Into<String>,
    focus: TimelineFocus,
    transport: Arc<T>,
    decryptor: Arc<dyn Decryptor>,
    config: &TimelineConfig,
) -> RoomTimelineHandle {
    let room_id: String = room_id.into();
    let (commands, command_rx) = mpsc::channel(config.command_buffer.max(1));
    let view = TimelineView::new(config.update_buffer);
    let channels = view.channels();
    let shutdown = CancellationToken::new();

    let actor = RoomTimeline {
        transport: ScopedTransport::new(transport, room_id.clone()),
        decryptor,
        config: config.clone(),
        retry_policy: config.retry_policy(),
        store: EventStore::new(),
        echoes: LocalEchoTracker::new(),
        reconciler: Reconciler::new(own_user_id),
        pagination: PaginationController::new(&focus),
        view,
        in_flight: HashMap::new(),
        completions: commands.downgrade(),
        command_rx,
        shutdown: shutdown.clone(),
    };
    info!(%room_id, ?focus, "room timeline starting");
    tokio::spawn(actor.run());

    RoomTimelineHandle {
        room_id: room_id.into(),
        commands,
        channels,
        shutdown,
    }
}

#[derive(Debug)]
struct InFlightSend {
    cancel: CancellationToken,
    responder: Option<Responder>,
}

/// Single owner of a room's store, echoes and view; every mutation runs here.
struct RoomTimeline<T> {
    transport: ScopedTransport<T>,
    decryptor: Arc<dyn Decryptor>,
    config: TimelineConfig,
    retry_policy: RetryPolicy,
    store: EventStore,
    echoes: LocalEchoTracker,
    reconciler: Reconciler,
    pagination: PaginationController<PaginationReply>,
    view: TimelineView,
    in_flight: HashMap<String, InFlightSend>,
    completions: mpsc::WeakSender<Command>,
    command_rx: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
}

impl<T: RoomTransport> RoomTimeline<T> {
    async fn run(mut self) {
        self.refresh();
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }
        self.teardown();
    }

    fn room_id(&self) -> &str {
        self.transport.room_id()
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Ingest { events, reply } => {
                trace!(room_id = %self.room_id(), count = events.len(), "ingesting sync events");
                for event in events {
                    self.store.ingest_incoming(event, self.decryptor.as_ref());
                }
                self.refresh();
                let _ = reply.send(());
            }
            Command::Paginate {
                direction,
                request_size,
                reply,
            } => self.handle_paginate(direction, request_size, reply),
            Command::PaginationFinished { direction, result } => {
                self.handle_pagination_finished(direction, result)
            }
            Command::Send { content, responder } => {
                let target = content.relation_target().map(str::to_owned);
                self.start_send(content, target, responder);
            }
            Command::ToggleReaction { target, key, reply } => {
                self.handle_toggle_reaction(target, key, reply)
            }
            Command::SetPinned {
                event_id,
                pinned,
                reply,
            } => self.handle_set_pinned(event_id, pinned, reply),
            Command::SendFinished {
                transaction_id,
                result,
            } => self.handle_send_finished(transaction_id, result),
            Command::RetrySend {
                transaction_id,
                reply,
            } => self.handle_retry_send(transaction_id, reply),
            Command::CancelSend {
                transaction_id,
                reply,
            } => {
                let _ = reply.send(self.cancel_echo(&transaction_id));
            }
            Command::DiscardSend {
                transaction_id,
                reply,
            } => {
                let result = self
                    .echoes
                    .discard(&transaction_id)
                    .map(|_| ())
                    .map_err(SendError::from);
                if result.is_ok() {
                    debug!(room_id = %self.room_id(), %transaction_id, "failed echo discarded");
                    self.refresh();
                }
                let _ = reply.send(result);
            }
            Command::RetryDecryption { session_ids, reply } => {
                let decrypted = self
                    .store
                    .retry_decryption(&session_ids, self.decryptor.as_ref());
                debug!(
                    room_id = %self.room_id(),
                    ?session_ids,
                    decrypted = decrypted.len(),
                    "decryption retried"
                );
                self.refresh();
                let _ = reply.send(decrypted);
            }
        }
    }

    fn handle_paginate(&mut self, direction: Direction, request_size: u16, reply: PaginationReply) {
        match self.pagination.begin(direction) {
            PaginationStart::Started { cursor } => {
                let limit = self.config.bounded_limit(Some(request_size));
                debug!(room_id = %self.room_id(), ?direction, ?cursor, limit, "fetching page");
                self.pagination.park(direction, reply);
                self.spawn_fetch(direction, cursor, limit);
                self.refresh();
            }
            PaginationStart::Coalesced => {
                debug!(room_id = %self.room_id(), ?direction, "joining in-flight pagination");
                self.pagination.park(direction, reply);
            }
            PaginationStart::Exhausted => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn handle_pagination_finished(
        &mut self,
        direction: Direction,
        result: Result<EventPage, TransportError>,
    ) {
        let outcome = match result {
            Ok(page) => {
                debug!(
                    room_id = %self.room_id(),
                    ?direction,
                    count = page.events.len(),
                    exhausted = page.next_cursor.is_none(),
                    "page received"
                );
                for event in page.events {
                    self.store.ingest_incoming(event, self.decryptor.as_ref());
                }
                self.pagination
                    .complete(direction, page.next_cursor)
                    .map(|waiters| (waiters, Ok(())))
            }
            Err(error) => {
                warn!(room_id = %self.room_id(), ?direction, %error, "pagination failed");
                self.pagination
                    .fail(direction, error.clone())
                    .map(|waiters| (waiters, Err(PaginationError::Transport(error))))
            }
        };

        self.refresh();
        match outcome {
            Ok((waiters, result)) => {
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            }
            Err(err) => warn!(room_id = %self.room_id(), %err, "dropping stray pagination result"),
        }
    }

    fn handle_toggle_reaction(&mut self, target: String, key: String, reply: ToggleReply) {
        if !self.store.contains(&target) {
            let _ = reply.send(Err(SendError::TargetNotFound(target)));
            return;
        }

        let own_user_id = self.reconciler.own_user_id().to_owned();
        if let Some(reaction_id) = self
            .store
            .find_reaction(&target, &key, &own_user_id)
            .map(|event| event.event_id.clone())
        {
            // An un-react still in flight is withdrawn rather than doubled.
            let pending_removal = self.echoes.find_sending(|echo| {
                matches!(&echo.content, EventContent::Redaction { redacts, .. } if *redacts == reaction_id)
            });
            if let Some(transaction_id) = pending_removal.map(|echo| echo.transaction_id.clone()) {
                let _ = reply.send(self.withdraw(transaction_id));
                return;
            }

            self.start_send(
                EventContent::Redaction {
                    redacts: reaction_id.clone(),
                    reason: None,
                },
                Some(reaction_id),
                Responder::Toggle {
                    reply,
                    added: false,
                },
            );
            return;
        }

        let pending_reaction = self
            .echoes
            .iter()
            .find(|echo| {
                echo.state.is_optimistic()
                    && matches!(
                        &echo.content,
                        EventContent::Reaction { target: t, key: k } if *t == target && *k == key
                    )
            })
            .map(|echo| (echo.transaction_id.clone(), echo.state.clone()));

        match pending_reaction {
            Some((transaction_id, SendState::Sending)) => {
                let _ = reply.send(self.withdraw(transaction_id));
            }
            Some((_, SendState::Sent { event_id })) => {
                // Accepted but not synced yet; there is nothing to redact locally.
                let _ = reply.send(Err(SendError::TargetNotFound(event_id)));
            }
            _ => self.start_send(
                EventContent::Reaction {
                    target: target.clone(),
                    key,
                },
                Some(target),
                Responder::Toggle { reply, added: true },
            ),
        }
    }

    fn handle_set_pinned(&mut self, event_id: String, pinned: bool, reply: UnitReply) {
        let current = self.view.current();
        let mut list = current.pinned.clone();
        if list.contains(&event_id) == pinned {
            let _ = reply.send(Ok(()));
            return;
        }
        // Only rendered items can be pinned.
        if !current
            .items
            .iter()
            .any(|item| item.event_id() == Some(event_id.as_str()))
        {
            let _ = reply.send(Err(SendError::TargetNotFound(event_id)));
            return;
        }
        if pinned {
            list.push(event_id.clone());
        } else {
            list.retain(|pinned_id| *pinned_id != event_id);
        }

        self.start_send(
            EventContent::PinnedEvents { pinned: list },
            Some(event_id),
            Responder::Unit(reply),
        );
    }

    fn start_send(&mut self, content: EventContent, target: Option<String>, responder: Responder) {
        if let Some(target) = &target
            && !self.store.contains(target)
        {
            responder.resolve(Err(SendError::TargetNotFound(target.clone())));
            return;
        }

        let transaction_id = Uuid::new_v4().to_string();
        if let Err(err) =
            self.echoes
                .begin_send_with_target(transaction_id.clone(), content.clone(), target)
        {
            responder.resolve(Err(err.into()));
            return;
        }

        debug!(room_id = %self.room_id(), %transaction_id, kind = ?content.kind(), "send started");
        self.spawn_send(transaction_id, content, responder);
        self.refresh();
    }

    fn handle_send_finished(&mut self, transaction_id: String, result: Result<String, TransportError>) {
        let Some(in_flight) = self.in_flight.remove(&transaction_id) else {
            debug!(room_id = %self.room_id(), %transaction_id, "result for cancelled send ignored");
            return;
        };

        // Sync already delivered the event: the send landed whatever the transport reported.
        let delivered = self
            .store
            .event_for_transaction(&transaction_id)
            .map(|event| event.event_id.clone());
        let outcome = match (delivered, result) {
            (Some(event_id), result) => {
                if let Err(error) = &result {
                    debug!(
                        room_id = %self.room_id(),
                        %transaction_id,
                        %event_id,
                        %error,
                        "send error ignored; event already synced"
                    );
                }
                Ok(event_id)
            }
            (None, Ok(event_id)) => {
                debug!(room_id = %self.room_id(), %transaction_id, %event_id, "send confirmed");
                self.store.link_transaction(&transaction_id, &event_id);
                self.echoes
                    .mark_sent(&transaction_id, &event_id)
                    .map(|()| event_id)
                    .map_err(SendError::from)
            }
            (None, Err(error)) => {
                warn!(room_id = %self.room_id(), %transaction_id, %error, "send failed");
                self.echoes
                    .mark_failed(&transaction_id, error.clone())
                    .map_err(SendError::from)
                    .and(Err(SendError::Transport(error)))
            }
        };

        self.refresh();
        if let Some(responder) = in_flight.responder {
            responder.resolve(outcome);
        }
    }

    fn handle_retry_send(&mut self, transaction_id: String, reply: SendReply) {
        let content = match self.echoes.retry(&transaction_id) {
            Ok(echo) => echo.content.clone(),
            Err(err) => {
                let _ = reply.send(Err(err.into()));
                return;
            }
        };
        debug!(room_id = %self.room_id(), %transaction_id, "retrying failed send");
        self.spawn_send(transaction_id, content, Responder::EventId(reply));
        self.refresh();
    }

    fn withdraw(&mut self, transaction_id: String) -> Result<ReactionToggle, SendError> {
        self.cancel_echo(&transaction_id)?;
        Ok(ReactionToggle::Withdrawn { transaction_id })
    }

    fn cancel_echo(&mut self, transaction_id: &str) -> Result<(), SendError> {
        self.echoes.cancel(transaction_id)?;
        debug!(room_id = %self.room_id(), %transaction_id, "send cancelled");
        self.refresh();
        if let Some(in_flight) = self.in_flight.remove(transaction_id) {
            in_flight.cancel.cancel();
            if let Some(responder) = in_flight.responder {
                responder.resolve(Err(SendError::Cancelled));
            }
        }
        Ok(())
    }

    fn spawn_fetch(&self, direction: Direction, cursor: Option<String>, limit: u16) {
        let transport = self.transport.clone();
        let completions = self.completions.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = transport.fetch(cursor.as_deref(), direction, limit) => result,
            };
            if let Some(commands) = completions.upgrade() {
                let _ = commands
                    .send(Command::PaginationFinished { direction, result })
                    .await;
            }
        });
    }

    fn spawn_send(&mut self, transaction_id: String, content: EventContent, responder: Responder) {
        let cancel = self.shutdown.child_token();
        self.in_flight.insert(
            transaction_id.clone(),
            InFlightSend {
                cancel: cancel.clone(),
                responder: Some(responder),
            },
        );

        let transport = self.transport.clone();
        let completions = self.completions.clone();
        let policy = self.retry_policy;
        tokio::spawn(async move {
            let Some(result) =
                send_with_retry(&transport, &transaction_id, &content, policy, &cancel).await
            else {
                return;
            };
            if let Some(commands) = completions.upgrade() {
                let _ = commands
                    .send(Command::SendFinished {
                        transaction_id,
                        result,
                    })
                    .await;
            }
        });
    }

    /// Reconcile and publish; echoes whose events became visible are dropped first.
    fn refresh(&mut self) {
        let resolved = self.echoes.prune_confirmed(&self.store);
        if !resolved.is_empty() {
            trace!(room_id = %self.room_id(), ?resolved, "local echoes resolved");
        }
        let Reconciliation { items, pinned } = self.reconciler.reconcile(&self.store, &self.echoes);
        self.view.publish(items, self.pagination.state(), pinned);
    }

    fn teardown(&mut self) {
        for waiter in self.pagination.abandon() {
            let _ = waiter.send(Err(PaginationError::Closed));
        }
        for (_, in_flight) in self.in_flight.drain() {
            in_flight.cancel.cancel();
            if let Some(responder) = in_flight.responder {
                responder.resolve(Err(SendError::Closed));
            }
        }
        self.shutdown.cancel();
        info!(room_id = %self.room_id(), "room timeline stopped");
    }
}

/// Run one send with backoff; `None` when cancelled.
async fn send_with_retry<T: RoomTransport>(
    transport: &ScopedTransport<T>,
    transaction_id: &str,
    content: &EventContent,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Option<Result<String, TransportError>> {
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        let result = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = transport.send(transaction_id, content) => result,
        };

        match result {
            Ok(event_id) => return Some(Ok(event_id)),
            Err(error) if policy.allows_another_attempt(attempts, &error) => {
                let delay = policy.delay_for_attempt(attempts - 1, error.retry_after_ms);
                warn!(
                    room_id = %transport.room_id(),
                    %transaction_id,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "send attempt failed; retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => return Some(Err(error)),
        }
    }
}
