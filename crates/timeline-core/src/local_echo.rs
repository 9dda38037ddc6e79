use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error};

use crate::{
    error::{EchoError, TransportError},
    event_store::EventStore,
    types::{EventContent, SendState},
};

/// Optimistically rendered local action awaiting server confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEcho {
    pub transaction_id: String,
    pub state: SendState,
    pub content: EventContent,
    /// Event the action applies to (edit, reaction, redaction, pin).
    pub target_event_id: Option<String>,
    pub created_at_ms: u64,
}

impl LocalEcho {
    pub fn is_sending(&self) -> bool {
        is_sending(&self.state)
    }
}

/// Tracks in-flight local actions keyed by transaction ID, in submission order.
#[derive(Debug, Clone, Default)]
pub struct LocalEchoTracker {
    echoes: Vec<LocalEcho>,
}

impl LocalEchoTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.echoes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.echoes.is_empty()
    }

    pub fn get(&self, transaction_id: &str) -> Option<&LocalEcho> {
        self.echoes
            .iter()
            .find(|echo| echo.transaction_id == transaction_id)
    }

    /// Echoes in submission order.
    pub fn iter(&self) -> impl Iterator<Item = &LocalEcho> + '_ {
        self.echoes.iter()
    }

    /// First echo still in `Sending` that matches `predicate`.
    pub fn find_sending(&self, predicate: impl Fn(&LocalEcho) -> bool) -> Option<&LocalEcho> {
        self.echoes
            .iter()
            .find(|echo| echo.is_sending() && predicate(echo))
    }

    /// Register a new `Sending` echo; the target is taken from the content's relation.
    pub fn begin_send(
        &mut self,
        transaction_id: impl Into<String>,
        content: EventContent,
    ) -> Result<(), EchoError> {
        let target = content.relation_target().map(str::to_owned);
        self.begin_send_with_target(transaction_id, content, target)
    }

    /// Register a new `Sending` echo with an explicit target (used for pins).
    pub fn begin_send_with_target(
        &mut self,
        transaction_id: impl Into<String>,
        content: EventContent,
        target_event_id: Option<String>,
    ) -> Result<(), EchoError> {
        let transaction_id = transaction_id.into();
        if self.get(&transaction_id).is_some() {
            error!(%transaction_id, "transaction ID reused for a new local echo");
            return Err(EchoError::DuplicateTransaction(transaction_id));
        }

        debug!(%transaction_id, target = ?target_event_id, "local echo registered");
        self.echoes.push(LocalEcho {
            transaction_id,
            state: SendState::Sending,
            content,
            target_event_id,
            created_at_ms: unix_millis(),
        });
        Ok(())
    }

    /// The server accepted the echo as `event_id`.
    ///
    /// The echo stays visible as `Sent` until the event itself reaches the store.
    pub fn mark_sent(
        &mut self,
        transaction_id: &str,
        event_id: impl Into<String>,
    ) -> Result<(), EchoError> {
        let echo = self.sending_mut(transaction_id, "mark_sent")?;
        echo.state = SendState::Sent {
            event_id: event_id.into(),
        };
        Ok(())
    }

    /// The transport gave up; the echo is kept for retry or discard.
    pub fn mark_failed(
        &mut self,
        transaction_id: &str,
        error: TransportError,
    ) -> Result<(), EchoError> {
        let echo = self.sending_mut(transaction_id, "mark_failed")?;
        echo.state = SendState::SendingFailed { error };
        Ok(())
    }

    /// Drop an echo whose send has not resolved yet.
    pub fn cancel(&mut self, transaction_id: &str) -> Result<LocalEcho, EchoError> {
        let index = self.index_in_state(transaction_id, "cancel", is_sending)?;
        Ok(self.echoes.remove(index))
    }

    /// Move a failed echo back to `Sending` for another attempt.
    pub fn retry(&mut self, transaction_id: &str) -> Result<&LocalEcho, EchoError> {
        let index = self.index_in_state(transaction_id, "retry", is_failed)?;
        let echo = &mut self.echoes[index];
        echo.state = SendState::Sending;
        Ok(echo)
    }

    /// Drop a failed echo at the user's request.
    pub fn discard(&mut self, transaction_id: &str) -> Result<LocalEcho, EchoError> {
        let index = self.index_in_state(transaction_id, "discard", is_failed)?;
        Ok(self.echoes.remove(index))
    }

    /// Remove echoes whose confirmed event is now in the store.
    ///
    /// An echo counts as confirmed once its transaction is visible, whatever
    /// its state; a send that failed after the server accepted it is resolved
    /// here too. Returns the transaction IDs that were resolved.
    pub fn prune_confirmed(&mut self, store: &EventStore) -> Vec<String> {
        let mut resolved = Vec::new();
        self.echoes.retain(|echo| {
            let visible = store.event_for_transaction(&echo.transaction_id).is_some()
                || matches!(&echo.state, SendState::Sent { event_id } if store.contains(event_id));
            if visible {
                resolved.push(echo.transaction_id.clone());
            }
            !visible
        });
        resolved
    }

    fn sending_mut(
        &mut self,
        transaction_id: &str,
        action: &'static str,
    ) -> Result<&mut LocalEcho, EchoError> {
        let index = self.index_in_state(transaction_id, action, is_sending)?;
        Ok(&mut self.echoes[index])
    }

    fn index_in_state(
        &self,
        transaction_id: &str,
        action: &'static str,
        allowed: fn(&SendState) -> bool,
    ) -> Result<usize, EchoError> {
        let Some(index) = self
            .echoes
            .iter()
            .position(|echo| echo.transaction_id == transaction_id)
        else {
            error!(%transaction_id, action, "unknown transaction");
            return Err(EchoError::UnknownTransaction(transaction_id.to_owned()));
        };

        let state = &self.echoes[index].state;
        if !allowed(state) {
            error!(%transaction_id, action, ?state, "local echo is in the wrong state");
            return Err(EchoError::InvalidState {
                transaction_id: transaction_id.to_owned(),
                action,
                state: state.clone(),
            });
        }
        Ok(index)
    }
}

fn is_sending(state: &SendState) -> bool {
    matches!(state, SendState::Sending)
}

fn is_failed(state: &SendState) -> bool {
    matches!(state, SendState::SendingFailed { .. })
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageContent, TimelineEvent};

    fn text(body: &str) -> EventContent {
        EventContent::Message(MessageContent::text(body))
    }

    #[test]
    fn keeps_submission_order() {
        let mut tracker = LocalEchoTracker::new();
        tracker.begin_send("tx1", text("one")).expect("first send");
        tracker.begin_send("tx2", text("two")).expect("second send");
        tracker.begin_send("tx3", text("three")).expect("third send");

        let order: Vec<_> = tracker.iter().map(|e| e.transaction_id.as_str()).collect();
        assert_eq!(order, vec!["tx1", "tx2", "tx3"]);
        assert!(tracker.iter().all(LocalEcho::is_sending));
    }

    #[test]
    fn rejects_duplicate_transaction_id() {
        let mut tracker = LocalEchoTracker::new();
        tracker.begin_send("tx1", text("one")).expect("first send");
        let err = tracker
            .begin_send("tx1", text("again"))
            .expect_err("duplicate must be rejected");
        assert_eq!(err, EchoError::DuplicateTransaction("tx1".into()));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn derives_target_from_relation() {
        let mut tracker = LocalEchoTracker::new();
        tracker
            .begin_send(
                "tx1",
                EventContent::Reaction {
                    target: "$1".into(),
                    key: "👍".into(),
                },
            )
            .expect("reaction echo");
        assert_eq!(
            tracker.get("tx1").and_then(|e| e.target_event_id.as_deref()),
            Some("$1")
        );
    }

    #[test]
    fn transitions_out_of_sending_only_once() {
        let mut tracker = LocalEchoTracker::new();
        tracker.begin_send("tx1", text("one")).expect("send");
        tracker.mark_sent("tx1", "$1").expect("first transition");

        let err = tracker
            .mark_failed("tx1", TransportError::network("late failure"))
            .expect_err("second transition must fail");
        assert!(matches!(err, EchoError::InvalidState { action: "mark_failed", .. }));
        assert_eq!(
            tracker.get("tx1").map(|e| &e.state),
            Some(&SendState::Sent {
                event_id: "$1".into()
            })
        );
    }

    #[test]
    fn cancel_is_only_legal_while_sending() {
        let mut tracker = LocalEchoTracker::new();
        tracker.begin_send("tx1", text("one")).expect("send");
        tracker.begin_send("tx2", text("two")).expect("send");
        tracker
            .mark_failed("tx2", TransportError::network("offline"))
            .expect("fail");

        let cancelled = tracker.cancel("tx1").expect("cancel while sending");
        assert_eq!(cancelled.transaction_id, "tx1");
        assert!(tracker.cancel("tx2").is_err());
        assert_eq!(
            tracker.cancel("tx9"),
            Err(EchoError::UnknownTransaction("tx9".into()))
        );
    }

    #[test]
    fn failed_echo_can_be_retried_or_discarded() {
        let mut tracker = LocalEchoTracker::new();
        tracker.begin_send("tx1", text("one")).expect("send");
        tracker.begin_send("tx2", text("two")).expect("send");
        tracker
            .mark_failed("tx1", TransportError::network("offline"))
            .expect("fail");
        tracker
            .mark_failed("tx2", TransportError::network("offline"))
            .expect("fail");

        assert!(tracker.retry("tx1").expect("retry").is_sending());
        tracker.discard("tx2").expect("discard");
        assert!(tracker.get("tx2").is_none());
        assert!(tracker.discard("tx1").is_err(), "sending echo cannot be discarded");
    }

    #[test]
    fn prunes_sent_echoes_once_event_is_stored() {
        let mut tracker = LocalEchoTracker::new();
        let mut store = EventStore::new();
        tracker.begin_send("tx1", text("hello")).expect("send");
        tracker.mark_sent("tx1", "$evt1").expect("sent");

        assert!(tracker.prune_confirmed(&store).is_empty());
        assert_eq!(tracker.len(), 1);

        store.insert(TimelineEvent::new("$evt1", "@me:example.org", 100, text("hello")));
        assert_eq!(tracker.prune_confirmed(&store), vec!["tx1".to_owned()]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn prunes_echoes_in_any_state_once_their_transaction_is_visible() {
        let mut tracker = LocalEchoTracker::new();
        let mut store = EventStore::new();
        tracker.begin_send("tx1", text("lost ack")).expect("send");
        tracker.begin_send("tx2", text("in flight")).expect("send");
        tracker
            .mark_failed("tx1", TransportError::network("response lost"))
            .expect("failed");

        store.insert(
            TimelineEvent::new("$evt1", "@me:example.org", 100, text("lost ack"))
                .with_transaction_id("tx1"),
        );
        store.insert(
            TimelineEvent::new("$evt2", "@me:example.org", 101, text("in flight"))
                .with_transaction_id("tx2"),
        );

        assert_eq!(
            tracker.prune_confirmed(&store),
            vec!["tx1".to_owned(), "tx2".to_owned()]
        );
        assert!(tracker.is_empty());
        assert!(matches!(
            tracker.retry("tx1"),
            Err(EchoError::UnknownTransaction(_))
        ));
    }
}
