use tracing::debug;

use crate::{
    error::DecryptionError,
    types::{EncryptedEvent, EventContent, IncomingEvent, TimelineEvent},
};

/// Decryption capability provided by the encryption layer.
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, event: &EncryptedEvent) -> Result<TimelineEvent, DecryptionError>;
}

/// Outcome of running the decryption step on one incoming event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decrypted {
    /// Plaintext event ready for insertion.
    Clear(TimelineEvent),
    /// Decryption failed; `placeholder` renders as "unable to decrypt" and the
    /// envelope is kept for a later retry.
    Undecryptable {
        placeholder: TimelineEvent,
        envelope: EncryptedEvent,
    },
}

/// Run the decryption step that precedes insertion into the event store.
///
/// Decryption failures never stop the pipeline; they produce a placeholder.
pub fn decrypt_incoming(incoming: IncomingEvent, decryptor: &dyn Decryptor) -> Decrypted {
    match incoming {
        IncomingEvent::Plain(event) => Decrypted::Clear(event),
        IncomingEvent::Encrypted(envelope) => match decrypt_envelope(&envelope, decryptor) {
            Ok(event) => Decrypted::Clear(event),
            Err(err) => {
                debug!(
                    event_id = %envelope.event_id,
                    session_id = %envelope.session_id,
                    error = %err,
                    "event could not be decrypted"
                );
                Decrypted::Undecryptable {
                    placeholder: placeholder_for(&envelope),
                    envelope,
                }
            }
        },
    }
}

/// Decrypt an envelope, keeping the identity and position fields of the envelope.
pub fn decrypt_envelope(
    envelope: &EncryptedEvent,
    decryptor: &dyn Decryptor,
) -> Result<TimelineEvent, DecryptionError> {
    let decrypted = decryptor.decrypt(envelope)?;
    Ok(TimelineEvent {
        event_id: envelope.event_id.clone(),
        sender: envelope.sender.clone(),
        origin_server_ts: envelope.origin_server_ts,
        content: decrypted.content,
        transaction_id: envelope
            .transaction_id
            .clone()
            .or(decrypted.transaction_id),
    })
}

fn placeholder_for(envelope: &EncryptedEvent) -> TimelineEvent {
    TimelineEvent {
        event_id: envelope.event_id.clone(),
        sender: envelope.sender.clone(),
        origin_server_ts: envelope.origin_server_ts,
        content: EventContent::UnableToDecrypt {
            session_id: envelope.session_id.clone(),
        },
        transaction_id: envelope.transaction_id.clone(),
    }
}
