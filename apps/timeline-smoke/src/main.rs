use std::{process, sync::Arc};

use timeline_core::{
    EventContent, IncomingEvent, ItemContent, MessageContent, TimelineConfig, TimelineEvent,
    TimelineFocus, TimelineItem,
};
use timeline_runtime::TimelineClient;
use timeline_transport::{InMemoryDecryptor, InMemoryRoomServer};
use tracing::{error, info};

mod logging;

const ROOM_ID: &str = "!smoke:example.org";
const OWN_USER_ID: &str = "@smoke:example.org";
const PEER_USER_ID: &str = "@peer:example.org";
const SESSION_ID: &str = "smoke-session";

#[tokio::main]
async fn main() {
    logging::init();

    let config = match TimelineConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            process::exit(2);
        }
    };

    if let Err(message) = run(config).await {
        error!(%message, "smoke run failed");
        eprintln!("Smoke run failed: {message}");
        process::exit(1);
    }
}

async fn run(config: TimelineConfig) -> Result<(), String> {
    let server = InMemoryRoomServer::new(OWN_USER_ID);
    let decryptor = InMemoryDecryptor::new();
    seed_history(&server)?;

    let client = TimelineClient::new(
        OWN_USER_ID,
        Arc::new(server.clone()),
        Arc::new(decryptor.clone()),
        config.clone(),
    );
    let room = client.open_room(ROOM_ID, TimelineFocus::Live).await;

    room.paginate_backwards(config.paginate_limit)
        .await
        .map_err(|err| format!("pagination failed: {err}"))?;
    info!(items = room.snapshot().items.len(), "history loaded");

    let greeting = room
        .send_text("hello from the smoke run")
        .await
        .map_err(|err| format!("send failed: {err}"))?;
    room.toggle_reaction("$peer-1", "👋")
        .await
        .map_err(|err| format!("reaction failed: {err}"))?;

    server.deliver_remote(
        ROOM_ID,
        TimelineEvent::new(
            "$peer-3",
            PEER_USER_ID,
            10_000,
            EventContent::Message(MessageContent::text("welcome!").in_reply_to(greeting.clone())),
        ),
    );
    client.ingest_sync(server.take_pending_sync()).await;

    room.edit_message(greeting.as_str(), "hello from the smoke run (edited)")
        .await
        .map_err(|err| format!("edit failed: {err}"))?;
    client.ingest_sync(server.take_pending_sync()).await;

    decryptor.add_session(SESSION_ID);
    let decrypted = room
        .retry_decryption(vec![SESSION_ID.to_owned()])
        .await
        .map_err(|err| err.to_string())?;
    info!(?decrypted, "late keys applied");

    for item in &room.snapshot().items {
        println!("{}", describe(item));
    }

    client.shutdown().await;
    Ok(())
}

fn seed_history(server: &InMemoryRoomServer) -> Result<(), String> {
    let secret = TimelineEvent::new(
        "$peer-2",
        PEER_USER_ID,
        2_000,
        EventContent::Message(MessageContent::text("this was encrypted")),
    );
    let sealed = InMemoryDecryptor::seal(&secret, SESSION_ID).map_err(|err| err.to_string())?;

    let history: Vec<IncomingEvent> = vec![
        TimelineEvent::new(
            "$peer-1",
            PEER_USER_ID,
            1_000,
            EventContent::Message(MessageContent::text("first message")),
        )
        .into(),
        sealed.into(),
    ];
    server.seed(ROOM_ID, history);
    Ok(())
}

fn describe(item: &TimelineItem) -> String {
    let content = match &item.content {
        ItemContent::Message(message) => match &message.in_reply_to {
            Some(parent) => format!("{} (reply to {parent})", message.body),
            None => message.body.clone(),
        },
        ItemContent::Redacted { .. } => "<redacted>".to_owned(),
        ItemContent::UnableToDecrypt { session_id } => format!("<unable to decrypt: {session_id}>"),
        other => format!("{other:?}"),
    };
    let reactions: Vec<String> = item
        .reactions
        .iter()
        .map(|(key, group)| format!("{key}x{}", group.count()))
        .collect();
    format!(
        "{:?} {} {}{}{}",
        item.id,
        item.sender,
        content,
        if item.edited { " [edited]" } else { "" },
        if reactions.is_empty() {
            String::new()
        } else {
            format!(" [{}]", reactions.join(" "))
        }
    )
}
