//! Join one conversation, print what arrives, and post a message.
//!
//! Run against a SockJS/STOMP chat backend:
//! ```sh
//! CHAT_SERVER_URL=wss://chat.example.com/ws CHAT_TOKEN=... CHAT_USER=u1 \
//!     RUST_LOG=info,chat_realtime=debug cargo run --example chat_room --features tracing
//! ```

use std::env;
use std::time::Duration;

use chat_realtime::{ConnectOptions, LifecycleCallbacks, RealtimeClient};
use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatMessage {
    sender: String,
    content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingMessage<'a> {
    conversation_id: &'a str,
    content: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingEvent {
    user_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server_url = env::var("CHAT_SERVER_URL")?;
    let token = env::var("CHAT_TOKEN")?;
    let user_id = env::var("CHAT_USER")?;
    let conversation = env::var("CHAT_CONVERSATION").unwrap_or_else(|_| "42".to_owned());

    let client = RealtimeClient::new();
    client.set_callbacks(
        LifecycleCallbacks::new()
            .with_on_connect(|_| info!("connected"))
            .with_on_disconnect(|| warn!("connection lost"))
            .with_on_reconnect_attempt(|attempt| info!(attempt, "reconnecting")),
    );
    client.connect(
        ConnectOptions::builder()
            .server_url(server_url)
            .auth_token(token)
            .user_id(user_id)
            .max_reconnect_attempts(5)
            .build(),
    );

    while !client.is_connected() {
        sleep(Duration::from_millis(100)).await;
    }
    info!(quality = ?client.connection_quality(), "session ready");

    let topic = format!("/topic/conversations/{conversation}");
    let typing = client.subscribe(
        "typing",
        &format!("/topic/conversations/{conversation}/typing"),
        |event: &TypingEvent| info!(user = %event.user_id, "typing"),
    );
    let mut messages = Box::pin(client.subscribe_stream::<ChatMessage>(&conversation, &topic));

    client.publish_json(
        "/app/chat.send",
        &OutgoingMessage {
            conversation_id: &conversation,
            content: "hello from chat_room",
        },
    )?;

    while let Ok(Some(message)) = timeout(Duration::from_secs(30), messages.next()).await {
        info!(sender = %message.sender, content = %message.content, "message");
    }

    info!(stats = ?client.stats(), "idle for 30s, leaving");
    typing.unsubscribe();
    drop(messages);
    client.logout();

    Ok(())
}
