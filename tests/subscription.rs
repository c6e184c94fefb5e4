#![allow(
    clippy::unwrap_used,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chat_realtime::error::Kind;
use chat_realtime::realtime::{Parser, SubscriptionManager, SubscriptionStats, Unsubscribe};
use chat_realtime::ws::{Session, TransportKind};
use chat_realtime::RealtimeClient;
use futures::StreamExt as _;
use tokio::time::{sleep, timeout};

use crate::common::{ChatMessage, MockConnector, MockSession, chat_json, options, settle};

const TOPIC: &str = "/topic/conversations/42";

fn bound_manager() -> (SubscriptionManager, Arc<MockSession>) {
    let manager = SubscriptionManager::new();
    let (session, _closed) = MockSession::new(TransportKind::WebSocket);
    manager.bind_client(Some(Arc::clone(&session) as Arc<dyn Session>));
    (manager, session)
}

fn collector() -> (Arc<Mutex<Vec<u32>>>, impl Fn(&ChatMessage) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |message: &ChatMessage| {
        sink.lock().unwrap().push(message.seq);
    })
}

#[test]
fn subscribers_sharing_a_key_share_one_wire_subscription() {
    let (manager, session) = bound_manager();
    let (first, on_first) = collector();
    let (second, on_second) = collector();

    let _a = manager.subscribe("conv-42", TOPIC, on_first);
    let _b = manager.subscribe("conv-42", TOPIC, on_second);

    assert_eq!(session.subscribe_calls(), [TOPIC]);

    for seq in 1..=3 {
        assert_eq!(session.deliver(TOPIC, &chat_json(seq)), 1);
    }

    assert_eq!(*first.lock().unwrap(), [1, 2, 3]);
    assert_eq!(*second.lock().unwrap(), [1, 2, 3]);
    let stats = manager.stats();
    assert_eq!(stats.total_entries, 1);
    assert_eq!(stats.entries_with_live_handle, 1);
    assert_eq!(stats.total_callbacks, 2);
}

#[test]
fn unsubscribing_last_callback_removes_wire_subscription() {
    let (manager, session) = bound_manager();
    let (first, on_first) = collector();
    let (second, on_second) = collector();

    let a = manager.subscribe("conv-42", TOPIC, on_first);
    let b = manager.subscribe("conv-42", TOPIC, on_second);

    a.unsubscribe();
    assert_eq!(session.unsubscribe_calls(), 0);
    session.deliver(TOPIC, &chat_json(1));

    b.unsubscribe();
    assert_eq!(session.unsubscribe_calls(), 1);
    assert!(session.active_destinations().is_empty());
    assert_eq!(session.deliver(TOPIC, &chat_json(2)), 0);

    assert!(first.lock().unwrap().is_empty());
    assert_eq!(*second.lock().unwrap(), [1]);
    assert_eq!(manager.stats(), SubscriptionStats::default());
}

#[test]
fn entries_are_restored_on_a_new_session() {
    let (manager, first_session) = bound_manager();
    let (seen_a, on_a) = collector();
    let (seen_b, on_b) = collector();
    let _a = manager.subscribe("conv-1", "/topic/conversations/1", on_a);
    let _b = manager.subscribe("notifications", "/user/queue/notifications", on_b);

    manager.bind_client(None);
    assert_eq!(manager.stats().entries_with_live_handle, 0);
    assert_eq!(manager.stats().total_callbacks, 2);

    let (second_session, _closed) = MockSession::new(TransportKind::WebSocket);
    manager.bind_client(Some(Arc::clone(&second_session) as Arc<dyn Session>));
    manager.resubscribe_all();
    manager.resubscribe_all();

    let mut destinations = second_session.active_destinations();
    destinations.sort();
    assert_eq!(
        destinations,
        ["/topic/conversations/1", "/user/queue/notifications"]
    );
    assert_eq!(manager.stats().entries_with_live_handle, 2);
    assert_eq!(first_session.subscribe_calls().len(), 2);

    second_session.deliver("/topic/conversations/1", &chat_json(7));
    second_session.deliver("/user/queue/notifications", &chat_json(8));
    assert_eq!(*seen_a.lock().unwrap(), [7]);
    assert_eq!(*seen_b.lock().unwrap(), [8]);
}

#[test]
fn malformed_frame_reaches_no_callback() {
    let (manager, session) = bound_manager();
    let (first, on_first) = collector();
    let (second, on_second) = collector();
    let _a = manager.subscribe("conv-42", TOPIC, on_first);
    let _b = manager.subscribe("conv-42", TOPIC, on_second);

    session.deliver(TOPIC, "{not json");
    assert!(first.lock().unwrap().is_empty());
    assert!(second.lock().unwrap().is_empty());

    session.deliver(TOPIC, &chat_json(1));
    assert_eq!(*first.lock().unwrap(), [1]);
    assert_eq!(*second.lock().unwrap(), [1]);
}

#[test]
fn panicking_callback_does_not_starve_siblings() {
    let (manager, session) = bound_manager();
    let (seen, on_message) = collector();

    let _faulty = manager.subscribe("conv-42", TOPIC, |message: &ChatMessage| {
        assert!(message.seq != 1, "subscriber bug on first message");
    });
    let _healthy = manager.subscribe("conv-42", TOPIC, on_message);

    session.deliver(TOPIC, &chat_json(1));
    session.deliver(TOPIC, &chat_json(2));

    assert_eq!(*seen.lock().unwrap(), [1, 2]);
    assert_eq!(manager.stats().entries_with_live_handle, 1);
}

#[test]
fn subscribe_while_disconnected_is_a_noop() {
    let manager = SubscriptionManager::new();
    let (seen, on_message) = collector();

    let unsubscribe = manager.subscribe("conv-42", TOPIC, on_message);

    assert!(unsubscribe.is_noop());
    assert_eq!(manager.stats(), SubscriptionStats::default());
    unsubscribe.unsubscribe();
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn existing_key_keeps_its_topic() {
    let (manager, session) = bound_manager();
    let (_, on_first) = collector();
    let (second, on_second) = collector();

    let _a = manager.subscribe("conv-42", TOPIC, on_first);
    let _b = manager.subscribe("conv-42", "/topic/conversations/99", on_second);

    assert_eq!(session.subscribe_calls(), [TOPIC]);
    session.deliver(TOPIC, &chat_json(5));
    assert_eq!(*second.lock().unwrap(), [5]);
}

#[test]
fn different_payload_type_on_existing_key_is_rejected() {
    let (manager, session) = bound_manager();
    let (_, on_message) = collector();

    let _a = manager.subscribe("conv-42", TOPIC, on_message);
    let b = manager.subscribe("conv-42", TOPIC, |_: &String| {});

    assert!(b.is_noop());
    assert_eq!(manager.stats().total_callbacks, 1);
    assert_eq!(session.subscribe_calls().len(), 1);
}

#[test]
fn custom_parser_is_used() {
    let (manager, session) = bound_manager();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let parser: Parser<String> = Arc::new(|body: &[u8]| -> chat_realtime::Result<String> {
        Ok(String::from_utf8_lossy(body).to_uppercase())
    });

    let _typing = manager.subscribe_with_parser(
        "typing",
        "/topic/typing/42",
        move |text: &String| sink.lock().unwrap().push(text.clone()),
        parser,
    );
    session.deliver("/topic/typing/42", "alice is typing");

    assert_eq!(*seen.lock().unwrap(), ["ALICE IS TYPING"]);
}

#[test]
fn panicking_parser_drops_only_that_frame() {
    let (manager, session) = bound_manager();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let parser: Parser<String> = Arc::new(|body: &[u8]| -> chat_realtime::Result<String> {
        assert!(!body.is_empty(), "parser cannot handle empty bodies");
        Ok(String::from_utf8_lossy(body).into_owned())
    });

    let _typing = manager.subscribe_with_parser(
        "typing",
        "/topic/typing/42",
        move |text: &String| sink.lock().unwrap().push(text.clone()),
        parser,
    );
    session.deliver("/topic/typing/42", "");
    session.deliver("/topic/typing/42", "bob is typing");

    assert_eq!(*seen.lock().unwrap(), ["bob is typing"]);
    assert_eq!(manager.stats().total_callbacks, 1);
}

#[test]
fn callback_may_unsubscribe_itself() {
    let (manager, session) = bound_manager();
    let handle: Arc<Mutex<Option<Unsubscribe>>> = Arc::new(Mutex::new(None));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let slot = Arc::clone(&handle);
    let sink = Arc::clone(&seen);
    let unsubscribe = manager.subscribe("conv-42", TOPIC, move |message: &ChatMessage| {
        sink.lock().unwrap().push(message.seq);
        if let Some(unsubscribe) = slot.lock().unwrap().take() {
            unsubscribe.unsubscribe();
        }
    });
    *handle.lock().unwrap() = Some(unsubscribe);

    session.deliver(TOPIC, &chat_json(1));
    session.deliver(TOPIC, &chat_json(2));

    assert_eq!(*seen.lock().unwrap(), [1]);
    assert_eq!(session.unsubscribe_calls(), 1);
    assert_eq!(manager.stats(), SubscriptionStats::default());
}

#[test]
fn teardown_all_unsubscribes_everything() {
    let (manager, session) = bound_manager();
    let (_, on_a) = collector();
    let (_, on_b) = collector();
    let _a = manager.subscribe("conv-1", "/topic/conversations/1", on_a);
    let _b = manager.subscribe("conv-2", "/topic/conversations/2", on_b);

    manager.teardown_all();

    assert_eq!(session.unsubscribe_calls(), 2);
    assert!(session.active_destinations().is_empty());
    assert_eq!(manager.stats(), SubscriptionStats::default());
}

#[test]
fn publish_rejects_blank_destination() {
    let (manager, session) = bound_manager();

    let err = manager.publish(" ", "{}").unwrap_err();

    assert_eq!(err.kind(), Kind::Validation);
    assert!(session.published().is_empty());
}

#[test]
fn publish_requires_a_session() {
    let manager = SubscriptionManager::new();

    let err = manager.publish("/app/chat.send", "{}").unwrap_err();
    assert_eq!(err.kind(), Kind::WebSocket);

    let (session, _closed) = MockSession::new(TransportKind::WebSocket);
    manager.bind_client(Some(Arc::clone(&session) as Arc<dyn Session>));
    manager
        .publish_json(
            "/app/chat.send",
            &ChatMessage {
                seq: 1,
                content: "hi".to_owned(),
            },
        )
        .unwrap();

    assert_eq!(
        session.published(),
        [(
            "/app/chat.send".to_owned(),
            r#"{"seq":1,"content":"hi"}"#.to_owned()
        )]
    );
}

#[tokio::test]
async fn stream_yields_payloads_and_unsubscribes_on_drop() {
    let (manager, session) = bound_manager();

    let mut stream = Box::pin(manager.subscribe_stream::<ChatMessage>("conv-42", TOPIC));
    session.deliver(TOPIC, &chat_json(1));
    session.deliver(TOPIC, &chat_json(2));

    let first = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
    let second = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
    assert_eq!(first.map(|m| m.seq), Some(1));
    assert_eq!(second.map(|m| m.seq), Some(2));

    drop(stream);
    assert_eq!(session.unsubscribe_calls(), 1);
    assert_eq!(manager.stats(), SubscriptionStats::default());
}

#[tokio::test]
async fn stream_with_parser_yields_parsed_payloads() {
    let (manager, session) = bound_manager();
    let parser: Parser<usize> =
        Arc::new(|body: &[u8]| -> chat_realtime::Result<usize> { Ok(body.len()) });

    let mut stream =
        Box::pin(manager.subscribe_stream_with_parser("presence", "/topic/presence", parser));
    session.deliver("/topic/presence", "online");

    let next = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
    assert_eq!(next, Some(6));
}

#[tokio::test]
async fn stream_ends_when_not_connected() {
    let manager = SubscriptionManager::new();

    let mut stream = Box::pin(manager.subscribe_stream::<ChatMessage>("conv-42", TOPIC));

    let next = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
    assert!(next.is_none());
}

#[tokio::test(start_paused = true)]
async fn client_restores_subscriptions_after_reconnect() {
    let connector = MockConnector::new();
    let client = RealtimeClient::with_connector(connector.clone());
    client.connect(options("u1"));
    settle().await;

    let (seen_a, on_a) = collector();
    let (seen_b, on_b) = collector();
    let _a = client.subscribe("conv-1", "/topic/conversations/1", on_a);
    let _b = client.subscribe("conv-2", "/topic/conversations/2", on_b);
    assert_eq!(client.stats().entries_with_live_handle, 2);

    connector.last_session().drop_connection();
    settle().await;
    assert_eq!(client.stats().entries_with_live_handle, 0);
    assert_eq!(client.stats().total_callbacks, 2);

    sleep(Duration::from_secs(2)).await;

    let session = connector.last_session();
    assert_eq!(connector.sessions().len(), 2);
    assert_eq!(session.active_destinations().len(), 2);
    assert_eq!(client.stats().entries_with_live_handle, 2);

    session.deliver("/topic/conversations/1", &chat_json(3));
    session.deliver("/topic/conversations/2", &chat_json(4));
    assert_eq!(*seen_a.lock().unwrap(), [3]);
    assert_eq!(*seen_b.lock().unwrap(), [4]);
}

#[tokio::test(start_paused = true)]
async fn client_disconnect_keeps_subscriptions_and_logout_drops_them() {
    let connector = MockConnector::new();
    let client = RealtimeClient::with_connector(connector.clone());
    client.connect(options("u1"));
    settle().await;

    let (_, on_message) = collector();
    let _a = client.subscribe("conv-1", "/topic/conversations/1", on_message);

    client.disconnect();
    assert_eq!(client.stats().total_entries, 1);
    assert_eq!(client.stats().entries_with_live_handle, 0);

    client.connect(options("u1"));
    settle().await;
    assert_eq!(client.stats().entries_with_live_handle, 1);
    assert_eq!(connector.last_session().active_destinations().len(), 1);

    client.logout();
    assert_eq!(client.stats(), SubscriptionStats::default());
    assert!(!client.is_connected());
    assert_eq!(connector.last_session().unsubscribe_calls(), 1);
}
