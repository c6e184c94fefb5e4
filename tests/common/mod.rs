#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Each test binary uses a different subset of these helpers"
)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chat_realtime::Result;
use chat_realtime::ws::{
    Command, ConnectOptions, Connection, ConnectionConfig, Connector, Frame, FrameHandler,
    Session, SubscriptionId, TransportKind, WsError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

pub const SERVER_URL: &str = "wss://chat.example.com/ws";
pub const TOKEN: &str = "test-token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub seq: u32,
    pub content: String,
}

#[must_use]
pub fn chat_json(seq: u32) -> String {
    serde_json::to_string(&ChatMessage {
        seq,
        content: format!("message {seq}"),
    })
    .unwrap()
}

#[must_use]
pub fn options(user_id: &str) -> ConnectOptions {
    ConnectOptions::new(SERVER_URL, TOKEN, user_id)
}

#[must_use]
pub fn options_with_max(user_id: &str, max_reconnect_attempts: u32) -> ConnectOptions {
    ConnectOptions::builder()
        .server_url(SERVER_URL)
        .auth_token(TOKEN.to_owned())
        .user_id(user_id)
        .max_reconnect_attempts(max_reconnect_attempts)
        .build()
}

/// Let spawned tasks run without letting paused time advance.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// What the next [`MockConnector::connect`] call does.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Succeed(TransportKind),
    Fail,
    /// Succeed after the given delay
    Delayed(Duration),
    /// Never complete
    Hang,
}

/// Connector driven by a script of outcomes; falls back to `fallback` when the
/// script runs out.
pub struct MockConnector {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    calls: Mutex<Vec<(Instant, String)>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockConnector {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_fallback(Outcome::Succeed(TransportKind::WebSocket))
    }

    #[must_use]
    pub fn always_failing() -> Arc<Self> {
        Self::with_fallback(Outcome::Fail)
    }

    #[must_use]
    pub fn with_fallback(fallback: Outcome) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn scripted(outcomes: &[Outcome]) -> Arc<Self> {
        let connector = Self::new();
        connector.script.lock().unwrap().extend(outcomes.iter().copied());
        connector
    }

    #[must_use]
    pub fn connect_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// When each connect call happened.
    #[must_use]
    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    #[must_use]
    pub fn user_ids(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, user)| user.clone())
            .collect()
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().unwrap().clone()
    }

    #[must_use]
    pub fn last_session(&self) -> Arc<MockSession> {
        self.sessions.lock().unwrap().last().cloned().unwrap()
    }

    fn open(&self, kind: TransportKind) -> Connection {
        let (session, closed) = MockSession::new(kind);
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Connection::new(session, closed)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Connection> {
        self.calls
            .lock()
            .unwrap()
            .push((Instant::now(), config.user_id.clone()));
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);

        match outcome {
            Outcome::Succeed(kind) => Ok(self.open(kind)),
            Outcome::Fail => Err(WsError::ConnectionClosed {
                code: Some(1006),
                reason: "connection refused".to_owned(),
            }
            .into()),
            Outcome::Delayed(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.open(TransportKind::WebSocket))
            }
            Outcome::Hang => std::future::pending().await,
        }
    }
}

struct MockSubscription {
    id: SubscriptionId,
    destination: String,
    handler: FrameHandler,
}

/// In-memory session recording every call made on it.
pub struct MockSession {
    kind: TransportKind,
    subscriptions: Mutex<Vec<MockSubscription>>,
    subscribe_calls: Mutex<Vec<String>>,
    unsubscribe_calls: Mutex<Vec<SubscriptionId>>,
    published: Mutex<Vec<(String, String)>>,
    next_id: AtomicU64,
    closed_tx: Mutex<Option<oneshot::Sender<WsError>>>,
    closed: AtomicBool,
}

impl MockSession {
    #[must_use]
    pub fn new(kind: TransportKind) -> (Arc<Self>, oneshot::Receiver<WsError>) {
        let (closed_tx, closed_rx) = oneshot::channel();
        let session = Arc::new(Self {
            kind,
            subscriptions: Mutex::new(Vec::new()),
            subscribe_calls: Mutex::new(Vec::new()),
            unsubscribe_calls: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            closed_tx: Mutex::new(Some(closed_tx)),
            closed: AtomicBool::new(false),
        });
        (session, closed_rx)
    }

    /// Deliver a `MESSAGE` to every subscription on `destination`; returns how many
    /// handlers were invoked.
    pub fn deliver(&self, destination: &str, body: &str) -> usize {
        let targets: Vec<(SubscriptionId, FrameHandler)> = self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|sub| sub.destination == destination)
            .map(|sub| (sub.id.clone(), Arc::clone(&sub.handler)))
            .collect();

        for (id, handler) in &targets {
            let frame = Frame::new(Command::Message)
                .with_header("destination", destination)
                .with_header("subscription", id.as_str())
                .with_body(body);
            handler(&frame);
        }
        targets.len()
    }

    /// Simulate the transport dropping underneath the session.
    pub fn drop_connection(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscriptions.lock().unwrap().clear();
        if let Some(tx) = self.closed_tx.lock().unwrap().take() {
            _ = tx.send(WsError::ConnectionClosed {
                code: Some(1006),
                reason: "abnormal closure".to_owned(),
            });
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Destinations with an open subscription.
    #[must_use]
    pub fn active_destinations(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|sub| sub.destination.clone())
            .collect()
    }

    #[must_use]
    pub fn subscribe_calls(&self) -> Vec<String> {
        self.subscribe_calls.lock().unwrap().clone()
    }

    #[must_use]
    pub fn unsubscribe_calls(&self) -> usize {
        self.unsubscribe_calls.lock().unwrap().len()
    }

    #[must_use]
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }
}

impl Session for MockSession {
    fn subscribe(&self, destination: &str, handler: FrameHandler) -> Result<SubscriptionId> {
        if self.is_closed() {
            return Err(WsError::NotConnected.into());
        }
        let id = SubscriptionId::new(format!(
            "sub-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        ));
        self.subscribe_calls
            .lock()
            .unwrap()
            .push(destination.to_owned());
        self.subscriptions.lock().unwrap().push(MockSubscription {
            id: id.clone(),
            destination: destination.to_owned(),
            handler,
        });
        Ok(id)
    }

    fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        self.unsubscribe_calls.lock().unwrap().push(id.clone());
        self.subscriptions.lock().unwrap().retain(|sub| &sub.id != id);
        Ok(())
    }

    fn publish(&self, destination: &str, body: &str) -> Result<()> {
        if self.is_closed() {
            return Err(WsError::NotConnected.into());
        }
        self.published
            .lock()
            .unwrap()
            .push((destination.to_owned(), body.to_owned()));
        Ok(())
    }

    fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscriptions.lock().unwrap().clear();
        // Dropping the sender without a value marks an intentional close.
        self.closed_tx.lock().unwrap().take();
    }
}
