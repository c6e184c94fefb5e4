use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use futures::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::handler::{MessageHandler, Parser};
use super::subscription::{SubscriptionManager, SubscriptionStats, Unsubscribe};
use crate::Result;
use crate::ws::{
    ConnectOptions, ConnectionManager, ConnectionQuality, ConnectionState, Connector,
    LifecycleCallbacks, Session, StompConnector,
};

/// Realtime client for the chat backend.
///
/// Owns one [`ConnectionManager`] and one [`SubscriptionManager`] and wires them so
/// that every (re)connection binds the new session and restores all subscriptions
/// before any application `on_connect` handler runs.
///
/// # Examples
///
/// ```rust, no_run
/// use chat_realtime::{ConnectOptions, RealtimeClient};
/// use serde::Deserialize;
///
/// #[derive(Debug, Deserialize)]
/// struct ChatMessage {
///     sender: String,
///     content: String,
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let client = RealtimeClient::new();
///     client.connect(ConnectOptions::new("wss://chat.example.com/ws", "token", "u1"));
///
///     let unsubscribe = client.subscribe("conv-42", "/topic/conversations/42", |msg: &ChatMessage| {
///         println!("{}: {}", msg.sender, msg.content);
///     });
///
///     // ...
///     unsubscribe.unsubscribe();
///     client.logout();
/// }
/// ```
#[derive(Clone)]
pub struct RealtimeClient {
    connection: ConnectionManager,
    subscriptions: SubscriptionManager,
    callbacks: Arc<RwLock<LifecycleCallbacks>>,
}

impl Default for RealtimeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("connection", &self.connection)
            .field("subscriptions", &self.subscriptions)
            .finish_non_exhaustive()
    }
}

impl RealtimeClient {
    /// Client using SockJS/STOMP over the network.
    #[must_use]
    pub fn new() -> Self {
        Self::with_connector(Arc::new(StompConnector::new()))
    }

    #[must_use]
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self::from_parts(connector, MessageHandler::new())
    }

    #[must_use]
    pub fn from_parts(connector: Arc<dyn Connector>, handler: MessageHandler) -> Self {
        let connection = ConnectionManager::new(connector);
        let subscriptions = SubscriptionManager::with_handler(handler);
        let callbacks = Arc::new(RwLock::new(LifecycleCallbacks::default()));

        let on_connect = {
            let subscriptions = subscriptions.clone();
            let callbacks = Arc::clone(&callbacks);
            move |session: Arc<dyn Session>| {
                subscriptions.bind_client(Some(Arc::clone(&session)));
                subscriptions.resubscribe_all();
                if let Some(on_connect) = current(&callbacks).on_connect {
                    on_connect(session);
                }
            }
        };
        let on_disconnect = {
            let subscriptions = subscriptions.clone();
            let callbacks = Arc::clone(&callbacks);
            move || {
                subscriptions.bind_client(None);
                if let Some(on_disconnect) = current(&callbacks).on_disconnect {
                    on_disconnect();
                }
            }
        };
        let on_reconnect_attempt = {
            let callbacks = Arc::clone(&callbacks);
            move |attempt: u32| {
                if let Some(on_reconnect_attempt) = current(&callbacks).on_reconnect_attempt {
                    on_reconnect_attempt(attempt);
                }
            }
        };

        connection.set_callbacks(
            LifecycleCallbacks::new()
                .with_on_connect(on_connect)
                .with_on_disconnect(on_disconnect)
                .with_on_reconnect_attempt(on_reconnect_attempt),
        );

        Self {
            connection,
            subscriptions,
            callbacks,
        }
    }

    /// See [`ConnectionManager::connect`].
    pub fn connect(&self, options: ConnectOptions) {
        self.connection.connect(options);
    }

    /// Close the connection. Subscriptions are kept and restored on the next connect.
    pub fn disconnect(&self) {
        self.connection.disconnect();
        self.subscriptions.bind_client(None);
    }

    /// Drop every subscription, then disconnect.
    pub fn logout(&self) {
        self.subscriptions.teardown_all();
        self.disconnect();
    }

    /// Application-level lifecycle handlers, invoked after the client's own wiring.
    /// Each handler supplied replaces the previous one for its event.
    pub fn set_callbacks(&self, callbacks: LifecycleCallbacks) {
        let mut current = self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if callbacks.on_connect.is_some() {
            current.on_connect = callbacks.on_connect;
        }
        if callbacks.on_disconnect.is_some() {
            current.on_disconnect = callbacks.on_disconnect;
        }
        if callbacks.on_reconnect_attempt.is_some() {
            current.on_reconnect_attempt = callbacks.on_reconnect_attempt;
        }
    }

    /// See [`SubscriptionManager::subscribe`].
    pub fn subscribe<T, F>(&self, key: &str, topic: &str, callback: F) -> Unsubscribe
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscriptions.subscribe(key, topic, callback)
    }

    pub fn subscribe_with_parser<T, F>(
        &self,
        key: &str,
        topic: &str,
        callback: F,
        parser: Parser<T>,
    ) -> Unsubscribe
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscriptions
            .subscribe_with_parser(key, topic, callback, parser)
    }

    pub fn subscribe_stream<T>(
        &self,
        key: &str,
        topic: &str,
    ) -> impl Stream<Item = T> + Send + use<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.subscriptions.subscribe_stream(key, topic)
    }

    pub fn subscribe_stream_with_parser<T>(
        &self,
        key: &str,
        topic: &str,
        parser: Parser<T>,
    ) -> impl Stream<Item = T> + Send + use<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.subscriptions
            .subscribe_stream_with_parser(key, topic, parser)
    }

    pub fn publish(&self, destination: &str, body: &str) -> Result<()> {
        self.subscriptions.publish(destination, body)
    }

    pub fn publish_json<T: Serialize>(&self, destination: &str, payload: &T) -> Result<()> {
        self.subscriptions.publish_json(destination, payload)
    }

    #[must_use]
    pub fn connection_quality(&self) -> ConnectionQuality {
        self.connection.connection_quality()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    #[must_use]
    pub fn is_using_fallback_transport(&self) -> bool {
        self.connection.is_using_fallback_transport()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        self.subscriptions.stats()
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }
}

fn current(callbacks: &RwLock<LifecycleCallbacks>) -> LifecycleCallbacks {
    callbacks
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}
