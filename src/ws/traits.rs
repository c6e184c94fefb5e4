//! Seams between the connection layer and the transport.
//!
//! A [`Connector`] negotiates a transport and performs the STOMP handshake,
//! producing a live [`Session`]. The production implementation is
//! [`StompConnector`](crate::ws::session::StompConnector); tests inject their own.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::config::ConnectionConfig;
use super::error::WsError;
use super::frame::Frame;
use crate::Result;

/// Callback installed for one wire-level subscription; invoked once per `MESSAGE` frame.
pub type FrameHandler = Arc<dyn Fn(&Frame) + Send + Sync>;

/// The byte transport a session was negotiated over.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum TransportKind {
    /// Native full-duplex WebSocket
    #[strum(to_string = "websocket")]
    WebSocket,
    /// SockJS `xhr_streaming` fallback
    XhrStreaming,
    /// Not determined
    #[default]
    Unknown,
}

impl TransportKind {
    /// Whether this kind is a polling-style fallback rather than a native socket.
    #[must_use]
    pub const fn is_fallback(self) -> bool {
        !matches!(self, Self::WebSocket | Self::Unknown)
    }
}

/// Server-side identity of one wire-level subscription.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    #[must_use]
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A live messaging session.
///
/// Owned by [`ConnectionManager`](crate::ws::ConnectionManager); other components only
/// borrow it to issue subscribe/publish calls and never manage its lifecycle.
pub trait Session: Send + Sync {
    /// Start delivering frames sent to `destination` to `handler`, in arrival order.
    fn subscribe(&self, destination: &str, handler: FrameHandler) -> Result<SubscriptionId>;

    fn unsubscribe(&self, id: &SubscriptionId) -> Result<()>;

    /// Send `body` to `destination`.
    fn publish(&self, destination: &str, body: &str) -> Result<()>;

    fn transport_kind(&self) -> TransportKind;

    /// Tear the session and its transport down. Idempotent.
    fn close(&self);
}

/// Result of a successful handshake.
#[non_exhaustive]
pub struct Connection {
    pub session: Arc<dyn Session>,
    /// Resolves with the reason once the session ends on its own. Dropped without a
    /// value when the session is closed through [`Session::close`].
    pub closed: oneshot::Receiver<WsError>,
}

impl Connection {
    #[must_use]
    pub fn new(session: Arc<dyn Session>, closed: oneshot::Receiver<WsError>) -> Self {
        Self { session, closed }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("transport_kind", &self.session.transport_kind())
            .finish_non_exhaustive()
    }
}

/// Opens sessions. Must not retry on its own; reconnection belongs to the caller.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Connection>;
}
