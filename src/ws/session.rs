//! STOMP session over a SockJS channel, and the production [`Connector`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt as _;
use secrecy::ExposeSecret as _;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, interval_at};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::config::ConnectionConfig;
use super::error::WsError;
use super::frame::{Command, Decoder, Frame};
use super::sockjs::{self, Channel, Inbound};
use super::traits::{Connection, Connector, FrameHandler, Session, SubscriptionId, TransportKind};
use crate::Result;

/// Production [`Connector`]: SockJS negotiation followed by a STOMP handshake.
#[derive(Debug, Clone, Default)]
pub struct StompConnector {
    http: reqwest::Client,
}

impl StompConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `http` for the SockJS `/info` probe and the xhr-streaming fallback.
    #[must_use]
    pub fn with_http_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn negotiate(&self, base: &Url) -> Result<Channel> {
        let websocket_allowed = match sockjs::fetch_info(&self.http, base).await {
            Ok(info) => info.websocket,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, "SockJS info unavailable, trying websocket first");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                true
            }
        };

        if websocket_allowed {
            match sockjs::open_websocket(&sockjs::session_prefix(base)?).await {
                Ok(channel) => return Ok(channel),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "WebSocket transport failed, falling back to xhr-streaming");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
        }

        sockjs::open_xhr_streaming(&self.http, &sockjs::session_prefix(base)?).await
    }
}

#[async_trait]
impl Connector for StompConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Connection> {
        let base = sockjs::http_base(&config.server_url)?;
        let channel = self.negotiate(&base).await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(transport = %channel.kind, "SockJS transport open, starting STOMP handshake");

        handshake(channel, config, base.host_str().unwrap_or_default()).await
    }
}

async fn handshake(channel: Channel, config: &ConnectionConfig, host: &str) -> Result<Connection> {
    let Channel {
        kind,
        outgoing,
        mut incoming,
        cancel,
    } = channel;
    // Tears the transport down if the handshake fails or its future is dropped on timeout.
    let guard = cancel.clone().drop_guard();

    let connect = Frame::connect(
        host,
        &config.user_id,
        config.auth_token.expose_secret(),
        config.heartbeat_outgoing,
        config.heartbeat_incoming,
    );
    outgoing
        .send(connect.encode_text())
        .map_err(|_e| WsError::NotConnected)?;

    let mut decoder = Decoder::new();
    let connected = await_connected(&mut incoming, &mut decoder).await?;
    let heartbeat = Heartbeat::negotiate(
        config.heartbeat_outgoing,
        config.heartbeat_incoming,
        connected.get("heart-beat"),
    );

    #[cfg(feature = "tracing")]
    tracing::debug!(
        version = connected.get("version").unwrap_or("1.0"),
        ?heartbeat,
        "STOMP session established"
    );

    let handlers: Arc<DashMap<String, FrameHandler>> = Arc::new(DashMap::new());
    let (closed_tx, closed) = oneshot::channel();
    let session = StompSession {
        kind,
        outgoing: outgoing.clone(),
        handlers: Arc::clone(&handlers),
        next_id: AtomicU64::new(0),
        cancel: cancel.clone(),
    };

    tokio::spawn(run_session(
        SessionLoop {
            incoming,
            decoder,
            handlers,
            outgoing,
            cancel,
            heartbeat,
        },
        closed_tx,
    ));

    guard.disarm();
    Ok(Connection {
        session: Arc::new(session),
        closed,
    })
}

async fn await_connected(
    incoming: &mut mpsc::UnboundedReceiver<Inbound>,
    decoder: &mut Decoder,
) -> Result<Frame> {
    loop {
        match incoming.recv().await {
            Some(Inbound::Message(text)) => {
                decoder.push(text.as_bytes());
                while let Some(frame) = decoder.next_frame()? {
                    match frame.command {
                        Command::Connected => return Ok(frame),
                        Command::Error => return Err(protocol_error(&frame).into()),
                        _ => {}
                    }
                }
            }
            Some(Inbound::Heartbeat) => {}
            Some(Inbound::Closed(e)) => return Err(e.into()),
            None => return Err(WsError::closed_without_reason().into()),
        }
    }
}

fn protocol_error(frame: &Frame) -> WsError {
    let error = WsError::Protocol {
        message: frame.get("message").unwrap_or_default().to_owned(),
        headers: frame.headers.clone(),
        body: frame.body_text().into_owned(),
    };

    #[cfg(feature = "tracing")]
    if let WsError::Protocol { message, headers, body } = &error {
        tracing::error!(%message, ?headers, %body, "STOMP error frame received");
    }

    error
}

/// Negotiated heart-beat schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Heartbeat {
    send_every: Option<Duration>,
    expect_within: Option<Duration>,
}

impl Heartbeat {
    /// Client offers `cx,cy`, server answers `sx,sy`: send every `max(cx, sy)`, expect
    /// traffic every `max(cy, sx)`; zero on either side disables that direction.
    fn negotiate(outgoing: Duration, incoming: Duration, server: Option<&str>) -> Self {
        let (sx, sy) = server
            .and_then(|value| value.split_once(','))
            .and_then(|(sx, sy)| {
                Some((
                    Duration::from_millis(sx.trim().parse().ok()?),
                    Duration::from_millis(sy.trim().parse().ok()?),
                ))
            })
            .unwrap_or_default();

        Self {
            send_every: (!outgoing.is_zero() && !sy.is_zero()).then(|| outgoing.max(sy)),
            expect_within: (!incoming.is_zero() && !sx.is_zero()).then(|| incoming.max(sx)),
        }
    }
}

/// A live STOMP session.
pub struct StompSession {
    kind: TransportKind,
    outgoing: mpsc::UnboundedSender<String>,
    handlers: Arc<DashMap<String, FrameHandler>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl StompSession {
    fn send(&self, frame: &Frame) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(WsError::NotConnected.into());
        }
        self.outgoing
            .send(frame.encode_text())
            .map_err(|_e| WsError::NotConnected)?;
        Ok(())
    }
}

impl Session for StompSession {
    fn subscribe(&self, destination: &str, handler: FrameHandler) -> Result<SubscriptionId> {
        let id = format!("sub-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.insert(id.clone(), handler);

        if let Err(e) = self.send(&Frame::subscribe(&id, destination)) {
            self.handlers.remove(&id);
            return Err(e);
        }
        Ok(SubscriptionId(id))
    }

    fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        self.handlers.remove(&id.0);
        self.send(&Frame::unsubscribe(&id.0))
    }

    fn publish(&self, destination: &str, body: &str) -> Result<()> {
        self.send(&Frame::send(destination, body))
    }

    fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        _ = self.send(&Frame::disconnect());
        self.handlers.clear();
        self.cancel.cancel();
    }
}

struct SessionLoop {
    incoming: mpsc::UnboundedReceiver<Inbound>,
    decoder: Decoder,
    handlers: Arc<DashMap<String, FrameHandler>>,
    outgoing: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    heartbeat: Heartbeat,
}

async fn run_session(state: SessionLoop, closed_tx: oneshot::Sender<WsError>) {
    let cancel = state.cancel.clone();
    let handlers = Arc::clone(&state.handlers);

    // A panicking reader still reports a lost session; a dropped sender means a close.
    let reason = match AssertUnwindSafe(drive(state)).catch_unwind().await {
        Ok(reason) => reason,
        Err(_panic) => Some(WsError::ConnectionClosed {
            code: None,
            reason: "session reader panicked".to_owned(),
        }),
    };

    cancel.cancel();
    handlers.clear();
    if let Some(reason) = reason {
        #[cfg(feature = "tracing")]
        tracing::warn!(%reason, "STOMP session ended");
        _ = closed_tx.send(reason);
    }
}

async fn drive(state: SessionLoop) -> Option<WsError> {
    let SessionLoop {
        mut incoming,
        mut decoder,
        handlers,
        outgoing,
        cancel,
        heartbeat,
    } = state;

    // Frames that arrived in the same chunk as CONNECTED.
    if let Some(reason) = drain(&mut decoder, &handlers) {
        return Some(reason);
    }

    let mut send_tick = heartbeat
        .send_every
        .map(|every| interval_at(Instant::now() + every, every));
    let mut check_tick = heartbeat
        .expect_within
        .map(|within| interval_at(Instant::now() + within, within));
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            () = cancel.cancelled() => return None,
            inbound = incoming.recv() => match inbound {
                Some(Inbound::Message(text)) => {
                    last_seen = Instant::now();
                    decoder.push(text.as_bytes());
                    if let Some(reason) = drain(&mut decoder, &handlers) {
                        return Some(reason);
                    }
                }
                Some(Inbound::Heartbeat) => last_seen = Instant::now(),
                Some(Inbound::Closed(reason)) => return Some(reason),
                None => return Some(WsError::closed_without_reason()),
            },
            () = tick(send_tick.as_mut()) => {
                if outgoing.send("\n".to_owned()).is_err() {
                    return Some(WsError::closed_without_reason());
                }
            }
            () = tick(check_tick.as_mut()) => {
                if let Some(within) = heartbeat.expect_within
                    && last_seen.elapsed() > within * 2
                {
                    return Some(WsError::HeartbeatTimeout);
                }
            }
        }
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Route every complete buffered frame; returns the reason if the session must end.
fn drain(decoder: &mut Decoder, handlers: &DashMap<String, FrameHandler>) -> Option<WsError> {
    loop {
        match decoder.next_frame() {
            Ok(Some(frame)) => {
                if let Some(reason) = route(&frame, handlers) {
                    return Some(reason);
                }
            }
            Ok(None) => return None,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Discarding undecodable STOMP frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                decoder.skip_frame();
            }
        }
    }
}

fn route(frame: &Frame, handlers: &DashMap<String, FrameHandler>) -> Option<WsError> {
    match frame.command {
        Command::Message => {
            // Clone the handler out so no map guard is held while subscribers run.
            let handler = frame
                .get("subscription")
                .and_then(|id| handlers.get(id).map(|entry| Arc::clone(entry.value())));
            match handler {
                Some(handler) => {
                    if catch_unwind(AssertUnwindSafe(|| handler(frame))).is_err() {
                        #[cfg(feature = "tracing")]
                        tracing::error!(
                            subscription = frame.get("subscription").unwrap_or_default(),
                            "Frame handler panicked"
                        );
                    }
                }
                None => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(
                        subscription = frame.get("subscription").unwrap_or_default(),
                        "MESSAGE for unknown subscription"
                    );
                }
            }
            None
        }
        Command::Error => Some(protocol_error(frame)),
        _ => {
            #[cfg(feature = "tracing")]
            tracing::trace!(command = %frame.command, "Ignoring frame");
            None
        }
    }
}
