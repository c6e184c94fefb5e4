#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use super::config::{ConnectOptions, ConnectionConfig, ReconnectConfig};
use super::error::WsError;
use super::traits::{Connection, Connector, Session, TransportKind};

/// Invoked with the live session after every successful (re)connection.
pub type ConnectCallback = Arc<dyn Fn(Arc<dyn Session>) + Send + Sync>;
/// Invoked when the transport drops on its own. Never invoked by [`ConnectionManager::disconnect`].
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;
/// Invoked with the attempt number each time a retry is scheduled.
pub type ReconnectAttemptCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Lifecycle phase of the connection.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionStatus {
    /// Not connected and no retry pending
    #[default]
    Disconnected,
    /// Handshake in flight
    Connecting,
    /// Session established
    Connected,
    /// Waiting for the next scheduled retry
    Reconnecting,
}

/// Coarse health indicator for the host application.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Quality {
    Good,
    /// Connection lost, retries in progress
    Poor,
    /// Not connected; after exhausted retries the user must reconnect explicitly
    #[default]
    Disconnected,
}

/// Snapshot returned by [`ConnectionManager::connection_quality`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionQuality {
    pub status: ConnectionStatus,
    pub transport_kind: TransportKind,
    pub quality: Quality,
}

/// Snapshot returned by [`ConnectionManager::state`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub is_connected: bool,
    pub current_user_id: Option<String>,
    pub reconnect_attempts: u32,
    pub transport_kind: TransportKind,
    pub quality: Quality,
}

/// Handlers for connection lifecycle events. At most one per event.
#[non_exhaustive]
#[derive(Clone, Default)]
pub struct LifecycleCallbacks {
    pub on_connect: Option<ConnectCallback>,
    pub on_disconnect: Option<DisconnectCallback>,
    pub on_reconnect_attempt: Option<ReconnectAttemptCallback>,
}

impl LifecycleCallbacks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_on_connect<F>(mut self, callback: F) -> Self
    where
        F: Fn(Arc<dyn Session>) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn with_on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn with_on_reconnect_attempt<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.on_reconnect_attempt = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for LifecycleCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleCallbacks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_reconnect_attempt", &self.on_reconnect_attempt.is_some())
            .finish()
    }
}

/// Attempt chain bookkeeping. The timer handle is aborted whenever the chain is reset.
struct RetryState {
    attempts: u32,
    backoff: ExponentialBackoff,
    last_delay: Option<Duration>,
    timer: Option<JoinHandle<()>>,
}

impl RetryState {
    fn new(config: &ReconnectConfig) -> Self {
        Self {
            attempts: 0,
            backoff: config.clone().into(),
            last_delay: None,
            timer: None,
        }
    }

    fn reset(&mut self, config: &ReconnectConfig) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        *self = Self::new(config);
    }
}

struct State {
    status: ConnectionStatus,
    config: Option<ConnectionConfig>,
    session: Option<Arc<dyn Session>>,
    current_user_id: Option<String>,
    transport_kind: TransportKind,
    quality: Quality,
    retry: RetryState,
    /// Bumped by explicit `connect`/`disconnect`; outcomes tagged with an older value are stale.
    generation: u64,
}

struct Inner {
    connector: Arc<dyn Connector>,
    state: Mutex<State>,
    callbacks: RwLock<LifecycleCallbacks>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks(&self) -> LifecycleCallbacks {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Owns the physical connection, its state machine and backoff reconnection.
///
/// The manager holds at most one live [`Session`]. Every public method returns
/// immediately; outcomes are reported through [`LifecycleCallbacks`] and the state
/// accessors. Methods that start work spawn onto the ambient tokio runtime.
///
/// # Example
///
/// ```ignore
/// let manager = ConnectionManager::new(Arc::new(StompConnector::new()));
/// manager.set_callbacks(LifecycleCallbacks::new().with_on_connect(|session| {
///     println!("connected over {}", session.transport_kind());
/// }));
/// manager.connect(ConnectOptions::new("wss://chat.example.com/ws", token, "u1"));
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                state: Mutex::new(State {
                    status: ConnectionStatus::Disconnected,
                    config: None,
                    session: None,
                    current_user_id: None,
                    transport_kind: TransportKind::Unknown,
                    quality: Quality::Disconnected,
                    retry: RetryState::new(&ReconnectConfig::default()),
                    generation: 0,
                }),
                callbacks: RwLock::new(LifecycleCallbacks::default()),
            }),
        }
    }

    /// Start connecting with `options` merged over the last-known configuration.
    ///
    /// No-op while connected or connecting as the same user. A session belonging to a
    /// different user is closed first, without firing `on_disconnect`. Any pending retry
    /// is cancelled and the attempt counter restarts from zero. Options with an empty
    /// server URL, token or user id are logged and ignored.
    pub fn connect(&self, options: ConnectOptions) {
        let (stale, config, generation) = {
            let mut state = self.inner.state();
            let config = ConnectionConfig::merge(state.config.as_ref(), options);
            if let Err(e) = config.validate() {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %e, "Rejecting connect with invalid options");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return;
            }

            let same_user = state.current_user_id.as_deref() == Some(config.user_id.as_str());
            if same_user
                && matches!(
                    state.status,
                    ConnectionStatus::Connected | ConnectionStatus::Connecting
                )
            {
                #[cfg(feature = "tracing")]
                tracing::debug!(user_id = %config.user_id, status = %state.status, "Already connected, ignoring connect");
                return;
            }

            let stale = state.session.take();
            state.retry.reset(&config.reconnect);
            state.generation = state.generation.wrapping_add(1);
            state.status = ConnectionStatus::Connecting;
            state.transport_kind = TransportKind::Unknown;
            state.current_user_id = Some(config.user_id.clone());
            state.config = Some(config.clone());

            (stale, config, state.generation)
        };

        if let Some(session) = stale {
            #[cfg(feature = "tracing")]
            tracing::info!(user_id = %config.user_id, "Switching user, closing previous session");
            session.close();
        }

        spawn_attempt(Arc::clone(&self.inner), config, generation);
    }

    /// Close the session and stop reconnecting. Safe in any state.
    ///
    /// Does not fire `on_disconnect`; that callback is reserved for drops the caller
    /// did not ask for.
    pub fn disconnect(&self) {
        let session = {
            let mut state = self.inner.state();
            let reconnect = state
                .config
                .as_ref()
                .map(|config| config.reconnect.clone())
                .unwrap_or_default();

            state.generation = state.generation.wrapping_add(1);
            state.retry.reset(&reconnect);
            state.status = ConnectionStatus::Disconnected;
            state.quality = Quality::Disconnected;
            state.transport_kind = TransportKind::Unknown;
            state.current_user_id = None;
            state.session.take()
        };

        if let Some(session) = session {
            #[cfg(feature = "tracing")]
            tracing::info!("Disconnecting");
            session.close();
        }
    }

    /// Install lifecycle handlers. Each handler supplied replaces the previous one for
    /// its event; events left as `None` keep their current handler.
    pub fn set_callbacks(&self, callbacks: LifecycleCallbacks) {
        let mut current = self
            .inner
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

    #[must_use]
    pub fn connection_quality(&self) -> ConnectionQuality {
        let state = self.inner.state();
        ConnectionQuality {
            status: state.status,
            transport_kind: state.transport_kind,
            quality: state.quality,
        }
    }

    /// Whether the negotiated transport is a fallback rather than a native WebSocket.
    #[must_use]
    pub fn is_using_fallback_transport(&self) -> bool {
        self.inner.state().transport_kind.is_fallback()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state().status == ConnectionStatus::Connected
    }

    #[must_use]
    pub fn current_user_id(&self) -> Option<String> {
        self.inner.state().current_user_id.clone()
    }

    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state().retry.attempts
    }

    /// Delay chosen for the most recently scheduled retry, jitter included.
    #[must_use]
    pub fn last_retry_delay(&self) -> Option<Duration> {
        self.inner.state().retry.last_delay
    }

    /// The live session, if connected.
    #[must_use]
    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.inner.state().session.clone()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        let state = self.inner.state();
        ConnectionState {
            status: state.status,
            is_connected: state.status == ConnectionStatus::Connected,
            current_user_id: state.current_user_id.clone(),
            reconnect_attempts: state.retry.attempts,
            transport_kind: state.transport_kind,
            quality: state.quality,
        }
    }
}

fn spawn_attempt(inner: Arc<Inner>, config: ConnectionConfig, generation: u64) {
    tokio::spawn(async move {
        #[cfg(feature = "tracing")]
        tracing::debug!(server_url = %config.server_url, user_id = %config.user_id, "Connecting");

        let outcome = match timeout(config.connect_timeout, inner.connector.connect(&config)).await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(WsError::HandshakeTimeout.into()),
        };

        match outcome {
            Ok(connection) => on_connected(&inner, generation, connection),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Unable to connect");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;

                schedule_retry(&inner, generation);
            }
        }
    });
}

fn on_connected(inner: &Arc<Inner>, generation: u64, connection: Connection) {
    let Connection { session, closed } = connection;

    {
        let mut state = inner.state();
        if state.generation != generation {
            drop(state);
            #[cfg(feature = "tracing")]
            tracing::debug!("Handshake finished after the attempt was cancelled, closing session");
            session.close();
            return;
        }

        let reconnect = state
            .config
            .as_ref()
            .map(|config| config.reconnect.clone())
            .unwrap_or_default();
        state.retry.reset(&reconnect);
        state.status = ConnectionStatus::Connected;
        state.quality = Quality::Good;
        state.transport_kind = session.transport_kind();
        state.session = Some(Arc::clone(&session));
    }

    #[cfg(feature = "tracing")]
    tracing::info!(transport = %session.transport_kind(), "Connected");

    if let Some(on_connect) = inner.callbacks().on_connect {
        let handle = Arc::clone(&session);
        invoke("on_connect", move || on_connect(handle));
    }

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        // A dropped sender means the session was closed on purpose.
        if let Ok(reason) = closed.await {
            on_session_lost(&inner, generation, &reason);
        }
    });
}

fn on_session_lost(inner: &Arc<Inner>, generation: u64, reason: &WsError) {
    {
        let mut state = inner.state();
        if state.generation != generation || state.status != ConnectionStatus::Connected {
            return;
        }
        state.session = None;
        state.status = ConnectionStatus::Disconnected;
        state.transport_kind = TransportKind::Unknown;
    }

    #[cfg(feature = "tracing")]
    tracing::warn!(%reason, "Connection lost");
    #[cfg(not(feature = "tracing"))]
    let _ = reason;

    if let Some(on_disconnect) = inner.callbacks().on_disconnect {
        invoke("on_disconnect", move || on_disconnect());
    }

    schedule_retry(inner, generation);
}

/// Schedule the next attempt while attempts remain, otherwise give up.
fn schedule_retry(inner: &Arc<Inner>, generation: u64) {
    let attempt = {
        let mut state = inner.state();
        if state.generation != generation || state.status == ConnectionStatus::Connected {
            return;
        }
        let Some(config) = state.config.clone() else {
            return;
        };

        if state.retry.attempts >= config.reconnect.max_attempts {
            state.status = ConnectionStatus::Disconnected;
            state.quality = Quality::Disconnected;
            state.transport_kind = TransportKind::Unknown;
            if let Some(timer) = state.retry.timer.take() {
                timer.abort();
            }

            #[cfg(feature = "tracing")]
            tracing::error!(
                attempts = state.retry.attempts,
                max_attempts = config.reconnect.max_attempts,
                "Reconnection attempts exhausted, giving up"
            );
            return;
        }

        state.retry.attempts = state.retry.attempts.saturating_add(1);
        let attempt = state.retry.attempts;

        let base = state
            .retry
            .backoff
            .next_backoff()
            .unwrap_or(config.reconnect.max_backoff);
        let delay = config.reconnect.jitter(base);

        state.retry.last_delay = Some(delay);
        state.status = ConnectionStatus::Reconnecting;
        state.quality = Quality::Poor;

        #[cfg(feature = "tracing")]
        tracing::info!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduling reconnect"
        );

        let timer_inner = Arc::clone(inner);
        state.retry.timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            retry_now(&timer_inner, generation);
        }));

        attempt
    };

    if let Some(on_reconnect_attempt) = inner.callbacks().on_reconnect_attempt {
        invoke("on_reconnect_attempt", move || on_reconnect_attempt(attempt));
    }
}

fn retry_now(inner: &Arc<Inner>, generation: u64) {
    let config = {
        let mut state = inner.state();
        if state.generation != generation || state.status != ConnectionStatus::Reconnecting {
            return;
        }
        let Some(config) = state.config.clone() else {
            return;
        };
        // Our own handle; dropping it detaches rather than aborts.
        state.retry.timer = None;
        state.status = ConnectionStatus::Connecting;
        config
    };

    spawn_attempt(Arc::clone(inner), config, generation);
}

fn invoke<F: FnOnce()>(event: &'static str, callback: F) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        #[cfg(feature = "tracing")]
        tracing::error!(event, "Lifecycle callback panicked");
        #[cfg(not(feature = "tracing"))]
        let _ = event;
    }
}
