#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;
use rand::Rng as _;
use secrecy::{ExposeSecret as _, SecretString};

use crate::Result;
use crate::error::Error;

const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_HEARTBEAT_INCOMING_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_OUTGOING_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(15);
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_JITTER_PERCENT: u32 = 10;

/// Options supplied on every [`connect`](crate::ws::ConnectionManager::connect) call.
///
/// Unset optional fields keep the value of the previous connection's configuration,
/// or the crate default on the first connection.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ConnectOptions {
    /// `ws://` or `wss://` endpoint of the SockJS/STOMP server (`http(s)://` is accepted too)
    #[builder(into)]
    pub server_url: String,
    /// Bearer token sent in the STOMP `CONNECT` frame
    #[builder(into)]
    pub auth_token: SecretString,
    /// Identity of the user the session belongs to
    #[builder(into)]
    pub user_id: String,
    pub max_reconnect_attempts: Option<u32>,
    pub heartbeat_incoming: Option<Duration>,
    pub heartbeat_outgoing: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    /// Replaces the whole backoff policy, including `max_attempts`
    pub reconnect: Option<ReconnectConfig>,
}

impl ConnectOptions {
    /// Options with only the required fields set.
    #[must_use]
    pub fn new(server_url: &str, auth_token: &str, user_id: &str) -> Self {
        Self::builder()
            .server_url(server_url)
            .auth_token(auth_token.to_owned())
            .user_id(user_id)
            .build()
    }
}

/// Effective configuration of one connection attempt chain.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub server_url: String,
    pub auth_token: SecretString,
    pub user_id: String,
    /// How often the server is expected to send traffic; `Duration::ZERO` disables the check
    pub heartbeat_incoming: Duration,
    /// How often the client sends heart-beats; `Duration::ZERO` disables them
    pub heartbeat_outgoing: Duration,
    /// Upper bound on transport negotiation plus the STOMP handshake
    pub connect_timeout: Duration,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

impl ConnectionConfig {
    /// Merges `options` over `previous`, falling back to defaults for anything neither sets.
    #[must_use]
    pub fn merge(previous: Option<&Self>, options: ConnectOptions) -> Self {
        let mut reconnect = options
            .reconnect
            .or_else(|| previous.map(|p| p.reconnect.clone()))
            .unwrap_or_default();
        if let Some(max) = options.max_reconnect_attempts {
            reconnect.max_attempts = max;
        }

        Self {
            server_url: options.server_url,
            auth_token: options.auth_token,
            user_id: options.user_id,
            heartbeat_incoming: options
                .heartbeat_incoming
                .or_else(|| previous.map(|p| p.heartbeat_incoming))
                .unwrap_or(DEFAULT_HEARTBEAT_INCOMING_DURATION),
            heartbeat_outgoing: options
                .heartbeat_outgoing
                .or_else(|| previous.map(|p| p.heartbeat_outgoing))
                .unwrap_or(DEFAULT_HEARTBEAT_OUTGOING_DURATION),
            connect_timeout: options
                .connect_timeout
                .or_else(|| previous.map(|p| p.connect_timeout))
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_DURATION),
            reconnect,
        }
    }

    /// Rejects configurations no handshake could succeed with.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(Error::validation("server url must not be empty"));
        }
        if self.user_id.trim().is_empty() {
            return Err(Error::validation("user id must not be empty"));
        }
        if self.auth_token.expose_secret().is_empty() {
            return Err(Error::validation("auth token must not be empty"));
        }
        Ok(())
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before giving up.
    pub max_attempts: u32,
    /// Initial backoff duration for first reconnection attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Symmetric jitter applied to every delay, as a percentage of the un-jittered delay
    pub jitter_percent: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_percent: DEFAULT_JITTER_PERCENT,
        }
    }
}

impl ReconnectConfig {
    /// Applies `±jitter_percent` of `base` uniformly at random.
    #[must_use]
    pub fn jitter(&self, base: Duration) -> Duration {
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let spread = base_ms.saturating_mul(u64::from(self.jitter_percent)) / 100;
        if spread == 0 {
            return base;
        }

        let offset = rand::rng().random_range(0..=spread.saturating_mul(2));
        Duration::from_millis(base_ms.saturating_sub(spread).saturating_add(offset))
    }
}

// Jitter is applied separately so that it stays symmetric around the capped delay.
impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}
