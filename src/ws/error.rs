#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

use crate::error::{Error, Kind};

/// Transport and session error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating over the native WebSocket transport
    Connection(tokio_tungstenite::tungstenite::Error),
    /// Error on one of the SockJS HTTP requests (`/info`, `xhr_streaming`, `xhr_send`)
    Http(reqwest::Error),
    /// Error decoding a SockJS frame payload
    MessageParse(serde_json::Error),
    /// The server sent a STOMP `ERROR` frame
    Protocol {
        /// Value of the `message` header, or empty when absent
        message: String,
        /// All headers of the `ERROR` frame in arrival order
        headers: Vec<(String, String)>,
        /// Frame body decoded lossily as UTF-8
        body: String,
    },
    /// Received bytes that do not form a valid STOMP or SockJS frame
    InvalidFrame(String),
    /// The transport was closed by the peer
    ConnectionClosed {
        /// Close code reported by the peer, if any
        code: Option<u16>,
        /// Close reason reported by the peer
        reason: String,
    },
    /// No `CONNECTED` frame arrived within the connect timeout
    HandshakeTimeout,
    /// No traffic from the server within the negotiated heart-beat window
    HeartbeatTimeout,
    /// The operation needs a live session and there is none
    NotConnected,
    /// The configured server URL cannot be used
    InvalidUrl(String),
}

impl WsError {
    pub(crate) fn closed_without_reason() -> Self {
        Self::ConnectionClosed {
            code: None,
            reason: String::new(),
        }
    }
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::Http(e) => write!(f, "SockJS HTTP request failed: {e}"),
            Self::MessageParse(e) => write!(f, "Failed to parse SockJS frame: {e}"),
            Self::Protocol { message, .. } => write!(f, "STOMP error frame: {message}"),
            Self::InvalidFrame(reason) => write!(f, "Invalid frame: {reason}"),
            Self::ConnectionClosed { code: Some(code), reason } => {
                write!(f, "Connection closed ({code}): {reason}")
            }
            Self::ConnectionClosed { code: None, reason } if reason.is_empty() => {
                write!(f, "Connection closed")
            }
            Self::ConnectionClosed { code: None, reason } => {
                write!(f, "Connection closed: {reason}")
            }
            Self::HandshakeTimeout => write!(f, "STOMP handshake timed out"),
            Self::HeartbeatTimeout => write!(f, "No heart-beat received from server"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::InvalidUrl(url) => write!(f, "Invalid server URL: {url}"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::Http(e) => Some(e),
            Self::MessageParse(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for Error {
    fn from(e: WsError) -> Self {
        let kind = match &e {
            WsError::Protocol { .. } | WsError::InvalidFrame(_) => Kind::Protocol,
            WsError::InvalidUrl(_) => Kind::Validation,
            _ => Kind::WebSocket,
        };
        Error::with_source(kind, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::with_source(Kind::WebSocket, WsError::Connection(e))
    }
}
