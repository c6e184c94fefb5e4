//! Core connection infrastructure.
//!
//! # Architecture
//!
//! - [`frame`]: STOMP frame model and codec
//! - [`sockjs`]: SockJS framing, URL layout and the websocket / xhr-streaming transports
//! - [`session`]: STOMP session over a SockJS channel; [`StompConnector`] opens one
//! - [`ConnectionManager`]: connection state machine with backoff reconnection, written
//!   against the [`Connector`] and [`Session`] seams so tests can substitute the transport

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod session;
pub mod sockjs;
pub mod traits;

pub use config::{ConnectOptions, ConnectionConfig, ReconnectConfig};
pub use connection::{
    ConnectionManager, ConnectionQuality, ConnectionState, ConnectionStatus, LifecycleCallbacks,
    Quality,
};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use frame::{Command, Frame};
pub use session::StompConnector;
pub use traits::*;
