#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod error;
pub mod realtime;
pub mod ws;

use crate::error::Error;

pub use realtime::{
    MessageHandler, ParsedMessage, RealtimeClient, SubscriptionManager, SubscriptionStats,
    Unsubscribe,
};
pub use ws::{
    ConnectOptions, ConnectionManager, ConnectionQuality, ConnectionStatus, LifecycleCallbacks,
    Quality, StompConnector, TransportKind,
};

pub type Result<T> = std::result::Result<T, Error>;
