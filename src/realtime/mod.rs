//! Application-facing realtime layer: typed subscriptions multiplexed over one
//! managed connection.

pub mod client;
pub mod handler;
pub mod subscription;

pub use client::RealtimeClient;
pub use handler::{
    Callback, CallbackId, CallbackSet, MessageHandler, ParsedMessage, Parser, ParserSource,
    json_parser,
};
pub use subscription::{SubscriptionManager, SubscriptionStats, Unsubscribe};
