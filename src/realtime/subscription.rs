#![expect(
    clippy::module_name_repetitions,
    reason = "Subscription types deliberately include the module name for clarity"
)]

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_stream::stream;
use dashmap::{DashMap, Entry};
use futures::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use super::handler::{Callback, CallbackId, CallbackSet, MessageHandler, Parser, json_parser};
use crate::Result;
use crate::error::Error;
use crate::ws::{FrameHandler, Session, SubscriptionId, WsError};

/// Type-erased view of an entry's callbacks, so entries of different payload types
/// share one map.
trait ErasedCallbacks: Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn len(&self) -> usize;

    fn remove(&self, id: CallbackId) -> bool;

    fn frame_handler(&self, handler: &MessageHandler, context: &str) -> FrameHandler;
}

struct TypedCallbacks<T> {
    set: Arc<CallbackSet<T>>,
    parser: Parser<T>,
}

impl<T: Send + Sync + 'static> ErasedCallbacks for TypedCallbacks<T> {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn len(&self) -> usize {
        self.set.len()
    }

    fn remove(&self, id: CallbackId) -> bool {
        self.set.remove(id)
    }

    fn frame_handler(&self, handler: &MessageHandler, context: &str) -> FrameHandler {
        handler.frame_handler_with(Arc::clone(&self.set), Arc::clone(&self.parser), context)
    }
}

struct SubscriptionEntry {
    topic: String,
    /// Wire subscription on the currently bound session, if any
    handle: Option<SubscriptionId>,
    callbacks: Arc<dyn ErasedCallbacks>,
}

/// Counts returned by [`SubscriptionManager::stats`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub total_entries: usize,
    pub entries_with_live_handle: usize,
    pub total_callbacks: usize,
}

struct Inner {
    client: RwLock<Option<Arc<dyn Session>>>,
    entries: DashMap<String, SubscriptionEntry>,
    handler: MessageHandler,
    next_callback_id: AtomicU64,
}

impl Inner {
    fn client(&self) -> Option<Arc<dyn Session>> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn open(
        &self,
        client: &Arc<dyn Session>,
        key: &str,
        topic: &str,
        callbacks: &dyn ErasedCallbacks,
    ) -> Option<SubscriptionId> {
        let frame_handler = callbacks.frame_handler(&self.handler, key);
        match client.subscribe(topic, frame_handler) {
            Ok(id) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(key, topic, subscription = %id, "Subscribed");
                Some(id)
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(key, topic, error = %e, "Failed to subscribe");
                #[cfg(not(feature = "tracing"))]
                let _ = (key, &e);
                None
            }
        }
    }

    fn remove_callback(&self, key: &str, id: CallbackId) {
        // Never hold the client lock and an entry guard at the same time.
        let client = self.client();

        let Entry::Occupied(occupied) = self.entries.entry(key.to_owned()) else {
            return;
        };
        let entry = occupied.get();
        if !entry.callbacks.remove(id) || entry.callbacks.len() > 0 {
            return;
        }

        let entry = occupied.remove();
        #[cfg(feature = "tracing")]
        tracing::debug!(key, topic = %entry.topic, "Last callback removed, dropping subscription");

        if let Some(handle) = entry.handle
            && let Some(client) = client
        {
            close(&client, &handle);
        }
    }
}

fn close(client: &Arc<dyn Session>, handle: &SubscriptionId) {
    if let Err(e) = client.unsubscribe(handle) {
        #[cfg(feature = "tracing")]
        tracing::debug!(subscription = %handle, error = %e, "Failed to unsubscribe");
        #[cfg(not(feature = "tracing"))]
        let _ = &e;
    }
}

/// Removes one callback registered through [`SubscriptionManager::subscribe`].
///
/// Dropping it without calling [`unsubscribe`](Self::unsubscribe) leaves the callback
/// registered.
#[must_use = "dropping an Unsubscribe leaves the callback registered"]
pub struct Unsubscribe {
    target: Option<Target>,
}

struct Target {
    inner: Weak<Inner>,
    key: String,
    id: CallbackId,
}

impl Unsubscribe {
    fn noop() -> Self {
        Self { target: None }
    }

    /// Whether the subscribe call that produced this handle registered nothing.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.target.is_none()
    }

    /// Remove the callback; when it was the last one for its key, the wire
    /// subscription is closed and the entry deleted.
    pub fn unsubscribe(self) {
        if let Some(target) = self.target
            && let Some(inner) = target.inner.upgrade()
        {
            inner.remove_callback(&target.key, target.id);
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => f
                .debug_struct("Unsubscribe")
                .field("key", &target.key)
                .field("id", &target.id)
                .finish(),
            None => f.write_str("Unsubscribe(noop)"),
        }
    }
}

/// Unsubscribes when the owning stream is dropped.
struct UnsubscribeOnDrop(Option<Unsubscribe>);

impl Drop for UnsubscribeOnDrop {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.0.take() {
            unsubscribe.unsubscribe();
        }
    }
}

/// Multiplexes logical subscribers onto one wire subscription per key.
///
/// Each key owns one entry: a topic, a parser and a set of callbacks. The first
/// subscriber for a key opens the wire subscription; later subscribers only join the
/// callback set. When the set empties, the wire subscription is closed. Entries outlive
/// the session they were opened on, so [`resubscribe_all`](Self::resubscribe_all) can
/// restore them after a reconnect.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SubscriptionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::with_handler(MessageHandler::new())
    }

    #[must_use]
    pub fn with_handler(handler: MessageHandler) -> Self {
        Self {
            inner: Arc::new(Inner {
                client: RwLock::new(None),
                entries: DashMap::new(),
                handler,
                next_callback_id: AtomicU64::new(0),
            }),
        }
    }

    /// Bind the live session, or `None` when it is gone. Binding a different session
    /// than before invalidates every live handle; callbacks are kept.
    pub fn bind_client(&self, session: Option<Arc<dyn Session>>) {
        let changed = {
            let mut client = self
                .inner
                .client
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let changed = match (client.as_ref(), session.as_ref()) {
                (Some(current), Some(next)) => !Arc::ptr_eq(current, next),
                (None, None) => false,
                _ => true,
            };
            *client = session;
            changed
        };

        if changed {
            for mut entry in self.inner.entries.iter_mut() {
                entry.handle = None;
            }
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.client().is_some()
    }

    /// Register `callback` for JSON payloads of type `T` published to `topic`.
    ///
    /// Returns a no-op handle, registering nothing, when no session is bound or `key`
    /// is already in use with a different payload type.
    pub fn subscribe<T, F>(&self, key: &str, topic: &str, callback: F) -> Unsubscribe
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe_with_parser(key, topic, callback, json_parser())
    }

    /// Like [`subscribe`](Self::subscribe) with a custom parser. The topic and parser are
    /// bound when the entry is created; later calls for the same key only add callbacks.
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
        let Some(client) = self.inner.client() else {
            #[cfg(feature = "tracing")]
            tracing::warn!(key, topic, "Not connected, ignoring subscribe");
            return Unsubscribe::noop();
        };

        let id = CallbackId::new(self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed));
        let callback: Callback<T> = Arc::new(callback);

        match self.inner.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let Ok(typed) = Arc::clone(&entry.callbacks)
                    .into_any()
                    .downcast::<TypedCallbacks<T>>()
                else {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(key, topic, "Key already subscribed with a different payload type");
                    return Unsubscribe::noop();
                };

                typed.set.insert(id, callback);
                if entry.handle.is_none() {
                    entry.handle = self.inner.open(&client, key, &entry.topic, &*typed);
                }
            }
            Entry::Vacant(vacant) => {
                let typed = Arc::new(TypedCallbacks {
                    set: Arc::new(CallbackSet::new()),
                    parser,
                });
                typed.set.insert(id, callback);
                let handle = self.inner.open(&client, key, topic, &*typed);

                vacant.insert(SubscriptionEntry {
                    topic: topic.to_owned(),
                    handle,
                    callbacks: typed,
                });
            }
        }

        Unsubscribe {
            target: Some(Target {
                inner: Arc::downgrade(&self.inner),
                key: key.to_owned(),
                id,
            }),
        }
    }

    /// Deliver payloads for `key` as a stream. Dropping the stream unsubscribes.
    ///
    /// The stream ends immediately when nothing could be registered, and when the
    /// entry is torn down.
    pub fn subscribe_stream<T>(&self, key: &str, topic: &str) -> impl Stream<Item = T> + Send + use<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.subscribe_stream_with_parser(key, topic, json_parser())
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
        let (tx, mut rx) = mpsc::unbounded_channel();
        let unsubscribe = self.subscribe_with_parser(
            key,
            topic,
            move |value: &T| {
                _ = tx.send(value.clone());
            },
            parser,
        );
        let guard = UnsubscribeOnDrop(Some(unsubscribe));

        stream! {
            let _guard = guard;
            while let Some(value) = rx.recv().await {
                yield value;
            }
        }
    }

    /// Send `body` to `destination` through the bound session.
    pub fn publish(&self, destination: &str, body: &str) -> Result<()> {
        if destination.trim().is_empty() {
            return Err(Error::validation("destination must not be empty"));
        }
        let client = self.inner.client().ok_or(WsError::NotConnected)?;
        client.publish(destination, body)
    }

    pub fn publish_json<T: Serialize>(&self, destination: &str, payload: &T) -> Result<()> {
        let body = serde_json::to_string(payload)?;
        self.publish(destination, &body)
    }

    /// Re-open the wire subscription of every entry that has callbacks but no live
    /// handle. Entries that already have one are left alone.
    pub fn resubscribe_all(&self) {
        let Some(client) = self.inner.client() else {
            #[cfg(feature = "tracing")]
            tracing::debug!("Not connected, skipping resubscribe");
            return;
        };

        let mut restored = 0_usize;
        for mut item in self.inner.entries.iter_mut() {
            let (key, entry) = item.pair_mut();
            if entry.handle.is_some() || entry.callbacks.len() == 0 {
                continue;
            }
            entry.handle = self
                .inner
                .open(&client, key, &entry.topic, &*entry.callbacks);
            if entry.handle.is_some() {
                restored += 1;
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(restored, "Resubscribed entries");
        #[cfg(not(feature = "tracing"))]
        let _ = restored;
    }

    /// Close every live wire subscription and forget all entries.
    pub fn teardown_all(&self) {
        let client = self.inner.client();

        self.inner.entries.retain(|_, entry| {
            if let Some(handle) = entry.handle.take()
                && let Some(client) = &client
            {
                close(client, &handle);
            }
            false
        });
    }

    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        self.inner
            .entries
            .iter()
            .fold(SubscriptionStats::default(), |mut stats, entry| {
                stats.total_entries += 1;
                stats.total_callbacks += entry.callbacks.len();
                if entry.handle.is_some() {
                    stats.entries_with_live_handle += 1;
                }
                stats
            })
    }
}
