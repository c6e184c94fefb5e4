//! Frame parsing and fault-isolated fan-out to subscriber callbacks.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;

use crate::Result;
use crate::error::Error;
use crate::ws::{Frame, FrameHandler, WsError};

/// Turns a frame body into a typed payload.
pub type Parser<T> = Arc<dyn Fn(&[u8]) -> Result<T> + Send + Sync>;

/// Subscriber callback.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// The default parser: JSON decoding of the frame body.
#[must_use]
pub fn json_parser<T: DeserializeOwned>() -> Parser<T> {
    Arc::new(|body: &[u8]| -> Result<T> { Ok(serde_json::from_slice(body)?) })
}

/// Parser argument of [`MessageHandler::parse`].
///
/// An explicit `&Parser<T>` works for any payload type. An `Option<&Parser<T>>` falls
/// back to JSON when `None`, which needs `T: DeserializeOwned`.
pub trait ParserSource<T> {
    fn run(self, body: &[u8]) -> Result<T>;
}

impl<T> ParserSource<T> for &Parser<T> {
    fn run(self, body: &[u8]) -> Result<T> {
        self(body)
    }
}

impl<T: DeserializeOwned> ParserSource<T> for Option<&Parser<T>> {
    fn run(self, body: &[u8]) -> Result<T> {
        match self {
            Some(parser) => parser(body),
            None => Ok(serde_json::from_slice(body)?),
        }
    }
}

/// Outcome of parsing one frame.
#[non_exhaustive]
#[derive(Debug)]
pub enum ParsedMessage<T> {
    Success(T),
    Failure(Error),
}

impl<T> ParsedMessage<T> {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(e) => Err(e),
        }
    }
}

/// Identifies one callback within a [`CallbackSet`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl CallbackId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb-{}", self.0)
    }
}

/// Callbacks sharing one wire subscription, in registration order.
pub struct CallbackSet<T> {
    callbacks: RwLock<Vec<(CallbackId, Callback<T>)>>,
}

impl<T> Default for CallbackSet<T> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
        }
    }
}

impl<T> fmt::Debug for CallbackSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSet")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> CallbackSet<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: CallbackId, callback: Callback<T>) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));
    }

    /// Returns whether `id` was present.
    pub fn remove(&self, id: CallbackId) -> bool {
        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current callbacks, so dispatch runs without holding the lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(CallbackId, Callback<T>)> {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Parses inbound frames and fans them out to callbacks.
///
/// Neither a malformed frame nor a panicking callback reaches the transport's reader
/// task: parse failures are returned as [`ParsedMessage::Failure`] and callback panics
/// are caught and logged. In strict mode a parse failure panics instead, which is meant
/// for tests that must notice every malformed frame.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageHandler {
    throw_on_error: bool,
}

impl MessageHandler {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            throw_on_error: false,
        }
    }

    #[must_use]
    pub const fn strict() -> Self {
        Self {
            throw_on_error: true,
        }
    }

    #[must_use]
    pub const fn is_strict(&self) -> bool {
        self.throw_on_error
    }

    /// Parse `frame` with `parser`, or as JSON when `None` is given.
    ///
    /// A panicking parser is reported as a [`ParsedMessage::Failure`].
    #[must_use]
    pub fn parse<T, P: ParserSource<T>>(&self, frame: &Frame, parser: P) -> ParsedMessage<T> {
        let result = catch_unwind(AssertUnwindSafe(|| parser.run(&frame.body))).unwrap_or_else(
            |_panic| Err(WsError::InvalidFrame("parser panicked".to_owned()).into()),
        );
        self.settle(result)
    }

    #[must_use]
    pub fn parse_with<T>(&self, frame: &Frame, parser: &Parser<T>) -> ParsedMessage<T> {
        self.parse(frame, parser)
    }

    fn settle<T>(&self, result: Result<T>) -> ParsedMessage<T> {
        match result {
            Ok(value) => ParsedMessage::Success(value),
            Err(e) if self.throw_on_error => panic!("Failed to parse frame: {e}"),
            Err(e) => ParsedMessage::Failure(e),
        }
    }

    /// Invoke every callback with `value`. Returns how many callbacks panicked.
    pub fn dispatch<T>(&self, callbacks: &CallbackSet<T>, value: &T, context: &str) -> usize {
        let mut failures = 0;
        for (id, callback) in callbacks.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                failures += 1;

                #[cfg(feature = "tracing")]
                tracing::error!(context, callback = %id, "Subscriber callback panicked");
                #[cfg(not(feature = "tracing"))]
                let _ = (&id, context);
            }
        }
        failures
    }

    /// Compose parse and dispatch into the handler installed on a wire subscription.
    ///
    /// Frames that fail to parse are logged and dropped.
    #[must_use]
    pub fn frame_handler<T>(
        &self,
        callbacks: Arc<CallbackSet<T>>,
        parser: Option<Parser<T>>,
        context: Option<&str>,
    ) -> FrameHandler
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let parser = parser.unwrap_or_else(json_parser);
        self.frame_handler_with(callbacks, parser, context.unwrap_or("subscription"))
    }

    /// Like [`frame_handler`](Self::frame_handler) with an explicit parser.
    #[must_use]
    pub fn frame_handler_with<T>(
        &self,
        callbacks: Arc<CallbackSet<T>>,
        parser: Parser<T>,
        context: &str,
    ) -> FrameHandler
    where
        T: Send + Sync + 'static,
    {
        let handler = *self;
        let context = context.to_owned();

        Arc::new(move |frame: &Frame| match handler.parse_with(frame, &parser) {
            ParsedMessage::Success(value) => {
                handler.dispatch(&callbacks, &value, &context);
            }
            ParsedMessage::Failure(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    context = %context,
                    destination = frame.get("destination").unwrap_or_default(),
                    error = %e,
                    "Dropping frame that failed to parse"
                );
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        })
    }
}
