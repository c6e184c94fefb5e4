//! STOMP 1.2 frame model and codec.
//!
//! Frames are `COMMAND\n(header:value\n)*\n<body>\0`. Bodies carrying a
//! `content-length` header may contain NUL bytes; otherwise the body runs to
//! the first NUL. Bare EOLs between frames are heart-beats and are skipped.

use std::borrow::Cow;
use std::time::Duration;

use crate::Result;
use crate::ws::error::WsError;

pub(crate) const ACCEPT_VERSION: &str = "1.2,1.1,1.0";

/// STOMP frame command.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// Parse a command line, returning `None` for anything STOMP does not define.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let command = match line {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            _ => return None,
        };
        Some(command)
    }

    // CONNECT and CONNECTED headers are never escaped, for 1.0 compatibility.
    const fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

/// One STOMP frame.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Headers in wire order. Repeated headers are kept; [`Frame::get`] returns the first.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    #[must_use]
    pub fn with_body<B: Into<Vec<u8>>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// `CONNECT` frame carrying bearer authentication and the client heart-beat offer.
    #[must_use]
    pub fn connect(
        host: &str,
        login: &str,
        token: &str,
        outgoing: Duration,
        incoming: Duration,
    ) -> Self {
        Self::new(Command::Connect)
            .with_header("accept-version", ACCEPT_VERSION)
            .with_header("host", host)
            .with_header("login", login)
            .with_header("Authorization", &format!("Bearer {token}"))
            .with_header(
                "heart-beat",
                &format!("{},{}", outgoing.as_millis(), incoming.as_millis()),
            )
    }

    #[must_use]
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    #[must_use]
    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).with_header("id", id)
    }

    #[must_use]
    pub fn send(destination: &str, body: &str) -> Self {
        Self::new(Command::Send)
            .with_header("destination", destination)
            .with_header("content-type", "application/json")
            .with_body(body)
    }

    #[must_use]
    pub fn disconnect() -> Self {
        Self::new(Command::Disconnect)
    }

    /// Serialize to wire bytes, terminated by NUL.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let escape = self.command.escapes_headers();
        let mut out = Vec::with_capacity(64 + self.body.len());

        out.extend_from_slice(self.command.to_string().as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            if escape {
                out.extend_from_slice(escape_header(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape_header(value).as_bytes());
            } else {
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    /// Serialize for text-only transports such as SockJS.
    #[must_use]
    pub fn encode_text(&self) -> String {
        String::from_utf8_lossy(&self.encode()).into_owned()
    }
}

fn escape_header(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['\\', '\n', '\r', ':']) {
        return Cow::Borrowed(raw);
    }

    let mut escaped = String::with_capacity(raw.len() + 4);
    for c in raw.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            ':' => escaped.push_str("\\c"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}

fn unescape_header(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(WsError::InvalidFrame(format!(
                    "undefined escape sequence \\{}",
                    other.map(String::from).unwrap_or_default()
                ))
                .into());
            }
        }
    }
    Ok(out)
}

/// Largest frame, headers and body included, that a [`Decoder`] will buffer.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Incremental frame decoder buffering partial input across chunks.
#[derive(Debug)]
pub struct Decoder {
    buffer: Vec<u8>,
    max_frame_bytes: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::with_max_frame_bytes(MAX_FRAME_BYTES)
    }
}

impl Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_bytes,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Discard input up to and including the next NUL, or everything if there is none.
    ///
    /// Used after a decoding error so the frames that follow the bad one still decode.
    pub fn skip_frame(&mut self) {
        match self.buffer.iter().position(|b| *b == 0) {
            Some(end) => {
                self.buffer.drain(..=end);
            }
            None => self.buffer.clear(),
        }
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete frame, or `None` if more input is needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.skip_heartbeats();
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let mut lines = Vec::new();
        let mut pos = 0;
        let body_start = loop {
            let Some(offset) = self.buffer[pos..].iter().position(|b| *b == b'\n') else {
                return self.incomplete();
            };
            let end = pos + offset;
            let line = self.buffer[pos..end]
                .strip_suffix(b"\r")
                .unwrap_or(&self.buffer[pos..end]);
            if line.is_empty() {
                break end + 1;
            }
            lines.push(
                std::str::from_utf8(line)
                    .map_err(|e| WsError::InvalidFrame(format!("header is not UTF-8: {e}")))?
                    .to_owned(),
            );
            pos = end + 1;
        };

        let mut lines = lines.into_iter();
        let command_line = lines.next().unwrap_or_default();
        let command = Command::parse(&command_line)
            .ok_or_else(|| WsError::InvalidFrame(format!("unknown command {command_line:?}")))?;

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| WsError::InvalidFrame(format!("malformed header {line:?}")))?;
            if command.escapes_headers() {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_owned(), value.to_owned()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .map(|(_, value)| {
                value.trim().parse::<usize>().map_err(|e| {
                    WsError::InvalidFrame(format!("invalid content-length {value:?}: {e}"))
                })
            })
            .transpose()?;

        let body_end = match content_length {
            Some(len) => {
                let end = body_start
                    .checked_add(len)
                    .filter(|end| *end < self.max_frame_bytes)
                    .ok_or_else(|| {
                        WsError::InvalidFrame(format!(
                            "content-length {len} exceeds the {} byte frame limit",
                            self.max_frame_bytes
                        ))
                    })?;
                if self.buffer.len() <= end {
                    return Ok(None);
                }
                if self.buffer[end] != 0 {
                    return Err(WsError::InvalidFrame(
                        "body is not NUL-terminated after content-length bytes".to_owned(),
                    )
                    .into());
                }
                end
            }
            None => match self.buffer[body_start..].iter().position(|b| *b == 0) {
                Some(offset) => body_start + offset,
                None => return self.incomplete(),
            },
        };

        let body = self.buffer[body_start..body_end].to_vec();
        self.buffer.drain(..=body_end);

        Ok(Some(Frame {
            command,
            headers,
            body,
        }))
    }

    fn incomplete(&self) -> Result<Option<Frame>> {
        if self.buffer.len() > self.max_frame_bytes {
            return Err(WsError::InvalidFrame(format!(
                "no frame terminator within {} bytes",
                self.max_frame_bytes
            ))
            .into());
        }
        Ok(None)
    }

    fn skip_heartbeats(&mut self) {
        let skip = self
            .buffer
            .iter()
            .position(|b| *b != b'\n' && *b != b'\r')
            .unwrap_or(self.buffer.len());
        self.buffer.drain(..skip);
    }
}

/// Decode every complete frame in `bytes`.
pub fn decode_all(bytes: &[u8]) -> Result<Vec<Frame>> {
    let mut decoder = Decoder::new();
    decoder.push(bytes);

    let mut frames = Vec::new();
    while let Some(frame) = decoder.next_frame()? {
        frames.push(frame);
    }
    Ok(frames)
}
