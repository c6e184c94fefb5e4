//! SockJS client side: URL layout, frame codec and the two supported transports.
//!
//! A SockJS endpoint is addressed as `{base}/{server}/{session}/{transport}`. The
//! native `websocket` transport is preferred; `xhr_streaming` (chunked POST for
//! reads, `xhr_send` POSTs for writes) is the polling-style fallback.

use futures::{SinkExt as _, StreamExt as _};
use rand::Rng as _;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::error::WsError;
use super::frame::MAX_FRAME_BYTES;
use super::traits::TransportKind;
use crate::Result;

/// Response of `GET {base}/info`.
#[non_exhaustive]
#[derive(Debug, Clone, Deserialize)]
pub struct Info {
    /// Whether the server accepts the native `websocket` transport
    #[serde(default = "default_true")]
    pub websocket: bool,
    #[serde(default)]
    pub cookie_needed: bool,
    #[serde(default)]
    pub origins: Vec<String>,
    #[serde(default)]
    pub entropy: u64,
}

const fn default_true() -> bool {
    true
}

/// One SockJS framing unit.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockJsFrame {
    /// `o`: the session is open
    Open,
    /// `h`: server heart-beat
    Heartbeat,
    /// `a[...]` or `m"..."`: application messages
    Messages(Vec<String>),
    /// `c[code,"reason"]`: the server closed the session
    Close { code: u16, reason: String },
}

/// Decode one SockJS frame.
pub fn decode_frame(text: &str) -> Result<SockJsFrame> {
    let mut chars = text.chars();
    let first = chars.next();
    let rest = chars.as_str();

    let frame = match first {
        Some('o') => SockJsFrame::Open,
        // The xhr-streaming prelude is a long run of `h`.
        Some('h') if rest.bytes().all(|b| b == b'h') => SockJsFrame::Heartbeat,
        Some('a') => {
            let messages: Vec<String> =
                serde_json::from_str(rest).map_err(WsError::MessageParse)?;
            SockJsFrame::Messages(messages)
        }
        Some('m') => {
            let message: String = serde_json::from_str(rest).map_err(WsError::MessageParse)?;
            SockJsFrame::Messages(vec![message])
        }
        Some('c') => {
            let (code, reason): (u16, String) =
                serde_json::from_str(rest).map_err(WsError::MessageParse)?;
            SockJsFrame::Close { code, reason }
        }
        _ => return Err(WsError::InvalidFrame(format!("unknown SockJS frame {text:?}")).into()),
    };
    Ok(frame)
}

/// Encode outgoing messages as the JSON string array SockJS expects.
pub fn encode_messages(messages: &[String]) -> Result<String> {
    Ok(serde_json::to_string(messages)?)
}

/// Translate a `ws(s)://` server URL into the `http(s)://` base SockJS works from.
pub fn http_base(server_url: &str) -> Result<Url> {
    let mut url = Url::parse(server_url)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        _ => return Err(WsError::InvalidUrl(server_url.to_owned()).into()),
    };
    url.set_scheme(scheme)
        .map_err(|()| WsError::InvalidUrl(server_url.to_owned()))?;
    Ok(url)
}

/// `{base}/{server}/{session}` with a random server id and session id.
pub fn session_prefix(base: &Url) -> Result<Url> {
    let server = format!("{:03}", rand::rng().random_range(0..1000_u16));
    let session = uuid::Uuid::new_v4().simple().to_string();

    let mut url = base.clone();
    url.set_query(None);
    url.path_segments_mut()
        .map_err(|()| WsError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend([server.as_str(), session.as_str()]);
    Ok(url)
}

fn transport_url(prefix: &Url, transport: &str) -> Result<Url> {
    let mut url = prefix.clone();
    url.path_segments_mut()
        .map_err(|()| WsError::InvalidUrl(prefix.to_string()))?
        .pop_if_empty()
        .push(transport);
    Ok(url)
}

fn websocket_url(prefix: &Url) -> Result<Url> {
    let mut url = transport_url(prefix, "websocket")?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|()| WsError::InvalidUrl(prefix.to_string()))?;
    Ok(url)
}

/// Fetch `{base}/info`.
pub async fn fetch_info(http: &reqwest::Client, base: &Url) -> Result<Info> {
    let url = transport_url(base, "info")?;
    let info = http
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(WsError::Http)?
        .json::<Info>()
        .await
        .map_err(WsError::Http)?;
    Ok(info)
}

/// Event produced by a SockJS channel.
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(String),
    Heartbeat,
    Closed(WsError),
}

/// An open SockJS session over one negotiated transport.
#[derive(Debug)]
pub(crate) struct Channel {
    pub(crate) kind: TransportKind,
    pub(crate) outgoing: mpsc::UnboundedSender<String>,
    pub(crate) incoming: mpsc::UnboundedReceiver<Inbound>,
    pub(crate) cancel: CancellationToken,
}

/// Open the native WebSocket transport and wait for the SockJS open frame.
pub(crate) async fn open_websocket(prefix: &Url) -> Result<Channel> {
    let url = websocket_url(prefix)?;
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    let (mut write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match decode_frame(text.as_str())? {
                SockJsFrame::Open => break,
                SockJsFrame::Close { code, reason } => {
                    return Err(WsError::ConnectionClosed {
                        code: Some(code),
                        reason,
                    }
                    .into());
                }
                _ => {}
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(WsError::closed_without_reason().into());
            }
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(_)) => {}
        }
    }

    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
    let (incoming_tx, incoming) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        let reason = loop {
            tokio::select! {
                () = token.cancelled() => {
                    // Flush what the session queued before closing, e.g. DISCONNECT.
                    while let Ok(text) = outgoing_rx.try_recv() {
                        if let Ok(payload) = encode_messages(&[text]) {
                            _ = write.send(Message::Text(payload.into())).await;
                        }
                    }
                    _ = write.close().await;
                    break None;
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match decode_frame(text.as_str()) {
                            Ok(SockJsFrame::Messages(messages)) => {
                                for message in messages {
                                    _ = incoming_tx.send(Inbound::Message(message));
                                }
                            }
                            Ok(SockJsFrame::Heartbeat) => {
                                _ = incoming_tx.send(Inbound::Heartbeat);
                            }
                            Ok(SockJsFrame::Close { code, reason }) => {
                                break Some(WsError::ConnectionClosed { code: Some(code), reason });
                            }
                            Ok(SockJsFrame::Open) => {}
                            Err(e) => {
                                #[cfg(feature = "tracing")]
                                tracing::warn!(text = %text.as_str(), error = %e, "Dropping undecodable SockJS frame");
                                #[cfg(not(feature = "tracing"))]
                                let _ = &e;
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break Some(WsError::ConnectionClosed {
                            code: frame.as_ref().map(|f| u16::from(f.code)),
                            reason: frame.map(|f| f.reason.as_str().to_owned()).unwrap_or_default(),
                        });
                    }
                    Some(Err(e)) => break Some(WsError::Connection(e)),
                    None => break Some(WsError::closed_without_reason()),
                    Some(Ok(_)) => {
                        // Binary, ping and pong frames carry no SockJS payload.
                    }
                },
                Some(text) = outgoing_rx.recv() => {
                    match encode_messages(&[text]) {
                        Ok(payload) => {
                            if let Err(e) = write.send(Message::Text(payload.into())).await {
                                break Some(WsError::Connection(e));
                            }
                        }
                        Err(e) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(error = %e, "Failed to encode outgoing SockJS message");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &e;
                        }
                    }
                }
            }
        };

        if let Some(reason) = reason {
            _ = incoming_tx.send(Inbound::Closed(reason));
        }
    });

    Ok(Channel {
        kind: TransportKind::WebSocket,
        outgoing,
        incoming,
        cancel,
    })
}

/// Open the `xhr_streaming` fallback and wait for the SockJS open frame.
pub(crate) async fn open_xhr_streaming(http: &reqwest::Client, prefix: &Url) -> Result<Channel> {
    let response = http
        .post(transport_url(prefix, "xhr_streaming")?)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(WsError::Http)?;
    let mut body = Box::pin(response.bytes_stream());
    let mut lines = LineBuffer::default();

    'open: loop {
        let Some(chunk) = body.next().await else {
            return Err(WsError::closed_without_reason().into());
        };
        lines.push(&chunk.map_err(WsError::Http)?);
        while let Some(line) = lines.next_line()? {
            match decode_frame(&line)? {
                SockJsFrame::Open => break 'open,
                SockJsFrame::Close { code, reason } => {
                    return Err(WsError::ConnectionClosed {
                        code: Some(code),
                        reason,
                    }
                    .into());
                }
                _ => {}
            }
        }
    }

    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
    let (incoming_tx, incoming) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let reader_token = cancel.clone();
    let reader_tx = incoming_tx.clone();
    tokio::spawn(async move {
        let reason = 'read: loop {
            // Lines already buffered alongside the open frame come first.
            loop {
                let line = match lines.next_line() {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => break 'read Some(e),
                };
                match decode_frame(&line) {
                    Ok(SockJsFrame::Messages(messages)) => {
                        for message in messages {
                            _ = reader_tx.send(Inbound::Message(message));
                        }
                    }
                    Ok(SockJsFrame::Heartbeat) => {
                        _ = reader_tx.send(Inbound::Heartbeat);
                    }
                    Ok(SockJsFrame::Close { code, reason }) => {
                        break 'read Some(WsError::ConnectionClosed {
                            code: Some(code),
                            reason,
                        });
                    }
                    Ok(SockJsFrame::Open) => {}
                    Err(e) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(%line, error = %e, "Dropping undecodable SockJS frame");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                    }
                }
            }

            tokio::select! {
                () = reader_token.cancelled() => break None,
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => lines.push(&bytes),
                    Some(Err(e)) => break Some(WsError::Http(e)),
                    None => break Some(WsError::closed_without_reason()),
                },
            }
        };

        if let Some(reason) = reason {
            _ = reader_tx.send(Inbound::Closed(reason));
        }
    });

    let writer_token = cancel.clone();
    let http = http.clone();
    let send_url = transport_url(prefix, "xhr_send")?;
    tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                () = writer_token.cancelled() => {
                    // Flush what the session queued before closing, e.g. DISCONNECT.
                    while let Ok(text) = outgoing_rx.try_recv() {
                        _ = post_messages(&http, &send_url, &[text]).await;
                    }
                    break;
                }
                text = outgoing_rx.recv() => match text {
                    Some(text) => text,
                    None => break,
                },
            };

            if let Err(e) = post_messages(&http, &send_url, &[text]).await {
                _ = incoming_tx.send(Inbound::Closed(e));
                break;
            }
        }
    });

    Ok(Channel {
        kind: TransportKind::XhrStreaming,
        outgoing,
        incoming,
        cancel,
    })
}

async fn post_messages(
    http: &reqwest::Client,
    url: &Url,
    messages: &[String],
) -> std::result::Result<(), WsError> {
    let payload = serde_json::to_string(messages).map_err(WsError::MessageParse)?;
    http.post(url.clone())
        .header(reqwest::header::CONTENT_TYPE, "text/plain;charset=UTF-8")
        .body(payload)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(WsError::Http)?;
    Ok(())
}

/// Longest xhr-streaming line accepted; JSON escaping can double a STOMP frame.
const MAX_LINE_BYTES: usize = 2 * MAX_FRAME_BYTES;

/// Splits a chunked byte stream into `\n`-terminated lines.
#[derive(Debug)]
struct LineBuffer {
    buffer: Vec<u8>,
    max_line_bytes: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_max_line_bytes(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_bytes,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next non-empty line, `None` if more input is needed.
    fn next_line(&mut self) -> std::result::Result<Option<String>, WsError> {
        loop {
            let Some(end) = self.buffer.iter().position(|b| *b == b'\n') else {
                if self.buffer.len() > self.max_line_bytes {
                    return Err(WsError::InvalidFrame(format!(
                        "no line terminator within {} bytes",
                        self.max_line_bytes
                    )));
                }
                return Ok(None);
            };
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line[..end]).trim_end().to_owned();
            if !line.is_empty() {
                return Ok(Some(line));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_open_and_heartbeat() {
        assert_eq!(decode_frame("o").unwrap(), SockJsFrame::Open);
        assert_eq!(decode_frame("h").unwrap(), SockJsFrame::Heartbeat);
        assert_eq!(
            decode_frame(&"h".repeat(2048)).unwrap(),
            SockJsFrame::Heartbeat
        );
    }

    #[test]
    fn decode_message_array() {
        let frame = decode_frame(r#"a["MESSAGE\nsubscription:sub-0\n\n{}\u0000","\n"]"#).unwrap();

        assert_eq!(
            frame,
            SockJsFrame::Messages(vec![
                "MESSAGE\nsubscription:sub-0\n\n{}\0".to_owned(),
                "\n".to_owned()
            ])
        );
    }

    #[test]
    fn decode_single_message() {
        assert_eq!(
            decode_frame(r#"m"hello""#).unwrap(),
            SockJsFrame::Messages(vec!["hello".to_owned()])
        );
    }

    #[test]
    fn decode_close() {
        assert_eq!(
            decode_frame(r#"c[3000,"Go away!"]"#).unwrap(),
            SockJsFrame::Close {
                code: 3000,
                reason: "Go away!".to_owned()
            }
        );
    }

    #[test]
    fn decode_rejects_unknown_frame() {
        decode_frame("x[]").unwrap_err();
        decode_frame("").unwrap_err();
        decode_frame("a[not json").unwrap_err();
    }

    #[test]
    fn encode_wraps_messages_in_array() {
        let payload = encode_messages(&["SEND\n\n\0".to_owned()]).unwrap();

        assert_eq!(payload, r#"["SEND\n\n\u0000"]"#);
    }

    #[test]
    fn http_base_translates_schemes() {
        assert_eq!(
            http_base("ws://chat.example:8080/ws").unwrap().as_str(),
            "http://chat.example:8080/ws"
        );
        assert_eq!(
            http_base("wss://chat.example/ws").unwrap().as_str(),
            "https://chat.example/ws"
        );
        assert_eq!(
            http_base("https://chat.example/ws").unwrap().as_str(),
            "https://chat.example/ws"
        );
    }

    #[test]
    fn http_base_rejects_other_schemes() {
        let error = http_base("ftp://chat.example/ws").unwrap_err();

        assert_eq!(error.kind(), crate::error::Kind::Validation);
    }

    #[test]
    fn session_urls_follow_sockjs_layout() {
        let base = http_base("wss://chat.example/ws").unwrap();
        let prefix = session_prefix(&base).unwrap();
        let segments: Vec<&str> = prefix.path_segments().unwrap().collect();

        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], "ws");
        assert_eq!(segments[1].len(), 3);
        assert!(segments[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(segments[2].len(), 32);

        let ws = websocket_url(&prefix).unwrap();
        assert_eq!(ws.scheme(), "wss");
        assert!(ws.path().ends_with("/websocket"));
    }

    #[test]
    fn session_prefix_handles_trailing_slash() {
        let base = http_base("ws://chat.example/ws/").unwrap();
        let prefix = session_prefix(&base).unwrap();

        assert_eq!(prefix.path_segments().unwrap().count(), 3);
    }

    #[test]
    fn line_buffer_splits_across_chunks() {
        let mut lines = LineBuffer::default();
        lines.push(b"hhhh\no\na[\"x");
        assert_eq!(lines.next_line().unwrap().as_deref(), Some("hhhh"));
        assert_eq!(lines.next_line().unwrap().as_deref(), Some("o"));
        assert_eq!(lines.next_line().unwrap(), None);

        lines.push(b"\"]\n");
        assert_eq!(lines.next_line().unwrap().as_deref(), Some(r#"a["x"]"#));
    }

    #[test]
    fn line_buffer_rejects_unterminated_line_over_limit() {
        let mut lines = LineBuffer::with_max_line_bytes(16);
        lines.push(b"a[\"0123456789");
        assert_eq!(lines.next_line().unwrap(), None);

        lines.push(b"0123456789");
        let error = lines.next_line().unwrap_err();

        assert!(matches!(error, WsError::InvalidFrame(_)), "{error:?}");
    }

    #[test]
    fn info_defaults_missing_fields() {
        let info: Info = serde_json::from_str(r#"{"entropy":42}"#).unwrap();

        assert!(info.websocket);
        assert_eq!(info.entropy, 42);
    }
}
