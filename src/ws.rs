//! STOMP frames over a `tokio-tungstenite` WebSocket.
//!
//! [`connect`] performs the HTTP upgrade (bearer token in the
//! `Authorization` header) and splits the socket into a [`FrameWriter`] and
//! a [`FrameReader`] so both can sit in one `tokio::select!`. The reader
//! decodes text and binary messages into STOMP frames and surfaces pings
//! and close frames; everything else is swallowed.

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::SyncError;
use crate::stomp::{self, Frame};

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// What the reader produced.
#[derive(Debug)]
pub enum Inbound {
    /// One or more frames from a single WebSocket message. May be empty
    /// for a heart-beat.
    Frames(Vec<Frame>),
    /// A message that did not decode as STOMP.
    Undecodable(SyncError),
    /// Ping that must be answered with the same payload.
    Ping(Vec<u8>),
    /// Server closed the socket.
    Closed {
        /// Close code (1005 when none was sent).
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Write half.
#[derive(Debug)]
pub struct FrameWriter {
    sink: SplitSink<Socket, Message>,
}

impl FrameWriter {
    /// Encode and send one frame as a text message.
    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        self.sink
            .send(Message::Text(frame.encode()))
            .await
            .with_context(|| format!("Failed to send {} frame", frame.command))
    }

    /// Answer a ping.
    pub async fn pong(&mut self, payload: Vec<u8>) -> Result<()> {
        self.sink
            .send(Message::Pong(payload))
            .await
            .context("Failed to send pong")
    }

    /// Close the socket.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("Failed to close WebSocket")
    }
}

/// Read half.
#[derive(Debug)]
pub struct FrameReader {
    stream: SplitStream<Socket>,
}

impl FrameReader {
    /// Next inbound item, `None` once the stream has ended.
    ///
    /// Cancel-safe: nothing is lost if the future is dropped before it
    /// resolves.
    pub async fn recv(&mut self) -> Option<Result<Inbound>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            };

            let text = match message {
                Message::Text(text) => text,
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(e) => {
                        return Some(Ok(Inbound::Undecodable(SyncError::Protocol(format!(
                            "binary message is not UTF-8: {e}"
                        )))));
                    }
                },
                Message::Ping(payload) => return Some(Ok(Inbound::Ping(payload))),
                Message::Close(frame) => {
                    let (code, reason) = frame.map_or((1005, String::new()), |cf| {
                        (cf.code.into(), cf.reason.to_string())
                    });
                    return Some(Ok(Inbound::Closed { code, reason }));
                }
                Message::Pong(_) | Message::Frame(_) => continue,
            };

            return Some(Ok(match stomp::decode_all(&text) {
                Ok(frames) => Inbound::Frames(frames),
                Err(e) => Inbound::Undecodable(e),
            }));
        }
    }
}

/// Open a WebSocket to `url`, authenticating with `bearer` when given.
pub async fn connect(url: &str, bearer: Option<&str>) -> Result<(FrameWriter, FrameReader)> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    if let Some(token) = bearer {
        let value = tungstenite::http::HeaderValue::from_str(&format!("Bearer {token}"))
            .context("access token is not a valid header value")?;
        request
            .headers_mut()
            .insert(tungstenite::http::header::AUTHORIZATION, value);
    }

    let (socket, _response) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("WebSocket connect to {url} failed"))?;
    let (sink, stream) = socket.split();

    Ok((FrameWriter { sink }, FrameReader { stream }))
}

/// Map `http(s)://` to `ws(s)://`; other schemes pass through.
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
