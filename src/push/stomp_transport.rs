//! STOMP-over-WebSocket push transport.
//!
//! Each [`PushTransport::open`] spawns one background session task that owns
//! its WebSocket for the lifetime of a single connection attempt:
//!
//! ```text
//!   StompTransport (event loop side)        session task (generation N)
//!         │                                        │
//!         │ open(attempt) ───────── spawn ───────► │ WS connect (Bearer)
//!         │                                        │ CONNECT → CONNECTED
//!         │                                        │ SUBSCRIBE(emoji topic)
//!         │                                        │ SUBSCRIBE(receipt) → RECEIPT
//!         │ ◄──────── TransportEvent::Subscribed ─ │
//!         │ ◄──────── Message / EmojiUpdate ────── │ MESSAGE frames
//!         │ publish() ─── SEND frame ────────────► │
//!         │ close(N) ──── cancel token ──────────► │ DISCONNECT, close
//! ```
//!
//! The session never reconnects on its own: failures are reported once as
//! [`TransportEventKind::Failed`] and the connection manager decides when
//! to open the next attempt. A cancelled session reports nothing.

use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    ConnectAttempt, Generation, PushTransport, TimerKind, TransportEvent, TransportEventKind,
};
use crate::error::SyncError;
use crate::stomp::{Command, Frame};
use crate::ws::{self, Inbound};

/// Sender half of the transport event channel.
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Live session bookkeeping.
#[derive(Debug)]
struct ActiveSession {
    generation: Generation,
    cancel: CancellationToken,
    publish_tx: mpsc::UnboundedSender<Frame>,
}

/// Push transport over STOMP 1.2 on a WebSocket.
///
/// Requires a running tokio runtime; all work happens in spawned tasks.
#[derive(Debug)]
pub struct StompTransport {
    ws_url: String,
    events: TransportEventSender,
    active: Option<ActiveSession>,
}

impl StompTransport {
    /// Create a transport that reports to `events`.
    pub fn new(ws_url: &str, events: TransportEventSender) -> Self {
        Self {
            ws_url: ws::http_to_ws_scheme(ws_url),
            events,
            active: None,
        }
    }

    /// Generation of the live session, if any.
    pub fn active_generation(&self) -> Option<Generation> {
        self.active.as_ref().map(|s| s.generation)
    }
}

impl PushTransport for StompTransport {
    fn open(&mut self, attempt: &ConnectAttempt) {
        if let Some(previous) = self.active.take() {
            previous.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_session(
            self.ws_url.clone(),
            attempt.clone(),
            cancel.clone(),
            publish_rx,
            self.events.clone(),
        ));

        self.active = Some(ActiveSession {
            generation: attempt.generation,
            cancel,
            publish_tx,
        });
    }

    fn close(&mut self, generation: Generation) {
        if self.active_generation() == Some(generation) {
            if let Some(session) = self.active.take() {
                session.cancel.cancel();
            }
        }
    }

    fn publish(&mut self, generation: Generation, destination: &str, body: &str) {
        match &self.active {
            Some(session) if session.generation == generation => {
                let _ = session.publish_tx.send(Frame::send_json(destination, body));
            }
            _ => log::debug!("[Push] No live session for publish to {destination}"),
        }
    }

    fn arm_timer(&mut self, generation: Generation, kind: TimerKind, delay: Duration) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(TransportEvent::new(generation, TransportEventKind::Timer(kind)));
        });
    }
}

impl Drop for StompTransport {
    fn drop(&mut self) {
        if let Some(session) = self.active.take() {
            session.cancel.cancel();
        }
    }
}

/// How a session ended without error.
enum SessionExit {
    /// Torn down by the manager.
    Cancelled,
}

/// Run one attempt and report its failure, unless it was cancelled.
async fn run_session(
    ws_url: String,
    attempt: ConnectAttempt,
    cancel: CancellationToken,
    mut publish_rx: mpsc::UnboundedReceiver<Frame>,
    events: TransportEventSender,
) {
    let generation = attempt.generation;
    let emit = |kind: TransportEventKind| {
        if !cancel.is_cancelled() {
            let _ = events.send(TransportEvent::new(generation, kind));
        }
    };

    match drive_session(&ws_url, &attempt, &cancel, &mut publish_rx, &emit).await {
        Ok(SessionExit::Cancelled) => {
            log::debug!("[Push] Session {} closed", generation);
        }
        Err(e) => {
            log::debug!("[Push] Session {} ended: {:#}", generation, e);
            emit(TransportEventKind::Failed(SyncError::Transport(format!("{e:#}"))));
        }
    }
}

/// Subscription ids used by one session.
#[derive(Debug)]
struct Subscriptions {
    channel: String,
    emoji: Option<String>,
}

impl Subscriptions {
    fn new(generation: Generation, attempt: &ConnectAttempt) -> Self {
        Self {
            channel: format!("sub-{generation}"),
            emoji: attempt
                .emoji_topic
                .as_ref()
                .map(|_| format!("emoji-{generation}")),
        }
    }

    fn ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.channel.as_str()).chain(self.emoji.as_deref())
    }

    /// Event for a `MESSAGE` frame, `None` for a subscription this
    /// session does not own. A frame without a `subscription` header
    /// counts as a channel message.
    fn route(&self, frame: Frame) -> Option<TransportEventKind> {
        let subscription = frame.get("subscription").map(str::to_string);
        match subscription.as_deref() {
            Some(id) if self.emoji.as_deref() == Some(id) => {
                Some(TransportEventKind::EmojiUpdate(frame.body))
            }
            Some(id) if id != self.channel => None,
            _ => Some(TransportEventKind::Message(frame.body)),
        }
    }
}

/// Extract the `host` header value for CONNECT.
fn host_of(ws_url: &str) -> String {
    ws_url
        .parse::<tokio_tungstenite::tungstenite::http::Uri>()
        .ok()
        .and_then(|uri| uri.host().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string())
}

async fn drive_session(
    ws_url: &str,
    attempt: &ConnectAttempt,
    cancel: &CancellationToken,
    publish_rx: &mut mpsc::UnboundedReceiver<Frame>,
    emit: &impl Fn(TransportEventKind),
) -> Result<SessionExit> {
    let generation = attempt.generation;
    let token = attempt.identity.access_token.as_str();

    log::info!("[Push] Session {} connecting to {}", generation, ws_url);
    let (mut writer, mut reader) = tokio::select! {
        () = cancel.cancelled() => return Ok(SessionExit::Cancelled),
        pair = ws::connect(ws_url, Some(token)) => pair?,
    };

    writer.send(&Frame::connect(&host_of(ws_url), token)).await?;

    let subscriptions = Subscriptions::new(generation, attempt);
    let receipt = format!("subscribe-{}", Uuid::new_v4());
    let mut handshake_done = false;

    loop {
        tokio::select! {
            // Queued publishes go out before a pending teardown.
            biased;

            Some(frame) = publish_rx.recv() => {
                writer.send(&frame).await?;
                log::trace!("[Push] Published to {}", frame.get("destination").unwrap_or("?"));
            }

            () = cancel.cancelled() => {
                if handshake_done {
                    for id in subscriptions.ids() {
                        let _ = writer
                            .send(&Frame::new(Command::Unsubscribe).header("id", id))
                            .await;
                    }
                    let _ = writer.send(&Frame::disconnect()).await;
                }
                let _ = writer.close().await;
                return Ok(SessionExit::Cancelled);
            }

            inbound = reader.recv() => {
                let frames = match inbound {
                    Some(Ok(Inbound::Frames(frames))) => frames,
                    Some(Ok(Inbound::Undecodable(e))) => {
                        log::warn!("[Push] Dropping undecodable message: {e}");
                        continue;
                    }
                    Some(Ok(Inbound::Ping(payload))) => {
                        let _ = writer.pong(payload).await;
                        continue;
                    }
                    Some(Ok(Inbound::Closed { code, reason })) => {
                        bail!("connection closed by server ({code}: {reason})");
                    }
                    Some(Err(e)) => return Err(e),
                    None => bail!("WebSocket stream ended"),
                };

                for frame in frames {
                    match frame.command {
                        Command::Connected => {
                            handshake_done = true;
                            // The receipt is requested last, so it covers both subscriptions.
                            if let (Some(id), Some(topic)) =
                                (&subscriptions.emoji, &attempt.emoji_topic)
                            {
                                writer.send(&Frame::subscribe(id, topic)).await?;
                            }
                            writer
                                .send(
                                    &Frame::subscribe(&subscriptions.channel, &attempt.channel)
                                        .header("receipt", &receipt),
                                )
                                .await?;
                            log::debug!(
                                "[Push] Session {} sent SUBSCRIBE {}",
                                generation,
                                attempt.channel
                            );
                        }
                        Command::Receipt if frame.get("receipt-id") == Some(receipt.as_str()) => {
                            emit(TransportEventKind::Subscribed);
                        }
                        Command::Message => match subscriptions.route(frame) {
                            Some(kind) => emit(kind),
                            None => log::trace!("[Push] MESSAGE for foreign subscription ignored"),
                        },
                        Command::Error => {
                            bail!(
                                "server ERROR frame: {}",
                                frame.get("message").unwrap_or(frame.body.as_str())
                            );
                        }
                        other => log::trace!("[Push] Ignoring {} frame", other),
                    }
                }
            }
        }
    }
}
