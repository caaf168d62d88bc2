//! Push connection lifecycle.
//!
//! [`PushConnectionManager`] owns the one logical subscription to the
//! per-identity push channel. It is a pure state machine: effects (open,
//! close, publish, timers) go through the [`PushTransport`] trait, and
//! completions come back as [`TransportEvent`]s on the hub's event loop.
//!
//! # States
//!
//! ```text
//!                 identity present
//!  Disconnected ─────────────────────► Connecting ──ack──► Subscribed
//!       ▲                              │    ▲                   │
//!       │ identity changes / anonymous │    │ retry timer       │ transport
//!       │ (close before any new open)  ▼    │                   │ error
//!       └──────────────────────────── Failed ◄──────────────────┘
//!                                      ▲
//!                    error / ack timeout
//! ```
//!
//! # Generations
//!
//! Every connection attempt gets a fresh generation number. Events carry
//! the generation of the attempt that produced them; anything older than
//! the current attempt is discarded, so a teardown makes the eventual
//! completion of an in-flight attempt a no-op.
//!
//! # Retry policy
//!
//! Exponential backoff between attempts, capped at
//! [`crate::constants::MAX_BACKOFF`]. Retries never stop while an identity
//! is present; the cap bounds the retry rate.

pub mod stomp_transport;

pub use stomp_transport::StompTransport;

use std::time::Duration;

use crate::constants;
use crate::error::SyncError;
use crate::session::Identity;

/// Connection attempt counter.
pub type Generation = u64;

/// Lifecycle state of the push subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport, no subscription.
    #[default]
    Disconnected,
    /// Transport opening and subscribe sent, waiting for the ack.
    Connecting,
    /// Subscribe acknowledged; inbound events are delivered.
    Subscribed,
    /// Last attempt failed; a retry is scheduled while an identity exists.
    Failed,
}

/// Timers the manager asks the transport to arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Subscribe acknowledgment deadline.
    SubscribeTimeout,
    /// Backoff elapsed; try again.
    Retry,
}

/// What a transport reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// The subscribe was acknowledged.
    Subscribed,
    /// A serialized inbound event on the identity channel.
    Message(String),
    /// A serialized update from the emoji broadcast topic.
    EmojiUpdate(String),
    /// The attempt died (connect, subscribe, or later connection loss).
    Failed(SyncError),
    /// A timer armed through [`PushTransport::arm_timer`] fired.
    Timer(TimerKind),
}

/// Completion delivered to the event loop, tagged with its attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    /// Attempt that produced the event.
    pub generation: Generation,
    /// Payload.
    pub kind: TransportEventKind,
}

impl TransportEvent {
    /// Shorthand constructor.
    pub fn new(generation: Generation, kind: TransportEventKind) -> Self {
        Self { generation, kind }
    }
}

/// Parameters of one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    /// Attempt number; echoed in every resulting event.
    pub generation: Generation,
    /// Destination to subscribe to.
    pub channel: String,
    /// Broadcast topic subscribed alongside `channel`, if enabled.
    pub emoji_topic: Option<String>,
    /// Identity the attempt authenticates as.
    pub identity: Identity,
}

/// Effects of the connection state machine.
///
/// Implementations report completions asynchronously as
/// [`TransportEvent`]s; none of these calls block.
pub trait PushTransport {
    /// Open a transport and subscribe to `attempt.channel`.
    fn open(&mut self, attempt: &ConnectAttempt);

    /// Tear down the transport and subscription of `generation`. After this
    /// returns no further events for `generation` matter.
    fn close(&mut self, generation: Generation);

    /// Fire-and-forget publish on the live transport of `generation`.
    fn publish(&mut self, generation: Generation, destination: &str, body: &str);

    /// Deliver [`TransportEventKind::Timer`] for `generation` after `delay`.
    fn arm_timer(&mut self, generation: Generation, kind: TimerKind, delay: Duration);
}

/// Exponential backoff with a cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    /// Backoff starting at `initial`, doubling up to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay for the upcoming retry; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    /// Back to the initial delay.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(constants::INITIAL_BACKOFF, constants::MAX_BACKOFF)
    }
}

/// Callback for inbound payloads.
pub type MessageHandler = Box<dyn FnMut(&str)>;

/// Owner of the single push subscription.
pub struct PushConnectionManager<T: PushTransport> {
    transport: T,
    state: ConnectionState,
    generation: Generation,
    identity: Option<Identity>,
    channel_prefix: String,
    emoji_topic: Option<String>,
    subscribe_timeout: Duration,
    backoff: Backoff,
    handlers: Vec<MessageHandler>,
    emoji_handlers: Vec<MessageHandler>,
}

impl<T: PushTransport + std::fmt::Debug> std::fmt::Debug for PushConnectionManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushConnectionManager")
            .field("transport", &self.transport)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl<T: PushTransport> PushConnectionManager<T> {
    /// Create a disconnected manager.
    pub fn new(
        transport: T,
        channel_prefix: impl Into<String>,
        subscribe_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            state: ConnectionState::Disconnected,
            generation: 0,
            identity: None,
            channel_prefix: channel_prefix.into(),
            emoji_topic: None,
            subscribe_timeout,
            backoff: Backoff::default(),
            handlers: Vec::new(),
            emoji_handlers: Vec::new(),
        }
    }

    /// Also subscribe to the emoji broadcast `topic` on every attempt.
    pub fn with_emoji_topic(mut self, topic: impl Into<String>) -> Self {
        self.emoji_topic = Some(topic.into());
        self
    }

    /// Replace the retry policy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Generation of the current (or last) attempt.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Identity the manager is connecting as.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Channel of the current identity.
    pub fn channel(&self) -> Option<String> {
        self.identity
            .as_ref()
            .map(|i| format!("{}{}", self.channel_prefix, i.subject_id))
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable transport access.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Register an inbound payload handler.
    pub fn on_message(&mut self, handler: impl FnMut(&str) + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Register an emoji update handler. Same delivery rules as
    /// [`Self::on_message`].
    pub fn on_emoji_update(&mut self, handler: impl FnMut(&str) + 'static) {
        self.emoji_handlers.push(Box::new(handler));
    }

    /// React to the current identity.
    ///
    /// A different subject (including anonymous) tears down whatever exists
    /// before a new attempt is opened. The same subject with rotated
    /// credentials keeps the live subscription.
    pub fn set_identity(&mut self, identity: Option<&Identity>) {
        if Identity::same_subject(self.identity.as_ref(), identity) {
            self.identity = identity.cloned();
            // Still wanted but idle: e.g. constructed before the first identity.
            if self.identity.is_some() && self.state == ConnectionState::Disconnected {
                self.begin_connect();
            }
            return;
        }

        self.teardown();
        self.identity = identity.cloned();
        self.backoff.reset();

        if self.identity.is_some() {
            self.begin_connect();
        }
    }

    /// Drop the subscription and forget the identity.
    pub fn shutdown(&mut self) {
        self.teardown();
        self.identity = None;
    }

    /// Process a transport completion.
    ///
    /// Returns the inbound payload when one is delivered, after the
    /// registered handlers have seen it.
    pub fn handle_event(&mut self, event: TransportEvent) -> Option<String> {
        if event.generation != self.generation {
            log::trace!(
                "[Push] Discarding stale event from generation {} (current {})",
                event.generation,
                self.generation
            );
            return None;
        }

        match event.kind {
            TransportEventKind::Subscribed => {
                if self.state == ConnectionState::Connecting {
                    self.state = ConnectionState::Subscribed;
                    self.backoff.reset();
                    log::info!(
                        "[Push] Subscribed to {} (generation {})",
                        self.channel().unwrap_or_default(),
                        self.generation
                    );
                }
                None
            }
            TransportEventKind::Message(payload) => {
                if self.state != ConnectionState::Subscribed {
                    log::debug!("[Push] Dropping message received while {:?}", self.state);
                    return None;
                }
                for handler in &mut self.handlers {
                    handler(&payload);
                }
                Some(payload)
            }
            TransportEventKind::EmojiUpdate(payload) => {
                if self.state == ConnectionState::Subscribed {
                    for handler in &mut self.emoji_handlers {
                        handler(&payload);
                    }
                } else {
                    log::debug!("[Push] Dropping emoji update received while {:?}", self.state);
                }
                None
            }
            TransportEventKind::Failed(err) => {
                if matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::Subscribed
                ) {
                    self.fail(&err);
                }
                None
            }
            TransportEventKind::Timer(TimerKind::SubscribeTimeout) => {
                if self.state == ConnectionState::Connecting {
                    self.fail(&SyncError::Transport(format!(
                        "subscribe not acknowledged within {}s",
                        self.subscribe_timeout.as_secs()
                    )));
                }
                None
            }
            TransportEventKind::Timer(TimerKind::Retry) => {
                if self.state == ConnectionState::Failed && self.identity.is_some() {
                    log::info!("[Push] Retrying connection");
                    self.begin_connect();
                }
                None
            }
        }
    }

    /// Publish an action event. Dropped unless subscribed.
    pub fn publish(&mut self, destination: &str, body: &str) -> bool {
        if self.state != ConnectionState::Subscribed {
            log::warn!("[Push] Not connected, dropping publish to {destination}");
            return false;
        }
        self.transport.publish(self.generation, destination, body);
        true
    }

    fn begin_connect(&mut self) {
        let Some(identity) = self.identity.clone() else {
            return;
        };
        let Some(channel) = self.channel() else {
            return;
        };

        self.generation += 1;
        self.state = ConnectionState::Connecting;
        log::info!(
            "[Push] Connecting to {} (generation {})",
            channel,
            self.generation
        );

        let attempt = ConnectAttempt {
            generation: self.generation,
            channel,
            emoji_topic: self.emoji_topic.clone(),
            identity,
        };
        self.transport.open(&attempt);
        self.transport
            .arm_timer(self.generation, TimerKind::SubscribeTimeout, self.subscribe_timeout);
    }

    fn teardown(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Subscribed
        ) {
            log::info!("[Push] Tearing down generation {}", self.generation);
            self.transport.close(self.generation);
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Release the attempt and schedule the next one.
    fn fail(&mut self, err: &SyncError) {
        self.transport.close(self.generation);
        self.state = ConnectionState::Failed;
        let delay = self.backoff.next_delay();
        log::warn!(
            "[Push] {} (generation {}); retrying in {}s",
            err,
            self.generation,
            delay.as_secs_f32()
        );
        self.transport
            .arm_timer(self.generation, TimerKind::Retry, delay);
    }
}
