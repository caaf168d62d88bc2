//! Durcit sync - real-time notification and session synchronization core.
//!
//! This crate keeps a client's view of its notifications in step with the
//! server: it follows login/logout made by other processes sharing the
//! credential file, holds exactly one push subscription for the logged-in
//! member, reconciles pushed and fetched notifications, and raises an alert
//! when unread notifications appear.
//!
//! # Architecture
//!
//! - **SessionStateTracker** - current identity over an observable credential store
//! - **PushConnectionManager** - connection state machine, one subscription per identity
//! - **NotificationStateStore** - notifications keyed by id, idempotent merge
//! - **UnreadSignal** - unread count and one-shot alert latch
//! - **SyncHub** - owns the above and runs the event loop
//!
//! # Modules
//!
//! - [`session`] - identity tracking and credential stores
//! - [`push`] - connection manager and the STOMP transport
//! - [`notifications`] - notification model, store, unread signal
//! - [`hub`] - event loop and user operations
//! - [`api`] - REST client
//! - [`config`] - configuration loading/saving

pub mod api;
pub mod config;
pub mod constants;
pub mod env;
pub mod error;
pub mod file_watcher;
pub mod hub;
pub mod notifications;
pub mod push;
pub mod session;
pub mod stomp;
pub mod ws;

pub use api::{HttpPushApi, PushApi};
pub use config::Config;
pub use error::SyncError;
pub use hub::{SyncEvent, SyncHub};
pub use notifications::{Notification, NotificationStateStore, UnreadSignal, UnreadState};
pub use push::{ConnectionState, PushConnectionManager, PushTransport, StompTransport};
pub use session::{
    CredentialStore, FileCredentialStore, Identity, MemoryCredentialStore, SessionStateTracker,
};
