//! Event channel for the sync hub loop.
//!
//! Background producers (credential watcher, HTTP tasks) send [`SyncEvent`]s
//! through one `mpsc::UnboundedSender<SyncEvent>`. Transport completions
//! travel on their own channel and are wrapped as [`SyncEvent::Transport`]
//! by the `select!` loop, so every mutation of hub state happens in
//! [`super::SyncHub::handle_event`].

use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::notifications::{Notification, NotificationId};
use crate::push::TransportEvent;

/// Session epoch. Bumped on every identity change.
pub type Epoch = u64;

/// Event from a background producer delivered to the hub loop.
#[derive(Debug)]
pub enum SyncEvent {
    /// The credential store was written, possibly by another process.
    StorageChanged,

    /// Completion from the push transport.
    Transport(TransportEvent),

    /// Bulk fetch finished.
    NotificationsFetched {
        /// Session epoch the fetch was started under.
        epoch: Epoch,
        /// Fetched list, or why it failed.
        result: Result<Vec<Notification>, SyncError>,
    },

    /// Upstream confirm finished (after its single retry).
    ConfirmFinished {
        /// Notification that was confirmed.
        id: NotificationId,
        /// Outcome of the last attempt.
        result: Result<(), SyncError>,
    },

    /// Server-side logout finished.
    LogoutFinished {
        /// Session epoch the logout was started under.
        epoch: Epoch,
        /// Outcome of the call. Local credentials are cleared either way,
        /// unless another login happened in the meantime.
        result: Result<(), SyncError>,
    },
}

/// Sender half of the hub event channel.
pub type SyncEventSender = mpsc::UnboundedSender<SyncEvent>;

/// Receiver half of the hub event channel.
pub type SyncEventReceiver = mpsc::UnboundedReceiver<SyncEvent>;

/// Create the hub event channel.
pub fn channel() -> (SyncEventSender, SyncEventReceiver) {
    mpsc::unbounded_channel()
}
