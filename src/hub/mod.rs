//! Sync hub: owns the session tracker, push connection, notification store
//! and unread signal, and runs them on one event loop.
//!
//! # Ordering
//!
//! An identity change is handled in a single step of the loop:
//!
//! 1. bump the session epoch (in-flight bulk fetches become stale),
//! 2. clear the notification store and recompute unread,
//! 3. hand the new identity to the connection manager, which tears down
//!    the old subscription before opening a new one,
//! 4. start a bulk fetch for the new identity.
//!
//! Inbound messages for the new identity can only arrive on the new
//! generation, so they always land in an already cleared store.

pub mod events;

pub use events::{Epoch, SyncEvent, SyncEventReceiver, SyncEventSender};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::SharedPushApi;
use crate::constants::ADD_EMOJI_DESTINATION;
use crate::error::SyncError;
use crate::notifications::{
    Notification, NotificationId, NotificationStateStore, UnreadSignal, UnreadState,
};
use crate::push::{ConnectionState, PushConnectionManager, PushTransport, TransportEvent};
use crate::session::{Identity, SessionStateTracker};

/// How many times an upstream confirm is attempted before giving up.
const CONFIRM_ATTEMPTS: usize = 2;

/// Single-threaded coordinator for the notification subsystem.
pub struct SyncHub<T: PushTransport> {
    tracker: SessionStateTracker,
    manager: PushConnectionManager<T>,
    store: NotificationStateStore,
    unread: UnreadSignal,
    api: SharedPushApi,
    events: SyncEventSender,
    epoch: Epoch,
    panel_open: bool,
}

impl<T: PushTransport> std::fmt::Debug for SyncHub<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHub")
            .field("identity", &self.tracker.current_identity())
            .field("connection", &self.manager.state())
            .field("epoch", &self.epoch)
            .field("notifications", &self.store.len())
            .field("unread", &self.unread.state())
            .finish_non_exhaustive()
    }
}

impl<T: PushTransport> SyncHub<T> {
    /// Assemble a hub. Nothing happens until [`Self::start`].
    pub fn new(
        tracker: SessionStateTracker,
        manager: PushConnectionManager<T>,
        api: SharedPushApi,
        events: SyncEventSender,
    ) -> Self {
        Self {
            tracker,
            manager,
            store: NotificationStateStore::new(),
            unread: UnreadSignal::new(),
            api,
            events,
            epoch: 0,
            panel_open: false,
        }
    }

    /// Apply the initial identity: connect and fetch if logged in.
    pub fn start(&mut self) {
        let identity = self.tracker.current_identity().cloned();
        self.apply_identity(identity);
    }

    // ---- accessors ----

    /// Notifications, newest first.
    pub fn snapshot(&self) -> Vec<Notification> {
        self.store.snapshot()
    }

    /// Current unread count and latch.
    pub fn unread_state(&self) -> UnreadState {
        self.unread.state()
    }

    /// Push connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Logged-in identity, if any.
    pub fn identity(&self) -> Option<&Identity> {
        self.tracker.current_identity()
    }

    /// Current session epoch.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Whether the notification panel is open.
    pub fn panel_open(&self) -> bool {
        self.panel_open
    }

    /// The notification store.
    pub fn store(&self) -> &NotificationStateStore {
        &self.store
    }

    /// The session tracker.
    pub fn tracker(&self) -> &SessionStateTracker {
        &self.tracker
    }

    /// The push connection manager.
    pub fn manager(&self) -> &PushConnectionManager<T> {
        &self.manager
    }

    /// Mutable manager access (registering message handlers).
    pub fn manager_mut(&mut self) -> &mut PushConnectionManager<T> {
        &mut self.manager
    }

    /// Register an unread alert listener.
    pub fn on_alert(&mut self, listener: impl FnMut(usize) + 'static) {
        self.unread.on_alert(listener);
    }

    /// Register an identity change listener.
    pub fn on_identity_change(
        &mut self,
        listener: impl FnMut(Option<&Identity>, Option<&Identity>) + 'static,
    ) {
        self.tracker.on_identity_change(listener);
    }

    /// Register a listener for emoji reaction updates broadcast to every
    /// client. Delivered only while subscribed; non-JSON payloads are
    /// dropped.
    pub fn on_emoji_update(&mut self, mut listener: impl FnMut(&serde_json::Value) + 'static) {
        self.manager.on_emoji_update(move |payload| {
            match serde_json::from_str::<serde_json::Value>(payload) {
                Ok(update) => listener(&update),
                Err(e) => log::warn!("[Hub] Dropping emoji update: {e}"),
            }
        });
    }

    // ---- user operations ----

    /// Open or close the notification panel. Every toggle refetches.
    pub fn toggle_panel(&mut self) -> bool {
        self.panel_open = !self.panel_open;
        self.start_fetch();
        self.panel_open
    }

    /// Mark a notification as read locally and upstream.
    ///
    /// Returns `true` when the entry flipped to confirmed. Already confirmed
    /// or unknown ids change nothing and send nothing.
    pub fn acknowledge(&mut self, id: NotificationId) -> bool {
        if !self.store.acknowledge(id) {
            return false;
        }
        self.unread.recompute(&self.store);
        self.start_confirm(id);
        true
    }

    /// Acknowledge and return the client route of the notification target.
    pub fn open_notification(&mut self, id: NotificationId) -> Option<String> {
        let route = self.store.get(id)?.target_route();
        self.acknowledge(id);
        route
    }

    /// React to a post with an emoji over the push connection.
    pub fn add_emoji(&mut self, post_id: i64, emoji: &str) -> bool {
        let body = serde_json::json!({ "postId": post_id, "emoji": emoji }).to_string();
        self.manager.publish(ADD_EMOJI_DESTINATION, &body)
    }

    /// Log out: notify the server, then clear local credentials regardless
    /// of the outcome.
    ///
    /// If the identity changes while the server call is in flight (a login
    /// from another context), the completion leaves the newer credentials
    /// alone.
    pub fn logout(&mut self) {
        let Some(identity) = self.tracker.current_identity().cloned() else {
            log::debug!("[Hub] Logout while anonymous; clearing credentials");
            self.finish_logout();
            return;
        };

        let epoch = self.epoch;
        let api = SharedPushApi::clone(&self.api);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = api
                .logout(&identity)
                .await
                .map_err(|e| SyncError::upstream("logout", format!("{e:#}")));
            let _ = events.send(SyncEvent::LogoutFinished { epoch, result });
        });
    }

    // ---- event handling ----

    /// Dispatch one event from a background producer.
    pub fn handle_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::StorageChanged => self.handle_storage_changed(),
            SyncEvent::Transport(event) => self.handle_transport_event(event),
            SyncEvent::NotificationsFetched { epoch, result } => {
                self.handle_fetch_result(epoch, result);
            }
            SyncEvent::ConfirmFinished { id, result } => match result {
                Ok(()) => log::debug!("[Hub] Notification {id} confirmed upstream"),
                Err(e) => log::warn!("[Hub] {e}; notification {id} stays read locally"),
            },
            SyncEvent::LogoutFinished { epoch, result } => {
                self.handle_logout_finished(epoch, result);
            }
        }
    }

    /// Run until `shutdown` fires.
    pub async fn run(
        &mut self,
        mut events_rx: SyncEventReceiver,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        self.start();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    log::info!("[Hub] Shutdown requested");
                    break;
                }
                Some(event) = events_rx.recv() => self.handle_event(event),
                Some(event) = transport_rx.recv() => {
                    self.handle_event(SyncEvent::Transport(event));
                }
            }
        }

        self.manager.shutdown();
        Ok(())
    }

    fn handle_storage_changed(&mut self) {
        match self.tracker.refresh() {
            Some(change) => self.apply_identity(change.new),
            // Same subject: pass rotated tokens through without reconnecting.
            None => {
                let identity = self.tracker.current_identity().cloned();
                self.manager.set_identity(identity.as_ref());
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        let Some(payload) = self.manager.handle_event(event) else {
            return;
        };

        match Notification::from_payload(&payload) {
            Ok(notification) => {
                log::debug!("[Hub] Inbound notification {}", notification.id);
                self.store.apply_inbound(notification);
                self.unread.recompute(&self.store);
            }
            Err(e) => log::warn!("[Hub] Dropping inbound payload: {e}"),
        }
    }

    fn handle_fetch_result(&mut self, epoch: Epoch, result: Result<Vec<Notification>, SyncError>) {
        if epoch != self.epoch {
            log::debug!(
                "[Hub] Discarding fetch from epoch {} (current {})",
                epoch,
                self.epoch
            );
            return;
        }

        match result {
            Ok(list) => {
                log::debug!("[Hub] Replacing store with {} notifications", list.len());
                self.store.replace_all(list);
                self.unread.recompute(&self.store);
            }
            Err(e) => log::warn!("[Hub] {e}"),
        }
    }

    fn apply_identity(&mut self, identity: Option<Identity>) {
        self.epoch += 1;
        self.store.clear();
        self.unread.recompute(&self.store);
        self.manager.set_identity(identity.as_ref());
        self.start_fetch();
    }

    fn handle_logout_finished(&mut self, epoch: Epoch, result: Result<(), SyncError>) {
        if epoch != self.epoch {
            log::info!(
                "[Hub] Stale logout from epoch {} (current {}); keeping newer credentials",
                epoch,
                self.epoch
            );
            return;
        }
        if let Err(e) = result {
            log::warn!("[Hub] {e}; clearing local session anyway");
        }
        self.finish_logout();
    }

    fn finish_logout(&mut self) {
        if let Err(e) = self.tracker.store().clear() {
            log::warn!("[Hub] Failed to clear credentials: {e:#}");
        }
        // The watcher will report this write too; the second refresh is a no-op.
        self.handle_storage_changed();
    }

    fn start_fetch(&self) {
        let Some(identity) = self.tracker.current_identity().cloned() else {
            return;
        };

        let epoch = self.epoch;
        let api = SharedPushApi::clone(&self.api);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = api
                .fetch_notifications(&identity)
                .await
                .map_err(|e| SyncError::Transport(format!("{e:#}")));
            let _ = events.send(SyncEvent::NotificationsFetched { epoch, result });
        });
    }

    fn start_confirm(&self, id: NotificationId) {
        let Some(identity) = self.tracker.current_identity().cloned() else {
            return;
        };

        let api = SharedPushApi::clone(&self.api);
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut result = Ok(());
            for attempt in 1..=CONFIRM_ATTEMPTS {
                result = api
                    .confirm(&identity, id)
                    .await
                    .map_err(|e| SyncError::upstream("confirm", format!("{e:#}")));
                if result.is_ok() {
                    break;
                }
                log::debug!("[Hub] Confirm of {id} failed (attempt {attempt})");
            }
            let _ = events.send(SyncEvent::ConfirmFinished { id, result });
        });
    }
}
