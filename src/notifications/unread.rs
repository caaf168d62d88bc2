//! Unread count and one-shot "new alerts" surfacing.
//!
//! The count is never cached: every [`UnreadSignal::recompute`] derives it
//! from the store. The only stored bit is the alert latch, which arms on a
//! 0 → >0 transition and re-arms only after the count returns to exactly 0.

use super::NotificationStateStore;

/// Callback fired with the unread count when alerts surface.
pub type AlertListener = Box<dyn FnMut(usize)>;

/// Derived unread state for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnreadState {
    /// Number of unconfirmed notifications.
    pub count: usize,
    /// Set while an alert has already been surfaced for the current
    /// nonzero run.
    pub alert_armed: bool,
}

/// Unread count derivation with an alert latch.
#[derive(Default)]
pub struct UnreadSignal {
    alert_armed: bool,
    count: usize,
    listeners: Vec<AlertListener>,
}

impl std::fmt::Debug for UnreadSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnreadSignal")
            .field("alert_armed", &self.alert_armed)
            .field("count", &self.count)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl UnreadSignal {
    /// Create a signal with the latch released.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an alert listener. Listeners fire in registration order.
    pub fn on_alert(&mut self, listener: impl FnMut(usize) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Recompute from the store. Call after every store mutation.
    pub fn recompute(&mut self, store: &NotificationStateStore) -> UnreadState {
        self.observe(store.unconfirmed_count())
    }

    /// Feed a freshly derived count through the latch.
    fn observe(&mut self, count: usize) -> UnreadState {
        self.count = count;
        if count == 0 {
            self.alert_armed = false;
        } else if !self.alert_armed {
            self.alert_armed = true;
            log::info!("[Unread] {} unread notification(s)", count);
            for listener in &mut self.listeners {
                listener(count);
            }
        }
        self.state()
    }

    /// State as of the last recompute.
    pub fn state(&self) -> UnreadState {
        UnreadState {
            count: self.count,
            alert_armed: self.alert_armed,
        }
    }
}
