//! Current authenticated identity and cross-context session changes.
//!
//! [`SessionStateTracker`] reads the shared credential store once on
//! construction and again on every storage mutation event. When the derived
//! subject id changes (appears, disappears, or takes a different value) all
//! registered listeners run once, in registration order, with
//! `(old, new)`. A write that leaves the subject id as it was produces no
//! notification.
//!
//! Storage that cannot be read is treated as an anonymous session.

pub mod storage;

pub use storage::{CredentialStore, FileCredentialStore, MemoryCredentialStore, StorageNotifier};

use storage::{ACCESS_TOKEN_KEY, MEMBER_ID_KEY, REFRESH_TOKEN_KEY};

/// An authenticated member.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    /// Opaque subject id (`memberId`).
    pub subject_id: String,
    /// Bearer credential.
    pub access_token: String,
    /// Refresh credential, when the login flow stored one.
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Tokens stay out of logs.
        f.debug_struct("Identity")
            .field("subject_id", &self.subject_id)
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Derive the identity from the store.
    ///
    /// Present only when both `memberId` and `accessToken` are non-empty.
    /// Read failures degrade to anonymous.
    pub fn from_store(store: &dyn CredentialStore) -> Option<Self> {
        let mut entries = match store.entries() {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("[Session] {e}; treating session as anonymous");
                return None;
            }
        };

        let subject_id = entries.remove(MEMBER_ID_KEY).filter(|v| !v.is_empty())?;
        let access_token = entries.remove(ACCESS_TOKEN_KEY).filter(|v| !v.is_empty())?;
        let refresh_token = entries.remove(REFRESH_TOKEN_KEY).filter(|v| !v.is_empty());

        Some(Self {
            subject_id,
            access_token,
            refresh_token,
        })
    }

    /// Whether two optional identities name the same subject.
    pub fn same_subject(a: Option<&Self>, b: Option<&Self>) -> bool {
        a.map(|i| i.subject_id.as_str()) == b.map(|i| i.subject_id.as_str())
    }
}

/// A change of the current identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityChange {
    /// Identity before the change.
    pub old: Option<Identity>,
    /// Identity after the change.
    pub new: Option<Identity>,
}

/// Callback invoked with `(old, new)` on every identity change.
pub type IdentityListener = Box<dyn FnMut(Option<&Identity>, Option<&Identity>)>;

/// Observes the shared credential store and exposes the current identity.
pub struct SessionStateTracker {
    store: Box<dyn CredentialStore>,
    current: Option<Identity>,
    listeners: Vec<IdentityListener>,
}

impl std::fmt::Debug for SessionStateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStateTracker")
            .field("current", &self.current)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl SessionStateTracker {
    /// Create a tracker; the store is read synchronously for the initial
    /// identity.
    pub fn new(store: Box<dyn CredentialStore>) -> Self {
        let current = Identity::from_store(store.as_ref());
        log::info!(
            "[Session] Initial identity: {}",
            current.as_ref().map_or("anonymous", |i| i.subject_id.as_str())
        );
        Self {
            store,
            current,
            listeners: Vec::new(),
        }
    }

    /// The current identity, `None` when anonymous.
    pub fn current_identity(&self) -> Option<&Identity> {
        self.current.as_ref()
    }

    /// Register a listener for identity changes.
    pub fn on_identity_change(
        &mut self,
        listener: impl FnMut(Option<&Identity>, Option<&Identity>) + 'static,
    ) {
        self.listeners.push(Box::new(listener));
    }

    /// Re-read the store after a mutation event.
    ///
    /// Returns the change when the subject id differs from before. Token
    /// rotation for the same subject updates the stored credentials without
    /// notifying anyone.
    pub fn refresh(&mut self) -> Option<IdentityChange> {
        let next = Identity::from_store(self.store.as_ref());

        if Identity::same_subject(self.current.as_ref(), next.as_ref()) {
            if self.current != next {
                log::debug!("[Session] Credentials rotated for same subject");
                self.current = next;
            }
            return None;
        }

        let old = std::mem::replace(&mut self.current, next);
        log::info!(
            "[Session] Identity changed: {} -> {}",
            old.as_ref().map_or("anonymous", |i| i.subject_id.as_str()),
            self.current.as_ref().map_or("anonymous", |i| i.subject_id.as_str())
        );

        for listener in &mut self.listeners {
            listener(old.as_ref(), self.current.as_ref());
        }

        Some(IdentityChange {
            old,
            new: self.current.clone(),
        })
    }

    /// The backing credential store.
    pub fn store(&self) -> &dyn CredentialStore {
        self.store.as_ref()
    }

    /// Mutable access for registering watchers.
    pub fn store_mut(&mut self) -> &mut dyn CredentialStore {
        self.store.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    fn login(store: &MemoryCredentialStore, member: &str) {
        store.set(ACCESS_TOKEN_KEY, &format!("access-{member}")).unwrap();
        store.set(REFRESH_TOKEN_KEY, &format!("refresh-{member}")).unwrap();
        store.set(MEMBER_ID_KEY, member).unwrap();
    }

    type Seen = Rc<RefCell<Vec<(Option<String>, Option<String>)>>>;

    fn recording_tracker(store: &MemoryCredentialStore) -> (SessionStateTracker, Seen) {
        let seen: Seen = Rc::new(RefCell::new(Vec::new()));
        let mut tracker = SessionStateTracker::new(Box::new(store.clone()));
        let sink = Rc::clone(&seen);
        tracker.on_identity_change(move |old, new| {
            sink.borrow_mut().push((
                old.map(|i| i.subject_id.clone()),
                new.map(|i| i.subject_id.clone()),
            ));
        });
        (tracker, seen)
    }

    #[test]
    fn test_initial_identity_is_read_synchronously() {
        let store = MemoryCredentialStore::new();
        login(&store, "7");
        let tracker = SessionStateTracker::new(Box::new(store));
        let identity = tracker.current_identity().unwrap();
        assert_eq!(identity.subject_id, "7");
        assert_eq!(identity.access_token, "access-7");
        assert_eq!(identity.refresh_token.as_deref(), Some("refresh-7"));
    }

    #[test]
    fn test_member_without_token_is_anonymous() {
        let store = MemoryCredentialStore::new();
        store.set(MEMBER_ID_KEY, "7").unwrap();
        let tracker = SessionStateTracker::new(Box::new(store));
        assert!(tracker.current_identity().is_none());
    }

    #[test]
    fn test_login_logout_notify_once_each() {
        let store = MemoryCredentialStore::new();
        let (mut tracker, seen) = recording_tracker(&store);

        login(&store, "7");
        assert!(tracker.refresh().is_some());
        assert!(tracker.refresh().is_none());

        store.clear().unwrap();
        let change = tracker.refresh().unwrap();
        assert_eq!(change.old.unwrap().subject_id, "7");
        assert!(change.new.is_none());

        assert_eq!(
            *seen.borrow(),
            vec![(None, Some("7".to_string())), (Some("7".to_string()), None)]
        );
    }

    #[test]
    fn test_noop_write_does_not_notify() {
        let store = MemoryCredentialStore::new();
        login(&store, "7");
        let (mut tracker, seen) = recording_tracker(&store);

        store.set(MEMBER_ID_KEY, "7").unwrap();
        assert!(tracker.refresh().is_none());
        store.set("theme", "dark").unwrap();
        assert!(tracker.refresh().is_none());
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_token_rotation_updates_silently() {
        let store = MemoryCredentialStore::new();
        login(&store, "7");
        let (mut tracker, seen) = recording_tracker(&store);

        store.set(ACCESS_TOKEN_KEY, "rotated").unwrap();
        assert!(tracker.refresh().is_none());
        assert_eq!(tracker.current_identity().unwrap().access_token, "rotated");
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_switching_member_reports_both_sides() {
        let store = MemoryCredentialStore::new();
        login(&store, "1");
        let (mut tracker, seen) = recording_tracker(&store);

        login(&store, "2");
        tracker.refresh();
        assert_eq!(
            *seen.borrow(),
            vec![(Some("1".to_string()), Some("2".to_string()))]
        );
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let store = MemoryCredentialStore::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut tracker = SessionStateTracker::new(Box::new(store.clone()));
        for tag in [1, 2, 3] {
            let order = Rc::clone(&order);
            tracker.on_identity_change(move |_, _| order.borrow_mut().push(tag));
        }

        login(&store, "7");
        tracker.refresh();
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    struct UnreadableStore;

    impl CredentialStore for UnreadableStore {
        fn entries(&self) -> Result<HashMap<String, String>, SyncError> {
            Err(SyncError::StorageRead("permission denied".to_string()))
        }
        fn write_batch(&self, _changes: &[(&str, Option<&str>)]) -> anyhow::Result<()> {
            Ok(())
        }
        fn clear(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn watch(&mut self, _notifier: StorageNotifier) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_unreadable_storage_is_anonymous() {
        let mut tracker = SessionStateTracker::new(Box::new(UnreadableStore));
        assert!(tracker.current_identity().is_none());
        assert!(tracker.refresh().is_none());
    }

    #[test]
    fn test_debug_hides_tokens() {
        let identity = Identity {
            subject_id: "7".to_string(),
            access_token: "secret-access".to_string(),
            refresh_token: Some("secret-refresh".to_string()),
        };
        let debug = format!("{identity:?}");
        assert!(debug.contains('7'));
        assert!(!debug.contains("secret"));
    }
}
