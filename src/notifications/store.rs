//! Authoritative in-memory notification collection for the current member.
//!
//! Keyed by id. Storage order is irrelevant; [`NotificationStateStore::snapshot`]
//! orders by `created_at` descending with ties broken by ascending id so the
//! view is deterministic.
//!
//! `confirmed` is monotonic: no operation in this module turns a confirmed
//! notification back into an unconfirmed one.

use std::collections::HashMap;

use super::{Notification, NotificationId};

/// Reconciling store for push and bulk-fetched notifications.
#[derive(Debug, Default)]
pub struct NotificationStateStore {
    entries: HashMap<NotificationId, Notification>,
}

impl NotificationStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole collection (identity change or bulk refresh).
    ///
    /// Ids confirmed locally stay confirmed even if the incoming list still
    /// reports them unread; the confirm may not have reached the server yet.
    pub fn replace_all(&mut self, list: Vec<Notification>) {
        let mut next = HashMap::with_capacity(list.len());
        for mut notification in list {
            if self
                .entries
                .get(&notification.id)
                .is_some_and(|existing| existing.confirmed)
            {
                notification.confirmed = true;
            }
            next.insert(notification.id, notification);
        }
        self.entries = next;
    }

    /// Drop everything. Used when the identity changes.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Upsert an inbound notification by id.
    ///
    /// An existing entry takes the inbound fields, except that a local
    /// `confirmed = true` survives. Applying the same event twice leaves
    /// the store as applying it once.
    pub fn apply_inbound(&mut self, notification: Notification) {
        match self.entries.get_mut(&notification.id) {
            Some(existing) => {
                let confirmed = existing.confirmed || notification.confirmed;
                *existing = notification;
                existing.confirmed = confirmed;
            }
            None => {
                self.entries.insert(notification.id, notification);
            }
        }
    }

    /// Mark a notification read.
    ///
    /// Returns `true` only when the entry existed and was unconfirmed, i.e.
    /// when an upstream confirm is worth sending. Unknown ids are a no-op.
    pub fn acknowledge(&mut self, id: NotificationId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if !entry.confirmed => {
                entry.confirmed = true;
                true
            }
            _ => false,
        }
    }

    /// Current view ordered newest first.
    pub fn snapshot(&self) -> Vec<Notification> {
        let mut view: Vec<Notification> = self.entries.values().cloned().collect();
        view.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        view
    }

    /// Look up a single notification.
    pub fn get(&self, id: NotificationId) -> Option<&Notification> {
        self.entries.get(&id)
    }

    /// Number of unconfirmed entries.
    pub fn unconfirmed_count(&self) -> usize {
        self.entries.values().filter(|n| !n.confirmed).count()
    }

    /// Number of stored notifications.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no notifications.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::test_support::notification;

    fn ids(store: &NotificationStateStore) -> Vec<NotificationId> {
        store.snapshot().iter().map(|n| n.id).collect()
    }

    #[test]
    fn test_snapshot_orders_newest_first() {
        let mut store = NotificationStateStore::new();
        store.apply_inbound(notification(1, 5));
        store.apply_inbound(notification(2, 30));
        store.apply_inbound(notification(3, 10));
        assert_eq!(ids(&store), vec![2, 3, 1]);
    }

    #[test]
    fn test_snapshot_ties_break_by_id() {
        let mut store = NotificationStateStore::new();
        store.apply_inbound(notification(9, 0));
        store.apply_inbound(notification(4, 0));
        assert_eq!(ids(&store), vec![4, 9]);
    }

    #[test]
    fn test_apply_inbound_is_idempotent() {
        let mut once = NotificationStateStore::new();
        once.apply_inbound(notification(1, 0));

        let mut twice = NotificationStateStore::new();
        twice.apply_inbound(notification(1, 0));
        twice.apply_inbound(notification(1, 0));

        assert_eq!(once.snapshot(), twice.snapshot());
    }

    #[test]
    fn test_repeated_ids_keep_last_fields_with_monotonic_confirmed() {
        let mut store = NotificationStateStore::new();

        let mut first = notification(1, 0);
        first.confirmed = true;
        store.apply_inbound(first);

        let mut last = notification(1, 0);
        last.message = Some("edited".to_string());
        last.confirmed = false;
        store.apply_inbound(last);

        let entry = store.get(1).unwrap();
        assert_eq!(entry.message.as_deref(), Some("edited"));
        assert!(entry.confirmed, "confirmed must never revert");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_inbound_can_confirm() {
        let mut store = NotificationStateStore::new();
        store.apply_inbound(notification(1, 0));
        let mut read = notification(1, 0);
        read.confirmed = true;
        store.apply_inbound(read);
        assert!(store.get(1).unwrap().confirmed);
    }

    #[test]
    fn test_acknowledge_is_idempotent() {
        let mut store = NotificationStateStore::new();
        store.apply_inbound(notification(1, 0));

        assert!(store.acknowledge(1));
        let after_once = store.snapshot();
        assert!(!store.acknowledge(1));
        assert_eq!(store.snapshot(), after_once);
    }

    #[test]
    fn test_acknowledge_unknown_is_noop() {
        let mut store = NotificationStateStore::new();
        store.apply_inbound(notification(1, 0));
        assert!(!store.acknowledge(99));
        assert_eq!(store.len(), 1);
        assert_eq!(store.unconfirmed_count(), 1);
    }

    #[test]
    fn test_replace_all_drops_missing_entries() {
        let mut store = NotificationStateStore::new();
        store.apply_inbound(notification(1, 0));
        store.replace_all(vec![notification(2, 1), notification(3, 2)]);
        assert_eq!(ids(&store), vec![3, 2]);
    }

    #[test]
    fn test_replace_all_keeps_local_confirmation() {
        let mut store = NotificationStateStore::new();
        store.replace_all(vec![notification(1, 0)]);
        store.acknowledge(1);

        // Bulk refresh raced the upstream confirm.
        store.replace_all(vec![notification(1, 0)]);
        assert!(store.get(1).unwrap().confirmed);
    }

    #[test]
    fn test_clear_empties_store() {
        let mut store = NotificationStateStore::new();
        store.replace_all(vec![notification(1, 0), notification(2, 1), notification(3, 2)]);
        store.clear();
        assert!(store.is_empty());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_fetch_push_acknowledge_scenario() {
        let mut store = NotificationStateStore::new();
        store.replace_all(vec![notification(1, 0)]);
        store.apply_inbound(notification(2, 0));
        store.acknowledge(1);

        let snapshot = store.snapshot();
        let view: Vec<(NotificationId, bool)> =
            snapshot.iter().map(|n| (n.id, n.confirmed)).collect();
        assert_eq!(view, vec![(1, true), (2, false)]);
        assert_eq!(store.unconfirmed_count(), 1);
    }
}
