//! Shared credential storage.
//!
//! A process-wide key/value store holding `accessToken`, `refreshToken`, and
//! `memberId`. Any execution context may mutate it (a login in another
//! process, a `durcit-sync session set` invocation); every context observes
//! mutations through [`CredentialStore::watch`].
//!
//! # Adapters
//!
//! - [`FileCredentialStore`]: JSON object in `credentials.json`, watched with
//!   OS file events. Writes go through a temp file and a rename so readers
//!   never see a half-written file.
//! - [`MemoryCredentialStore`]: cloneable handle over a shared map. Each
//!   clone behaves like a separate context sharing the same storage.

use std::collections::HashMap;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};

use crate::error::SyncError;
use crate::file_watcher::FileWatcher;

/// Bearer credential key.
pub const ACCESS_TOKEN_KEY: &str = "accessToken";
/// Refresh credential key.
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
/// Subject id key.
pub const MEMBER_ID_KEY: &str = "memberId";

/// Callback invoked after any mutation of the store.
pub type StorageNotifier = Arc<dyn Fn() + Send + Sync>;

/// Observable key/value credential store.
pub trait CredentialStore: Send {
    /// Read every key. A store that does not exist yet reads as empty.
    fn entries(&self) -> Result<HashMap<String, String>, SyncError>;

    /// Read one key.
    fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(self.entries()?.remove(key))
    }

    /// Apply several writes as one change: `Some` sets the key, `None`
    /// deletes it. Watchers never observe a partially applied batch.
    fn write_batch(&self, changes: &[(&str, Option<&str>)]) -> Result<()>;

    /// Write one key.
    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.write_batch(&[(key, Some(value))])
    }

    /// Delete one key. Missing keys are fine.
    fn remove(&self, key: &str) -> Result<()> {
        self.write_batch(&[(key, None)])
    }

    /// Delete every key.
    fn clear(&self) -> Result<()>;

    /// Register a change notifier. The notifier may run on any thread.
    fn watch(&mut self, notifier: StorageNotifier) -> Result<()>;
}

fn apply_changes(entries: &mut HashMap<String, String>, changes: &[(&str, Option<&str>)]) {
    for (key, value) in changes {
        match value {
            Some(value) => {
                entries.insert((*key).to_string(), (*value).to_string());
            }
            None => {
                entries.remove(*key);
            }
        }
    }
}

// ============================================================================
// File adapter
// ============================================================================

/// Credential store persisted as a JSON object on disk.
pub struct FileCredentialStore {
    path: PathBuf,
    watcher: Option<FileWatcher>,
}

impl std::fmt::Debug for FileCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCredentialStore")
            .field("path", &self.path)
            .field("watching", &self.watcher.is_some())
            .finish()
    }
}

impl FileCredentialStore {
    /// Open a store at `path`. The file is created lazily on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            watcher: None,
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_entries(&self, entries: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(entries)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;

        // Owner read/write only
        #[cfg(unix)]
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;

        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn update(&self, mutate: impl FnOnce(&mut HashMap<String, String>)) -> Result<()> {
        // An unreadable file is overwritten rather than blocking logout/login.
        let mut entries = self.entries().unwrap_or_else(|e| {
            log::warn!("[Session] Replacing unreadable credential file: {e}");
            HashMap::new()
        });
        mutate(&mut entries);
        self.write_entries(&entries)
    }
}

impl CredentialStore for FileCredentialStore {
    fn entries(&self) -> Result<HashMap<String, String>, SyncError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(SyncError::StorageRead(format!("{}: {e}", self.path.display()))),
        };
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| SyncError::StorageRead(format!("{}: {e}", self.path.display())))
    }

    fn write_batch(&self, changes: &[(&str, Option<&str>)]) -> Result<()> {
        self.update(|entries| apply_changes(entries, changes))
    }

    fn clear(&self) -> Result<()> {
        self.write_entries(&HashMap::new())
    }

    fn watch(&mut self, notifier: StorageNotifier) -> Result<()> {
        let watcher = FileWatcher::watch_file(&self.path, move || notifier())?;
        self.watcher = Some(watcher);
        Ok(())
    }
}

// ============================================================================
// In-memory adapter
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    values: HashMap<String, String>,
    watchers: Vec<StorageNotifier>,
}

/// In-memory credential store shared between clones.
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl std::fmt::Debug for MemoryCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCredentialStore").finish_non_exhaustive()
    }
}

impl MemoryCredentialStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate(&self, f: impl FnOnce(&mut HashMap<String, String>)) {
        let watchers = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut inner.values);
            inner.watchers.clone()
        };
        // Notify outside the lock so watchers may read back.
        for notify in watchers {
            notify();
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn entries(&self) -> Result<HashMap<String, String>, SyncError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.values.clone())
    }

    fn write_batch(&self, changes: &[(&str, Option<&str>)]) -> Result<()> {
        self.mutate(|values| apply_changes(values, changes));
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.mutate(HashMap::clear);
        Ok(())
    }

    fn watch(&mut self, notifier: StorageNotifier) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.watchers.push(notifier);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn counter() -> (StorageNotifier, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let notifier: StorageNotifier = Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (notifier, count)
    }

    #[test]
    fn test_file_store_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("credentials.json"));
        assert!(store.entries().unwrap().is_empty());
        assert_eq!(store.get(MEMBER_ID_KEY).unwrap(), None);
    }

    #[test]
    fn test_file_store_set_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("credentials.json"));

        store.set(MEMBER_ID_KEY, "7").unwrap();
        store.set(ACCESS_TOKEN_KEY, "abc").unwrap();
        assert_eq!(store.get(MEMBER_ID_KEY).unwrap().as_deref(), Some("7"));

        store.remove(MEMBER_ID_KEY).unwrap();
        assert_eq!(store.get(MEMBER_ID_KEY).unwrap(), None);
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("abc"));

        store.clear().unwrap();
        assert!(store.entries().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_is_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let writer = FileCredentialStore::new(&path);
        let reader = FileCredentialStore::new(&path);

        writer.set(MEMBER_ID_KEY, "11").unwrap();
        assert_eq!(reader.get(MEMBER_ID_KEY).unwrap().as_deref(), Some("11"));
    }

    #[test]
    fn test_file_store_garbage_is_storage_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "{ not json").unwrap();

        let store = FileCredentialStore::new(&path);
        assert!(matches!(store.entries(), Err(SyncError::StorageRead(_))));

        // Writes recover from a corrupt file.
        store.set(MEMBER_ID_KEY, "3").unwrap();
        assert_eq!(store.get(MEMBER_ID_KEY).unwrap().as_deref(), Some("3"));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_permissions_are_private() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        FileCredentialStore::new(&path).set(MEMBER_ID_KEY, "1").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_file_store_watch_reports_external_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let mut observed = FileCredentialStore::new(&path);
        let (notifier, count) = counter();
        observed.watch(notifier).unwrap();

        FileCredentialStore::new(&path).set(MEMBER_ID_KEY, "5").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(count.load(Ordering::SeqCst) > 0, "watcher never fired");
    }

    #[test]
    fn test_memory_store_notifies_every_clone() {
        let mut tab_a = MemoryCredentialStore::new();
        let mut tab_b = tab_a.clone();
        let (notify_a, count_a) = counter();
        let (notify_b, count_b) = counter();
        tab_a.watch(notify_a).unwrap();
        tab_b.watch(notify_b).unwrap();

        tab_b.set(MEMBER_ID_KEY, "9").unwrap();

        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
        assert_eq!(tab_a.get(MEMBER_ID_KEY).unwrap().as_deref(), Some("9"));
    }

    #[test]
    fn test_file_store_batch_is_one_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("credentials.json"));
        store.set(MEMBER_ID_KEY, "A").unwrap();
        store.set(REFRESH_TOKEN_KEY, "refresh-A").unwrap();

        store
            .write_batch(&[
                (ACCESS_TOKEN_KEY, Some("access-B")),
                (REFRESH_TOKEN_KEY, None),
                (MEMBER_ID_KEY, Some("B")),
            ])
            .unwrap();

        let entries = store.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[MEMBER_ID_KEY], "B");
        assert_eq!(entries[ACCESS_TOKEN_KEY], "access-B");
        assert!(!dir.path().join("credentials.json.tmp").exists());
    }

    #[test]
    fn test_memory_store_batch_notifies_once_with_every_key_applied() {
        let mut store = MemoryCredentialStore::new();
        store.set(MEMBER_ID_KEY, "A").unwrap();

        let reader = store.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store
            .watch(Arc::new(move || {
                let entries = reader.entries().unwrap();
                sink.lock().unwrap().push((
                    entries.get(MEMBER_ID_KEY).cloned(),
                    entries.get(ACCESS_TOKEN_KEY).cloned(),
                ));
            }))
            .unwrap();

        store
            .write_batch(&[
                (ACCESS_TOKEN_KEY, Some("access-B")),
                (MEMBER_ID_KEY, Some("B")),
            ])
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(Some("B".to_string()), Some("access-B".to_string()))]
        );
    }

    #[test]
    fn test_memory_store_clear() {
        let store = MemoryCredentialStore::new();
        store.set(MEMBER_ID_KEY, "1").unwrap();
        store.set(ACCESS_TOKEN_KEY, "t").unwrap();
        store.clear().unwrap();
        assert!(store.entries().unwrap().is_empty());
    }
}
