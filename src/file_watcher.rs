//! Change notification for a single file.
//!
//! The `notify` crate watches the file's parent directory (non-recursive),
//! because atomic replacement via rename swaps the inode and a watch on the
//! file itself would go stale after the first write. A named forwarder
//! thread filters raw events down to mutations of the one file name and
//! invokes the callback for each.
//!
//! Dropping the [`FileWatcher`] drops the OS watcher, which closes the
//! event channel and ends the forwarder thread.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

/// Classification of a file system event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File created.
    Create,
    /// Content or metadata changed.
    Modify,
    /// Renamed or moved; atomic replacement lands here.
    Rename,
    /// Deleted.
    Delete,
    /// Access and watcher-internal events.
    Other,
}

impl FileEventKind {
    /// Classify a raw `notify` event kind.
    pub fn from_notify(kind: &EventKind) -> Self {
        match kind {
            EventKind::Create(_) => Self::Create,
            EventKind::Modify(ModifyKind::Name(_)) => Self::Rename,
            EventKind::Modify(_) => Self::Modify,
            EventKind::Remove(_) => Self::Delete,
            _ => Self::Other,
        }
    }

    /// Whether the event can have changed the file's content.
    pub fn is_mutation(self) -> bool {
        self != Self::Other
    }
}

/// Whether `event` is a mutation touching a path named `file_name`.
fn touches(event: &Event, file_name: &OsString) -> bool {
    FileEventKind::from_notify(&event.kind).is_mutation()
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

/// Live watch on one file. Stops when dropped.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl FileWatcher {
    /// Call `on_change` (from a background thread) whenever `path` is
    /// created, written, replaced or removed.
    ///
    /// The parent directory is created if missing; the file need not exist.
    pub fn watch_file(path: &Path, on_change: impl Fn() + Send + 'static) -> Result<Self> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let file_name = path
            .file_name()
            .with_context(|| format!("{} has no file name", path.display()))?
            .to_os_string();

        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .context("Failed to create file watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch: {}", dir.display()))?;

        std::thread::Builder::new()
            .name("file-watch".to_string())
            .spawn(move || {
                while let Ok(result) = rx.recv() {
                    match result {
                        Ok(event) if touches(&event, &file_name) => on_change(),
                        Ok(_) => {}
                        Err(e) => log::warn!("File watcher error: {e}"),
                    }
                }
                log::debug!("File watcher for {:?} stopped", file_name);
            })
            .context("Failed to spawn file watcher thread")?;

        log::info!("Watching for changes: {}", path.display());
        Ok(Self {
            _watcher: watcher,
            path: path.to_path_buf(),
        })
    }

    /// The watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, RemoveKind, RenameMode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_classify_kinds() {
        assert_eq!(
            FileEventKind::from_notify(&EventKind::Create(CreateKind::File)),
            FileEventKind::Create
        );
        assert_eq!(
            FileEventKind::from_notify(&EventKind::Modify(ModifyKind::Name(RenameMode::To))),
            FileEventKind::Rename
        );
        assert_eq!(
            FileEventKind::from_notify(&EventKind::Modify(ModifyKind::Any)),
            FileEventKind::Modify
        );
        assert_eq!(
            FileEventKind::from_notify(&EventKind::Remove(RemoveKind::File)),
            FileEventKind::Delete
        );
        assert_eq!(
            FileEventKind::from_notify(&EventKind::Access(AccessKind::Read)),
            FileEventKind::Other
        );
    }

    #[test]
    fn test_touches_filters_by_name_and_kind() {
        let name = OsString::from("credentials.json");
        assert!(touches(
            &event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), "/c/credentials.json"),
            &name
        ));
        assert!(!touches(
            &event(EventKind::Create(CreateKind::File), "/c/credentials.json.tmp"),
            &name
        ));
        assert!(!touches(
            &event(EventKind::Access(AccessKind::Read), "/c/credentials.json"),
            &name
        ));
    }

    #[test]
    fn test_watch_file_in_missing_dir_creates_it() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("nested/credentials.json");
        let watcher = FileWatcher::watch_file(&path, || {}).unwrap();
        assert!(root.path().join("nested").is_dir());
        assert_eq!(watcher.path(), path.as_path());
    }

    #[test]
    fn test_write_triggers_callback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _watcher = FileWatcher::watch_file(&path, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        std::fs::write(dir.path().join("unrelated.txt"), "x").unwrap();
        std::fs::write(&path, "{}").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(hits.load(Ordering::SeqCst) > 0);
    }
}
