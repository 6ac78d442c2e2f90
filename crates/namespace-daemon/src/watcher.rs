//! File watcher with debouncing for the watch root.
//!
//! Uses notify-debouncer-mini for efficient file change detection. The
//! namespace is rebuilt wholesale on any change, so events carry no payload:
//! one `FileChanged` per debounced batch that touched a visible file.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Debounce period for change batches.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// Something under the watch root changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChanged;

/// Track last seen mtime to filter spurious events (Docker volume bug workaround)
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

/// File watcher that monitors the watch root.
pub struct FileWatcher {
    root: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileChanged>,
}

impl FileWatcher {
    /// Create a new file watcher for `root`, watched recursively.
    pub fn new(root: PathBuf) -> Result<Self> {
        // Canonicalize the path to resolve symlinks. On macOS, /var/folders/...
        // is actually /private/var/folders/..., and FSEvents needs the real path.
        let root = root.canonicalize().unwrap_or(root);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root_clone = root.clone();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            DEBOUNCE,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    // Evaluate every event so the mtime cache stays current.
                    let relevant = events
                        .iter()
                        .filter(|event| Self::is_relevant(&event.path, &root_clone, &mtime_cache))
                        .count();
                    if relevant > 0 {
                        debug!("{} file change(s) under watch root", relevant);
                        // Receiver dropped means the daemon is shutting down.
                        let _ = event_tx.send(FileChanged);
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            root,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Whether a debounced change to `path` should trigger a rebuild.
    fn is_relevant(path: &Path, root: &Path, mtime_cache: &MtimeCache) -> bool {
        let Ok(relative) = path.strip_prefix(root) else {
            return false;
        };
        let Some(relative_str) = relative.to_str() else {
            return false;
        };
        if relative_str.is_empty() {
            return false;
        }

        // Skip hidden files and directories
        if relative_str.starts_with('.') || relative_str.contains("/.") {
            return false;
        }

        let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
        let relative_path = relative.to_path_buf();
        match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) => {
                // Mtime unchanged - spurious event
                if cache.get(&relative_path) == Some(&mtime) {
                    return false;
                }
                cache.insert(relative_path, mtime);
            }
            Err(_) => {
                cache.remove(&relative_path);
            }
        }
        true
    }

    /// Get the receiver for change notifications.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileChanged> {
        &mut self.event_rx
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_and_foreign_paths_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache: MtimeCache = Arc::default();

        assert!(!FileWatcher::is_relevant(&dir.path().join(".git/index"), dir.path(), &cache));
        assert!(!FileWatcher::is_relevant(&dir.path().join("a/.hidden"), dir.path(), &cache));
        assert!(!FileWatcher::is_relevant(Path::new("/elsewhere/a.txt"), dir.path(), &cache));
    }

    #[test]
    fn test_unchanged_mtime_is_spurious() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "hello").unwrap();
        let cache: MtimeCache = Arc::default();

        assert!(FileWatcher::is_relevant(&file, dir.path(), &cache));
        assert!(!FileWatcher::is_relevant(&file, dir.path(), &cache));

        std::fs::remove_file(&file).unwrap();
        assert!(FileWatcher::is_relevant(&file, dir.path(), &cache));
    }
}
