//! Folders registered for synchronization and their scan progress.

use crate::events::{CoreEvent, EventBus};
use crate::records::normalize_path;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Speed label shown once a folder's scan has completed.
pub const SYNCED: &str = "Synced";

#[derive(Debug, Error, PartialEq)]
pub enum FolderError {
    #[error("Folder path cannot be empty")]
    EmptyPath,

    #[error("Folder path must be absolute: {0}")]
    NotAbsolute(String),

    #[error("Folder path must not contain '..': {0}")]
    ParentSegment(String),

    #[error("Folder is not registered: {0}")]
    UnknownFolder(String),
}

pub type Result<T> = std::result::Result<T, FolderError>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncFolder {
    pub path: String,
    /// Scan completion, 0-100
    pub progress: f64,
    /// Human-readable speed, or "Synced"
    pub speed: String,
}

impl SyncFolder {
    pub fn is_synced(&self) -> bool {
        self.speed == SYNCED
    }
}

#[derive(Debug, Clone)]
struct FolderEntry {
    folder: SyncFolder,
    scanning: bool,
}

/// Check a folder path before any task is created for it.
///
/// Accepts `/unix/paths` and `C:\windows` or `C:/windows` paths.
/// Returns the path with trailing separators removed.
pub fn validate_folder_path(path: &str) -> Result<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(FolderError::EmptyPath);
    }
    let bytes = trimmed.as_bytes();
    let is_drive = bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\');
    if !trimmed.starts_with('/') && !is_drive {
        return Err(FolderError::NotAbsolute(trimmed.to_string()));
    }
    if trimmed.split(['/', '\\']).any(|s| s == "..") {
        return Err(FolderError::ParentSegment(trimmed.to_string()));
    }
    let without_trailing = trimmed.trim_end_matches(['/', '\\']);
    if without_trailing.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(without_trailing.to_string())
    }
}

/// Registry of sync folders, in registration order.
#[derive(Default)]
pub struct SyncFolderRegistry {
    folders: RwLock<Vec<FolderEntry>>,
    /// Paths unregistered during this session
    withdrawn: RwLock<Vec<String>>,
    events: Option<Arc<EventBus>>,
}

impl SyncFolderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: Arc<EventBus>) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    fn publish(&self, folder: &SyncFolder, removed: bool) {
        if let Some(events) = &self.events {
            events.emit(CoreEvent::FolderChanged {
                folder: folder.clone(),
                removed,
            });
        }
    }

    fn update(&self, path: &str, f: impl FnOnce(&mut FolderEntry)) -> Result<SyncFolder> {
        let path = validate_folder_path(path)?;
        let folder = {
            let mut folders = self.folders.write().unwrap_or_else(|e| e.into_inner());
            let entry = folders
                .iter_mut()
                .find(|e| e.folder.path == path)
                .ok_or_else(|| FolderError::UnknownFolder(path.clone()))?;
            f(entry);
            entry.folder.clone()
        };
        self.publish(&folder, false);
        Ok(folder)
    }

    /// Register a folder with progress 0. Registering twice returns the existing entry.
    pub fn register(&self, path: &str) -> Result<SyncFolder> {
        let path = validate_folder_path(path)?;
        let folder = {
            let mut folders = self.folders.write().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = folders.iter().find(|e| e.folder.path == path) {
                return Ok(existing.folder.clone());
            }
            self.withdrawn
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|w| *w != path);
            let folder = SyncFolder {
                path,
                progress: 0.0,
                speed: String::new(),
            };
            folders.push(FolderEntry {
                folder: folder.clone(),
                scanning: false,
            });
            folder
        };
        self.publish(&folder, false);
        Ok(folder)
    }

    pub fn unregister(&self, path: &str) -> Result<SyncFolder> {
        let path = validate_folder_path(path)?;
        self.withdraw(&path)?
            .ok_or(FolderError::UnknownFolder(path))
    }

    /// Remove a folder if it is registered, and withdraw its records from
    /// the namespace either way.
    pub fn withdraw(&self, path: &str) -> Result<Option<SyncFolder>> {
        let path = validate_folder_path(path)?;
        let removed = {
            let mut folders = self.folders.write().unwrap_or_else(|e| e.into_inner());
            folders
                .iter()
                .position(|e| e.folder.path == path)
                .map(|index| folders.remove(index).folder)
        };
        {
            let mut withdrawn = self.withdrawn.write().unwrap_or_else(|e| e.into_inner());
            if !withdrawn.contains(&path) {
                withdrawn.push(path);
            }
        }
        if let Some(folder) = &removed {
            self.publish(folder, true);
        }
        Ok(removed)
    }

    /// Begin a scan. Progress resets to 0 only for a folder not yet synced.
    pub fn start_scan(&self, path: &str) -> Result<SyncFolder> {
        self.update(path, |entry| {
            entry.scanning = true;
            if !entry.folder.is_synced() {
                entry.folder.progress = 0.0;
            }
        })
    }

    /// Report scan progress. Progress never decreases while a scan is active;
    /// reaching 100 marks the folder synced and ends the scan. Reports
    /// arriving while no scan is active are ignored.
    pub fn report_progress(&self, path: &str, progress: f64, speed: Option<&str>) -> Result<SyncFolder> {
        self.update(path, |entry| {
            if !entry.scanning || !progress.is_finite() {
                return;
            }
            entry.folder.progress = entry.folder.progress.max(progress.clamp(0.0, 100.0));
            if entry.folder.progress >= 100.0 {
                entry.folder.progress = 100.0;
                entry.folder.speed = SYNCED.to_string();
                entry.scanning = false;
            } else if let Some(speed) = speed {
                entry.folder.speed = speed.to_string();
            }
        })
    }

    /// End a scan without reaching 100 (scan failed or was abandoned).
    pub fn abort_scan(&self, path: &str) -> Result<SyncFolder> {
        self.update(path, |entry| entry.scanning = false)
    }

    pub fn is_scanning(&self, path: &str) -> bool {
        let Ok(path) = validate_folder_path(path) else {
            return false;
        };
        self.folders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|e| e.folder.path == path && e.scanning)
    }

    pub fn get(&self, path: &str) -> Option<SyncFolder> {
        let path = validate_folder_path(path).ok()?;
        self.folders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|e| e.folder.path == path)
            .map(|e| e.folder.clone())
    }

    pub fn snapshot(&self) -> Vec<SyncFolder> {
        self.folders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.folder.clone())
            .collect()
    }

    /// Whether a sync-source record path lies inside a registered folder.
    pub fn covers(&self, file_path: &str) -> bool {
        self.folders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|e| path_within(file_path, &e.folder.path))
    }

    /// Whether a sync-source record belongs to a folder unregistered this
    /// session and not to any folder still registered.
    pub fn is_withdrawn(&self, file_path: &str) -> bool {
        let withdrawn = self
            .withdrawn
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|w| path_within(file_path, w));
        withdrawn && !self.covers(file_path)
    }
}

/// Whether `file_path` equals `folder` or lies below it, segment-wise.
pub fn path_within(file_path: &str, folder: &str) -> bool {
    let file_path = normalize_path(&file_path.replace('\\', "/"));
    let root = normalize_path(&folder.replace('\\', "/"));
    root.is_empty()
        || file_path == root
        || file_path
            .strip_prefix(root.as_str())
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_folder_path() {
        assert_eq!(validate_folder_path("/home/user/Docs/").unwrap(), "/home/user/Docs");
        assert_eq!(validate_folder_path("C:\\Users\\me").unwrap(), "C:\\Users\\me");
        assert_eq!(validate_folder_path("/").unwrap(), "/");
        assert_eq!(validate_folder_path("  ").unwrap_err(), FolderError::EmptyPath);
        assert!(matches!(
            validate_folder_path("relative/dir").unwrap_err(),
            FolderError::NotAbsolute(_)
        ));
        assert!(matches!(
            validate_folder_path("/home/../etc").unwrap_err(),
            FolderError::ParentSegment(_)
        ));
    }

    #[test]
    fn test_sync_folder_lifecycle() {
        let registry = SyncFolderRegistry::new();
        let folder = registry.register("/home/user/Docs").unwrap();
        assert_eq!(folder.progress, 0.0);

        registry.start_scan("/home/user/Docs").unwrap();
        for p in [0.0, 25.0, 60.0, 100.0] {
            registry
                .report_progress("/home/user/Docs", p, Some("2 MB/s"))
                .unwrap();
        }

        let folder = registry.get("/home/user/Docs").unwrap();
        assert_eq!(folder.progress, 100.0);
        assert_eq!(folder.speed, SYNCED);
        assert!(!registry.is_scanning("/home/user/Docs"));

        registry.unregister("/home/user/Docs").unwrap();
        assert!(registry.get("/home/user/Docs").is_none());
    }

    #[test]
    fn test_progress_is_monotonic_during_scan() {
        let registry = SyncFolderRegistry::new();
        registry.register("/data").unwrap();
        registry.start_scan("/data").unwrap();
        registry.report_progress("/data", 50.0, Some("1 MB/s")).unwrap();
        let folder = registry.report_progress("/data", 30.0, Some("1 MB/s")).unwrap();
        assert_eq!(folder.progress, 50.0);
    }

    #[test]
    fn test_rescan_of_synced_folder_keeps_progress() {
        let registry = SyncFolderRegistry::new();
        registry.register("/data").unwrap();
        registry.start_scan("/data").unwrap();
        registry.report_progress("/data", 100.0, None).unwrap();

        let folder = registry.start_scan("/data").unwrap();
        assert_eq!(folder.progress, 100.0);
        assert!(folder.is_synced());
    }

    #[test]
    fn test_fresh_scan_resets_unsynced_progress() {
        let registry = SyncFolderRegistry::new();
        registry.register("/data").unwrap();
        registry.start_scan("/data").unwrap();
        registry.report_progress("/data", 40.0, None).unwrap();
        registry.abort_scan("/data").unwrap();

        let folder = registry.start_scan("/data").unwrap();
        assert_eq!(folder.progress, 0.0);
    }

    #[test]
    fn test_progress_ignored_without_active_scan() {
        let registry = SyncFolderRegistry::new();
        registry.register("/data").unwrap();
        let folder = registry.report_progress("/data", 70.0, None).unwrap();
        assert_eq!(folder.progress, 0.0);
    }

    #[test]
    fn test_register_twice_returns_existing() {
        let registry = SyncFolderRegistry::new();
        registry.register("/data").unwrap();
        registry.register("/data/").unwrap();
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_unknown_folder_errors() {
        let registry = SyncFolderRegistry::new();
        assert!(matches!(
            registry.unregister("/nope").unwrap_err(),
            FolderError::UnknownFolder(_)
        ));
        assert!(registry.start_scan("/nope").is_err());
    }

    #[test]
    fn test_covers_matches_whole_segments() {
        let registry = SyncFolderRegistry::new();
        registry.register("/home/user/Docs").unwrap();
        assert!(registry.covers("home/user/Docs/a.txt"));
        assert!(registry.covers("/home/user/Docs"));
        assert!(!registry.covers("/home/user/Docs2/a.txt"));
        assert!(!registry.covers("/home/other/a.txt"));
    }

    #[test]
    fn test_unregistered_folder_is_withdrawn_until_registered_again() {
        let registry = SyncFolderRegistry::new();
        registry.register("/data").unwrap();
        assert!(!registry.is_withdrawn("/data/a.txt"));

        registry.unregister("/data").unwrap();
        assert!(registry.is_withdrawn("/data/a.txt"));
        assert!(!registry.is_withdrawn("/other/a.txt"));

        registry.register("/data/keep").unwrap();
        assert!(!registry.is_withdrawn("/data/keep/b.txt"));
        assert!(registry.is_withdrawn("/data/a.txt"));

        registry.register("/data").unwrap();
        assert!(!registry.is_withdrawn("/data/a.txt"));
    }

    #[test]
    fn test_withdraw_unknown_folder() {
        let registry = SyncFolderRegistry::new();
        assert_eq!(registry.withdraw("/remote/only").unwrap(), None);
        assert!(registry.is_withdrawn("/remote/only/a.txt"));
    }
}
