//! FileService trait abstraction for the external file/device service.
//!
//! Implementations:
//! - `InMemoryFileService` - For testing
//! - `HttpFileService` (in namespace-daemon) - REST client

use crate::device::{DevicePrediction, DeviceTelemetry};
use crate::records::{FileRecord, Source};
use async_trait::async_trait;
use futures::channel::oneshot;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServiceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed response: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Result reported by folder add/remove/scan operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderOutcome {
    Success,
    DeviceNotFound,
    Unauthorized,
    Error,
}

/// Cloud object listing from `s3-files`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloudListing {
    pub files: Vec<FileRecord>,
    pub s3_url: Option<String>,
}

/// Scan progress callback: `(percent, human-readable speed)`.
pub type ScanProgressFn = Arc<dyn Fn(f64, Option<String>) + Send + Sync>;

/// Operations consumed from the file/device service.
#[async_trait]
pub trait FileService: Send + Sync {
    /// `GET devices`
    async fn devices(&self) -> Result<Vec<DeviceTelemetry>>;

    /// `GET device-predictions`
    async fn device_predictions(&self) -> Result<Vec<DevicePrediction>>;

    /// `POST files-by-path`
    async fn files_by_path(&self, global_file_path: &str) -> Result<Vec<FileRecord>>;

    /// `POST sync-files-by-path`
    async fn sync_files_by_path(&self, global_file_path: Option<&str>) -> Result<Vec<FileRecord>>;

    /// `POST shared-files`, already unwrapped from the nested response
    async fn shared_files(&self, username: &str) -> Result<Vec<FileRecord>>;

    /// `GET s3-files`
    async fn s3_files(&self, username: &str) -> Result<CloudListing>;

    async fn add_folder(&self, device: &str, path: &str) -> Result<FolderOutcome>;

    async fn remove_folder(&self, device: &str, path: &str) -> Result<FolderOutcome>;

    /// Scan a folder, reporting progress through `progress` until it resolves.
    async fn scan_folder(&self, device: &str, path: &str, progress: ScanProgressFn) -> Result<FolderOutcome>;
}

#[derive(Default)]
struct MemoryState {
    devices: Vec<DeviceTelemetry>,
    predictions: Vec<DevicePrediction>,
    records: HashMap<Source, Vec<FileRecord>>,
    s3_url: Option<String>,
    failing: HashSet<Source>,
    outcomes: HashMap<String, FolderOutcome>,
    hanging: HashSet<String>,
    scanned: Vec<String>,
    scan_steps: Vec<f64>,
    held: HashMap<String, oneshot::Receiver<()>>,
}

/// In-memory file service for testing.
pub struct InMemoryFileService {
    state: Mutex<MemoryState>,
}

impl Default for InMemoryFileService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFileService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                scan_steps: vec![0.0, 50.0, 100.0],
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_devices(&self, devices: Vec<DeviceTelemetry>) {
        self.state().devices = devices;
    }

    pub fn set_predictions(&self, predictions: Vec<DevicePrediction>) {
        self.state().predictions = predictions;
    }

    /// Replace the records returned for one source.
    pub fn set_records(&self, source: Source, records: Vec<FileRecord>) {
        self.state().records.insert(source, records);
    }

    pub fn set_s3_url(&self, url: &str) {
        self.state().s3_url = Some(url.to_string());
    }

    /// Make fetches for `source` fail with a transport error.
    pub fn set_failing(&self, source: Source, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing.insert(source);
        } else {
            state.failing.remove(&source);
        }
    }

    /// Outcome returned by folder operations on `path` (default `Success`).
    pub fn set_outcome(&self, path: &str, outcome: FolderOutcome) {
        self.state().outcomes.insert(path.to_string(), outcome);
    }

    /// Make scans of `path` never resolve.
    pub fn set_hanging(&self, path: &str) {
        self.state().hanging.insert(path.to_string());
    }

    /// Progress values reported by every scan.
    pub fn set_scan_steps(&self, steps: Vec<f64>) {
        self.state().scan_steps = steps;
    }

    /// Hold the next call keyed by `key` until the returned sender fires or
    /// is dropped. Keys are a scanned folder path or a source name such as
    /// `"files"`.
    pub fn hold(&self, key: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state().held.insert(key.to_string(), rx);
        tx
    }

    async fn wait_if_held(&self, key: &str) {
        let held = self.state().held.remove(key);
        if let Some(rx) = held {
            let _ = rx.await;
        }
    }

    /// Paths scanned so far, in call order.
    pub fn scanned(&self) -> Vec<String> {
        self.state().scanned.clone()
    }

    fn fetch(&self, source: Source) -> Result<Vec<FileRecord>> {
        let state = self.state();
        if state.failing.contains(&source) {
            return Err(ServiceError::Transport(format!("{} fetch failed", source)));
        }
        Ok(state.records.get(&source).cloned().unwrap_or_default())
    }

    fn outcome(&self, path: &str) -> FolderOutcome {
        self.state()
            .outcomes
            .get(path)
            .copied()
            .unwrap_or(FolderOutcome::Success)
    }
}

#[async_trait]
impl FileService for InMemoryFileService {
    async fn devices(&self) -> Result<Vec<DeviceTelemetry>> {
        Ok(self.state().devices.clone())
    }

    async fn device_predictions(&self) -> Result<Vec<DevicePrediction>> {
        Ok(self.state().predictions.clone())
    }

    async fn files_by_path(&self, _global_file_path: &str) -> Result<Vec<FileRecord>> {
        self.wait_if_held(Source::Files.as_str()).await;
        self.fetch(Source::Files)
    }

    async fn sync_files_by_path(&self, _global_file_path: Option<&str>) -> Result<Vec<FileRecord>> {
        self.wait_if_held(Source::Sync.as_str()).await;
        self.fetch(Source::Sync)
    }

    async fn shared_files(&self, _username: &str) -> Result<Vec<FileRecord>> {
        self.wait_if_held(Source::Shared.as_str()).await;
        self.fetch(Source::Shared)
    }

    async fn s3_files(&self, _username: &str) -> Result<CloudListing> {
        self.wait_if_held(Source::S3files.as_str()).await;
        let files = self.fetch(Source::S3files)?;
        Ok(CloudListing {
            files,
            s3_url: self.state().s3_url.clone(),
        })
    }

    async fn add_folder(&self, _device: &str, path: &str) -> Result<FolderOutcome> {
        Ok(self.outcome(path))
    }

    async fn remove_folder(&self, _device: &str, path: &str) -> Result<FolderOutcome> {
        Ok(self.outcome(path))
    }

    async fn scan_folder(&self, _device: &str, path: &str, progress: ScanProgressFn) -> Result<FolderOutcome> {
        let (hanging, steps) = {
            let mut state = self.state();
            state.scanned.push(path.to_string());
            (state.hanging.contains(path), state.scan_steps.clone())
        };
        if hanging {
            futures::future::pending::<()>().await;
        }
        self.wait_if_held(path).await;
        let outcome = self.outcome(path);
        if outcome == FolderOutcome::Success {
            for step in steps {
                progress(step, Some("1 MB/s".to_string()));
            }
        }
        Ok(outcome)
    }
}
