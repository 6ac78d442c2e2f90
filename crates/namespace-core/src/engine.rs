//! Engine: the service object tying the registries to the external services.
//!
//! The engine owns the device registry, task ledger, sync folder registry,
//! transfer coordinator, the last fetched records per category and the
//! published namespace tree. Every user-visible operation goes through here
//! so the daemon (or any other front end) only forwards calls and listens to
//! the event bus.

use crate::channel::RelayChannel;
use crate::device::{Device, DeviceRegistry, ScoreError, ScoreWeights};
use crate::events::{now_ms, CoreEvent, EventBus};
use crate::folders::{path_within, validate_folder_path, FolderError, SyncFolderRegistry};
use crate::frames::InboundFrame;
use crate::namespace::{build, TreeNode};
use crate::records::{FileRecord, Source};
use crate::service::{self, FileService, FolderOutcome, ScanProgressFn, ServiceError};
use crate::tasks::{FailureKind, Task, TaskFailure, TaskId, TaskLedger};
use crate::transfer::{Direction, FrameOutcome, TransferCoordinator, TransferError, TransferRecord};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Account name sent with relay frames and user-scoped fetches
    pub username: String,
    pub weights: ScoreWeights,
    /// `global_file_path` used for the files listing; empty means everything
    pub root_path: String,
}

impl EngineConfig {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            weights: ScoreWeights::default(),
            root_path: String::new(),
        }
    }
}

/// Last successful listing of one category.
struct CachedSource {
    /// Rebuild generation that fetched these records
    generation: u64,
    records: Vec<FileRecord>,
}

/// Cached listings plus a version bumped on every change to what the
/// namespace would show.
#[derive(Default)]
struct RecordCache {
    version: u64,
    sources: HashMap<Source, CachedSource>,
}

struct Published {
    /// Number of trees published so far
    generation: u64,
    /// Cache version the tree was built from
    version: u64,
    tree: Arc<TreeNode>,
}

pub struct Engine {
    config: EngineConfig,
    service: Arc<dyn FileService>,
    events: Arc<EventBus>,
    devices: Arc<DeviceRegistry>,
    ledger: Arc<TaskLedger>,
    folders: Arc<SyncFolderRegistry>,
    transfers: TransferCoordinator,
    cache: Mutex<RecordCache>,
    s3_url: RwLock<Option<String>>,
    published: RwLock<Published>,
    next_generation: AtomicU64,
}

impl Engine {
    /// Create an engine. Fails if the configured weights are invalid.
    pub fn new(
        config: EngineConfig,
        service: Arc<dyn FileService>,
        channel: Arc<dyn RelayChannel>,
    ) -> Result<Self, ScoreError> {
        config.weights.validate()?;
        let events = Arc::new(EventBus::new());
        let ledger = Arc::new(TaskLedger::with_events(Arc::clone(&events)));
        let folders = Arc::new(SyncFolderRegistry::with_events(Arc::clone(&events)));
        let transfers = TransferCoordinator::new(channel, config.username.clone(), Arc::clone(&ledger))
            .with_events(Arc::clone(&events));
        Ok(Self {
            config,
            service,
            events,
            devices: Arc::new(DeviceRegistry::new()),
            ledger,
            folders,
            transfers,
            cache: Mutex::new(RecordCache::default()),
            s3_url: RwLock::new(None),
            published: RwLock::new(Published {
                generation: 0,
                version: 0,
                tree: Arc::new(build(&[], &[])),
            }),
            next_generation: AtomicU64::new(0),
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn ledger(&self) -> &Arc<TaskLedger> {
        &self.ledger
    }

    pub fn folders(&self) -> &Arc<SyncFolderRegistry> {
        &self.folders
    }

    pub fn transfers(&self) -> &TransferCoordinator {
        &self.transfers
    }

    /// The most recently published namespace tree.
    pub fn namespace(&self) -> Arc<TreeNode> {
        Arc::clone(&self.published.read().unwrap_or_else(|e| e.into_inner()).tree)
    }

    /// Generation of the published tree (0 before the first rebuild).
    pub fn generation(&self) -> u64 {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .generation
    }

    /// Base URL for cloud objects, as last reported by the cloud listing.
    pub fn s3_url(&self) -> Option<String> {
        self.s3_url.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Highest-scoring online device among `candidates`.
    pub fn best_device_for(&self, candidates: &[&str]) -> Option<Device> {
        self.devices.best_device_for(candidates)
    }

    /// Fetch telemetry and predictions, then rescore every device.
    ///
    /// Fetch failures are logged; the registry keeps its last-known state.
    pub async fn refresh_devices(&self) -> Vec<Device> {
        let (telemetry, predictions) =
            futures::join!(self.service.devices(), self.service.device_predictions());

        match telemetry {
            Ok(telemetry) => {
                for t in telemetry {
                    if let Err(e) = self.devices.upsert_telemetry(t) {
                        warn!("Skipping device: {}", e);
                    }
                }
            }
            Err(e) => warn!("Device fetch failed: {}", e),
        }
        match predictions {
            Ok(predictions) => {
                let applied = self.devices.apply_predictions(predictions);
                debug!("Applied predictions to {} devices", applied);
            }
            Err(e) => warn!("Prediction fetch failed: {}", e),
        }

        match self.devices.rescore(&self.config.weights, Utc::now()) {
            Ok(scored) => {
                self.events.emit(CoreEvent::DevicesScored {
                    count: scored.len(),
                    timestamp: now_ms(),
                });
                scored
            }
            Err(e) => {
                warn!("Rescoring failed: {}", e);
                self.devices.snapshot()
            }
        }
    }

    /// Fetch all four categories concurrently, rebuild and publish the tree.
    ///
    /// A category whose fetch fails or comes back empty keeps its previous
    /// records. Returns `None` when a tree built from newer cached records
    /// was published first; the result of this one is then discarded.
    pub async fn rebuild_namespace(&self) -> Option<Arc<TreeNode>> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let username = self.config.username.as_str();
        let (files, sync, shared, cloud) = futures::join!(
            self.service.files_by_path(&self.config.root_path),
            self.service.sync_files_by_path(None),
            self.service.shared_files(username),
            self.service.s3_files(username),
        );
        let cloud = cloud.map(|listing| {
            if let Some(url) = listing.s3_url {
                *self.s3_url.write().unwrap_or_else(|e| e.into_inner()) = Some(url);
            }
            listing.files
        });

        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            for (source, fetched) in [
                (Source::Files, files),
                (Source::Sync, sync),
                (Source::Shared, shared),
                (Source::S3files, cloud),
            ] {
                if absorb(&mut cache.sources, generation, source, fetched) {
                    cache.version += 1;
                }
            }
        }

        self.publish()
    }

    /// Entry point for the change watcher: any change means "rebuild".
    pub async fn on_file_changed(&self) -> Option<Arc<TreeNode>> {
        debug!("File change reported, rebuilding namespace");
        self.rebuild_namespace().await
    }

    /// Rebuild from cached records without fetching, after folder
    /// visibility changed.
    fn recompose(&self) -> Option<Arc<TreeNode>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).version += 1;
        self.publish()
    }

    /// Build a tree from the current cache and publish it.
    fn publish(&self) -> Option<Arc<TreeNode>> {
        let (version, records) = {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            let records: Vec<FileRecord> = Source::ALL
                .iter()
                .filter_map(|source| cache.sources.get(source))
                .flat_map(|cached| cached.records.iter())
                .filter(|r| r.source != Source::Sync || !self.folders.is_withdrawn(&r.file_path))
                .cloned()
                .collect();
            (cache.version, records)
        };
        let tree = Arc::new(build(&records, &self.devices.snapshot()));
        self.install(version, tree)
    }

    /// Publish `tree` unless a tree built from a newer cache version is
    /// already published.
    fn install(&self, version: u64, tree: Arc<TreeNode>) -> Option<Arc<TreeNode>> {
        let nodes = tree.node_count();
        let generation = {
            let mut published = self.published.write().unwrap_or_else(|e| e.into_inner());
            if version < published.version {
                debug!(
                    "Discarding namespace built from cache version {} (published {})",
                    version, published.version
                );
                return None;
            }
            published.generation += 1;
            published.version = version;
            published.tree = Arc::clone(&tree);
            published.generation
        };

        self.events.emit(CoreEvent::NamespaceRebuilt {
            generation,
            nodes,
            timestamp: now_ms(),
        });
        Some(tree)
    }

    fn progress(&self, id: TaskId, progress: u8, message: String) {
        if let Err(e) = self.ledger.update_task(id, progress, message) {
            warn!("Task update failed: {}", e);
        }
    }

    fn complete(&self, id: TaskId, message: String) {
        if let Err(e) = self.ledger.complete_task(id, message) {
            warn!("Task update failed: {}", e);
        }
    }

    fn fail(&self, id: TaskId, failure: TaskFailure) {
        if failure.is_unauthorized() {
            warn!("Task {} not authorized: {}", id, failure.title);
        }
        if let Err(e) = self.ledger.fail_task(id, failure) {
            warn!("Task update failed: {}", e);
        }
    }

    fn task(&self, task: Task) -> Task {
        self.ledger.get(task.task_id).unwrap_or(task)
    }

    /// Register a sync folder on `device`.
    ///
    /// The path is validated before any task exists; a rejected path
    /// returns an error and leaves the ledger untouched.
    pub async fn add_sync_folder(&self, device: &str, path: &str) -> Result<Task, FolderError> {
        let path = validate_folder_path(path)?;
        let task = self
            .ledger
            .add_task(format!("Add sync folder {}", path), Some(device));
        self.progress(task.task_id, 0, format!("Adding {}", path));

        let result = self.service.add_folder(device, &path).await;
        match folder_failure("add", device, &path, &result) {
            None => match self.folders.register(&path) {
                Ok(_) => {
                    info!("Sync folder {} added on {}", path, device);
                    self.complete(task.task_id, format!("Added {}", path));
                }
                Err(e) => self.fail(task.task_id, registry_failure("add", &e)),
            },
            Some(failure) => self.fail(task.task_id, failure),
        }
        Ok(self.task(task))
    }

    /// Unregister a sync folder; its records disappear from the next tree.
    pub async fn remove_sync_folder(&self, device: &str, path: &str) -> Result<Task, FolderError> {
        let path = validate_folder_path(path)?;
        let task = self
            .ledger
            .add_task(format!("Remove sync folder {}", path), Some(device));
        self.progress(task.task_id, 0, format!("Removing {}", path));

        let result = self.service.remove_folder(device, &path).await;
        match folder_failure("remove", device, &path, &result) {
            None => {
                if let Err(e) = self.folders.withdraw(&path) {
                    self.fail(task.task_id, registry_failure("remove", &e));
                    return Ok(self.task(task));
                }
                {
                    let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(cached) = cache.sources.get_mut(&Source::Sync) {
                        cached.records.retain(|r| !path_within(&r.file_path, &path));
                    }
                }
                self.recompose();
                info!("Sync folder {} removed from {}", path, device);
                self.complete(task.task_id, format!("Removed {}", path));
            }
            Some(failure) => self.fail(task.task_id, failure),
        }
        Ok(self.task(task))
    }

    /// Scan folders one after another under a single task.
    ///
    /// The first non-success outcome fails the task and the remaining
    /// folders are not scanned. A scan that never resolves leaves the task
    /// running. Once the task exists every failure ends up in the task; a
    /// folder removed while its scan is in flight does not abandon it.
    pub async fn scan_folders(&self, device: &str, paths: &[&str]) -> Result<Task, FolderError> {
        if paths.is_empty() {
            return Err(FolderError::EmptyPath);
        }
        let paths = paths
            .iter()
            .map(|p| validate_folder_path(p))
            .collect::<Result<Vec<_>, _>>()?;
        let total = paths.len();
        let task = self
            .ledger
            .add_task(format!("Scan {} folder(s)", total), Some(device));
        let id = task.task_id;

        for (index, path) in paths.iter().enumerate() {
            if let Err(e) = self.folders.register(path).and_then(|_| self.folders.start_scan(path)) {
                self.fail(id, registry_failure("scan", &e));
                return Ok(self.task(task));
            }
            self.progress(id, scan_overall(index, total, 0.0), format!("Scanning {}", path));

            let on_progress: ScanProgressFn = {
                let folders = Arc::clone(&self.folders);
                let ledger = Arc::clone(&self.ledger);
                let path = path.clone();
                Arc::new(move |percent, speed| {
                    if let Err(e) = folders.report_progress(&path, percent, speed.as_deref()) {
                        debug!("Dropping scan progress for {}: {}", path, e);
                    }
                    let overall = scan_overall(index, total, percent);
                    if let Err(e) = ledger.update_task(id, overall, format!("Scanning {}", path)) {
                        warn!("Task update failed: {}", e);
                    }
                })
            };

            let result = self.service.scan_folder(device, path, on_progress).await;
            if let Some(failure) = folder_failure("scan", device, path, &result) {
                if let Err(e) = self.folders.abort_scan(path) {
                    debug!("Scan of {} ended after removal: {}", path, e);
                }
                self.fail(id, failure);
                return Ok(self.task(task));
            }
            if self.folders.is_scanning(path) {
                if let Err(e) = self.folders.report_progress(path, 100.0, None) {
                    debug!("Scan of {} ended after removal: {}", path, e);
                }
            }
        }

        self.complete(id, format!("Scanned {} folder(s)", total));
        self.rebuild_namespace().await;
        Ok(self.task(task))
    }

    /// Download files from `device` under one task.
    pub async fn download(&self, device: &str, filenames: &[&str]) -> Result<Task, TransferError> {
        self.transfer(Direction::Download, device, filenames).await
    }

    /// Upload files to `device` under one task.
    pub async fn upload(&self, device: &str, filenames: &[&str]) -> Result<Task, TransferError> {
        self.transfer(Direction::Upload, device, filenames).await
    }

    /// Rejected requests (empty names, a file busy in the other direction)
    /// return an error before any task is created.
    async fn transfer(&self, direction: Direction, device: &str, filenames: &[&str]) -> Result<Task, TransferError> {
        if filenames.is_empty() || filenames.iter().any(|f| f.is_empty()) {
            return Err(TransferError::EmptyFilename);
        }
        self.transfers.ensure_available(direction, filenames)?;
        let verb = match direction {
            Direction::Download => "Download",
            Direction::Upload => "Upload",
        };
        let task = self.ledger.add_task(
            format!("{} {} file(s) with {}", verb, filenames.len(), device),
            Some(device),
        );
        let records = match self
            .transfers
            .start_transfers(direction, device, filenames, Some(task.task_id))
            .await
        {
            Ok(records) => records,
            Err(e) => {
                self.fail(
                    task.task_id,
                    TaskFailure::new(FailureKind::Validation, format!("{} rejected", verb), e.to_string()),
                );
                return Err(e);
            }
        };
        if !records.iter().any(|r| r.task_id == Some(task.task_id)) {
            self.complete(task.task_id, "Already in progress".to_string());
        }
        Ok(self.task(task))
    }

    /// Request cancellation of an active transfer.
    pub async fn cancel_transfer(&self, filename: &str) -> Result<TransferRecord, TransferError> {
        self.transfers.cancel(filename).await
    }

    /// Dispatch one inbound relay frame.
    pub fn handle_frame(&self, frame: InboundFrame) -> FrameOutcome {
        self.transfers.on_frame(frame)
    }
}

/// Replace one category's cached records with a newer, non-empty listing.
/// Returns whether the cache changed.
fn absorb(
    cache: &mut HashMap<Source, CachedSource>,
    generation: u64,
    source: Source,
    fetched: service::Result<Vec<FileRecord>>,
) -> bool {
    let mut records = match fetched {
        Ok(records) if records.is_empty() => {
            debug!("{} listing empty, keeping previous records", source);
            return false;
        }
        Ok(records) => records,
        Err(e) => {
            warn!("{} fetch failed, keeping previous records: {}", source, e);
            return false;
        }
    };
    if cache.get(&source).is_some_and(|c| c.generation > generation) {
        debug!("{} listing from rebuild {} is stale", source, generation);
        return false;
    }
    for record in &mut records {
        record.source = source;
    }
    cache.insert(source, CachedSource { generation, records });
    true
}

/// Task failure for a sync folder registry error after the task started.
fn registry_failure(action: &str, error: &FolderError) -> TaskFailure {
    TaskFailure::new(FailureKind::Validation, format!("Could not {} folder", action), error.to_string())
}

/// Map a folder operation result to a task failure; `None` means success.
fn folder_failure(
    action: &str,
    device: &str,
    path: &str,
    result: &service::Result<FolderOutcome>,
) -> Option<TaskFailure> {
    let failure = match result {
        Ok(FolderOutcome::Success) => return None,
        Ok(FolderOutcome::DeviceNotFound) | Err(ServiceError::NotFound(_)) => TaskFailure::new(
            FailureKind::NotFound,
            "Device not found",
            format!("Device {} was not found", device),
        ),
        Ok(FolderOutcome::Unauthorized) | Err(ServiceError::Unauthorized(_)) => TaskFailure::new(
            FailureKind::Unauthorized,
            "Not authorized",
            format!("You are not authorized to {} {} on {}", action, path, device),
        ),
        Ok(FolderOutcome::Error) => TaskFailure::new(
            FailureKind::Remote,
            format!("Could not {} folder", action),
            format!("{} reported an error for {}", device, path),
        ),
        Err(e @ (ServiceError::Transport(_) | ServiceError::Decode(_))) => TaskFailure::new(
            FailureKind::Transport,
            "Service unavailable",
            format!("Could not {} {}", action, path),
        )
        .with_line(e.to_string()),
    };
    Some(failure)
}

/// Overall task progress while scanning folder `index` of `total`.
fn scan_overall(index: usize, total: usize, percent: f64) -> u8 {
    let percent = if percent.is_finite() { percent.clamp(0.0, 100.0) } else { 0.0 };
    ((index as f64 * 100.0 + percent) / total as f64).floor().min(100.0) as u8
}
