//! Transfer coordinator: per-file upload/download progress over the relay channel.
//!
//! One logical transfer maps to zero or more frames on the shared channel and
//! to exactly one `TransferRecord`. Terminal states are only ever set by an
//! inbound frame: a cancel request marks the record `cancel_requested` and
//! waits for the relay's `canceled` acknowledgment, so the UI never shows
//! "canceled" while the remote side is still writing.
//!
//! Transfers started together under a task form a group. The task's progress
//! is the mean of its transfers; when every transfer is terminal the task
//! completes, or fails if any transfer failed. Canceling a transfer never
//! cancels its task or its siblings.
//!
//! Inbound frames name a file but not a direction, so a filename has at most
//! one active transfer at a time.

use crate::channel::{ChannelError, RelayChannel};
use crate::events::{now_ms, CoreEvent, EventBus};
use crate::frames::{InboundFrame, OutboundFrame};
use crate::tasks::{FailureKind, TaskFailure, TaskId, TaskLedger};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// Number of recent progress samples used for the throughput average.
pub const THROUGHPUT_WINDOW: usize = 5;

/// Finished records kept for display before the oldest are pruned.
pub const HISTORY_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Filename cannot be empty")]
    EmptyFilename,

    #[error("No active transfer for {0}")]
    UnknownTransfer(String),

    #[error("{filename} already has an active {active}")]
    Busy { filename: String, active: Direction },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    InProgress,
    Completed,
    Failed,
    Skipped,
    Canceled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::InProgress)
    }
}

/// Byte-level progress of one file in one direction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferRecord {
    pub filename: String,
    pub file_type: String,
    pub direction: Direction,
    pub device: String,
    pub status: TransferStatus,
    pub total_size: u64,
    pub transferred_size: u64,
    /// 0-100
    pub progress: f64,
    /// Estimated seconds remaining, when a throughput estimate exists
    pub time_remaining: Option<f64>,
    /// A cancel frame was sent and the acknowledgment is pending
    pub cancel_requested: bool,
    pub error: Option<String>,
    pub task_id: Option<TaskId>,
}

/// Result of dispatching one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Updated(TransferRecord),
    /// Unknown filename or frame for an already-terminal transfer
    Ignored,
    NotificationsChanged,
}

fn file_type_of(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(stem, ext)| (stem, ext.to_ascii_lowercase()))
        .filter(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
        .map(|(_, ext)| ext)
        .unwrap_or_else(|| "file".to_string())
}

/// Moving window of `(timestamp_ms, transferred_bytes)` samples.
#[derive(Debug, Default)]
struct Throughput {
    samples: VecDeque<(f64, u64)>,
}

impl Throughput {
    fn push(&mut self, at_ms: f64, transferred: u64) {
        if self.samples.len() == THROUGHPUT_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back((at_ms, transferred));
    }

    /// Bytes per second over the window.
    fn rate(&self) -> Option<f64> {
        let (t0, b0) = self.samples.front()?;
        let (t1, b1) = self.samples.back()?;
        let elapsed = (t1 - t0) / 1000.0;
        if elapsed <= 0.0 || b1 <= b0 {
            return None;
        }
        Some((b1 - b0) as f64 / elapsed)
    }
}

#[derive(Debug)]
struct Entry {
    record: TransferRecord,
    throughput: Throughput,
    failure_kind: Option<FailureKind>,
}

impl Entry {
    fn is_active_for(&self, filename: &str, direction: Direction) -> bool {
        self.record.filename == filename
            && self.record.direction == direction
            && !self.record.status.is_terminal()
    }
}

fn active_entry<'a>(entries: &'a [Entry], filename: &str) -> Option<&'a Entry> {
    entries
        .iter()
        .rev()
        .find(|e| e.record.filename == filename && !e.record.status.is_terminal())
}

/// Drop the oldest finished records beyond `limit`. Records whose task still
/// has active transfers are kept so the task's totals stay correct.
fn prune_history(entries: &mut Vec<Entry>, limit: usize) {
    let finished = entries.iter().filter(|e| e.record.status.is_terminal()).count();
    let mut excess = finished.saturating_sub(limit);
    if excess == 0 {
        return;
    }
    let busy: HashSet<TaskId> = entries
        .iter()
        .filter(|e| !e.record.status.is_terminal())
        .filter_map(|e| e.record.task_id)
        .collect();
    entries.retain(|e| {
        let removable = excess > 0
            && e.record.status.is_terminal()
            && !e.record.task_id.is_some_and(|t| busy.contains(&t));
        if removable {
            excess -= 1;
        }
        !removable
    });
}

/// Ledger update derived from a group's transfers.
enum GroupUpdate {
    Progress { task: TaskId, progress: u8, message: String },
    Complete { task: TaskId, message: String },
    Fail { task: TaskId, failure: TaskFailure },
}

pub struct TransferCoordinator {
    channel: Arc<dyn RelayChannel>,
    username: String,
    ledger: Arc<TaskLedger>,
    events: Option<Arc<EventBus>>,
    entries: Mutex<Vec<Entry>>,
    history_limit: usize,
}

impl TransferCoordinator {
    pub fn new(channel: Arc<dyn RelayChannel>, username: impl Into<String>, ledger: Arc<TaskLedger>) -> Self {
        Self {
            channel,
            username: username.into(),
            ledger,
            events: None,
            entries: Mutex::new(Vec::new()),
            history_limit: HISTORY_LIMIT,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Check that none of `filenames` is busy in the other direction.
    pub fn ensure_available(&self, direction: Direction, filenames: &[&str]) -> Result<()> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        check_available(&entries, direction, filenames)
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel.is_open()
    }

    fn publish(&self, record: &TransferRecord) {
        if let Some(events) = &self.events {
            events.emit(CoreEvent::TransferChanged {
                record: record.clone(),
            });
        }
    }

    /// Start downloading one file from `device`.
    pub async fn start_download(&self, filename: &str, device: &str) -> Result<TransferRecord> {
        let mut records = self
            .start_transfers(Direction::Download, device, &[filename], None)
            .await?;
        Ok(records.remove(0))
    }

    /// Start uploading one file to `device`.
    pub async fn start_upload(&self, filename: &str, device: &str) -> Result<TransferRecord> {
        let mut records = self
            .start_transfers(Direction::Upload, device, &[filename], None)
            .await?;
        Ok(records.remove(0))
    }

    /// Start a group of transfers, optionally wrapped by a task.
    ///
    /// All records are created before the first frame is sent, so a fast
    /// acknowledgment cannot finish the task early. With a closed channel
    /// every record fails immediately and no frame is sent. A filename that
    /// already has an active transfer in the same direction keeps it and
    /// sends nothing new; one active in the other direction rejects the
    /// whole request with `TransferError::Busy`.
    pub async fn start_transfers(
        &self,
        direction: Direction,
        device: &str,
        filenames: &[&str],
        task: Option<TaskId>,
    ) -> Result<Vec<TransferRecord>> {
        if filenames.is_empty() || filenames.iter().any(|f| f.is_empty()) {
            return Err(TransferError::EmptyFilename);
        }

        let mut created = Vec::new();
        let mut records = Vec::with_capacity(filenames.len());
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            check_available(&entries, direction, filenames)?;
            prune_history(&mut entries, self.history_limit);
            for filename in filenames {
                if let Some(active) = entries.iter().rev().find(|e| e.is_active_for(filename, direction)) {
                    debug!("Transfer for {} already active", filename);
                    records.push(active.record.clone());
                    continue;
                }
                let record = TransferRecord {
                    filename: filename.to_string(),
                    file_type: file_type_of(filename),
                    direction,
                    device: device.to_string(),
                    status: TransferStatus::InProgress,
                    total_size: 0,
                    transferred_size: 0,
                    progress: 0.0,
                    time_remaining: None,
                    cancel_requested: false,
                    error: None,
                    task_id: task,
                };
                entries.push(Entry {
                    record: record.clone(),
                    throughput: Throughput::default(),
                    failure_kind: None,
                });
                created.push(filename.to_string());
                records.push(record);
            }
        }
        for record in &records {
            self.publish(record);
        }
        if let Some(task) = task {
            self.refresh_group(task);
        }

        for filename in created {
            let frame = match direction {
                Direction::Download => OutboundFrame::StartDownload {
                    username: self.username.clone(),
                    filename: filename.clone(),
                    device: device.to_string(),
                },
                Direction::Upload => OutboundFrame::StartUpload {
                    username: self.username.clone(),
                    filename: filename.clone(),
                    device: device.to_string(),
                },
            };
            let sent = if self.channel.is_open() {
                self.channel.send(&frame).await
            } else {
                Err(ChannelError::NotOpen)
            };
            if let Err(e) = sent {
                warn!("Could not start transfer of {}: {}", filename, e);
                self.fail_local(&filename, direction, e.to_string());
            }
        }

        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .into_iter()
            .map(|r| {
                entries
                    .iter()
                    .rev()
                    .find(|e| e.record.filename == r.filename && e.record.direction == direction)
                    .map(|e| e.record.clone())
                    .unwrap_or(r)
            })
            .collect())
    }

    /// Fail an active transfer locally (channel problems only).
    fn fail_local(&self, filename: &str, direction: Direction, reason: String) {
        let updated = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = entries
                .iter_mut()
                .rev()
                .find(|e| e.is_active_for(filename, direction))
            else {
                return;
            };
            entry.record.status = TransferStatus::Failed;
            entry.record.error = Some(reason);
            entry.record.time_remaining = None;
            entry.failure_kind = Some(FailureKind::Transport);
            entry.record.clone()
        };
        self.publish(&updated);
        if let Some(task) = updated.task_id {
            self.refresh_group(task);
        }
    }

    /// Ask the relay to cancel a transfer.
    ///
    /// The record stays `in-progress` (with `cancel_requested`) until the
    /// relay acknowledges with a `canceled` frame. If the transfer finishes
    /// while the cancel frame is in flight, its terminal record is returned.
    pub async fn cancel(&self, filename: &str) -> Result<TransferRecord> {
        let direction = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            active_entry(&entries, filename)
                .map(|e| e.record.direction)
                .ok_or_else(|| TransferError::UnknownTransfer(filename.to_string()))?
        };

        if !self.channel.is_open() {
            return Err(ChannelError::NotOpen.into());
        }
        let frame = match direction {
            Direction::Download => OutboundFrame::CancelDownload {
                username: self.username.clone(),
                filename: filename.to_string(),
            },
            Direction::Upload => OutboundFrame::CancelUpload {
                username: self.username.clone(),
                filename: filename.to_string(),
            },
        };
        self.channel.send(&frame).await?;

        let updated = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let entry = entries
                .iter_mut()
                .rev()
                .find(|e| e.record.filename == filename && e.record.direction == direction)
                .ok_or_else(|| TransferError::UnknownTransfer(filename.to_string()))?;
            if entry.record.status.is_terminal() {
                debug!("{} finished before its cancel was recorded", filename);
                return Ok(entry.record.clone());
            }
            entry.record.cancel_requested = true;
            entry.record.clone()
        };
        self.publish(&updated);
        Ok(updated)
    }

    /// Dispatch an inbound frame using the current time.
    pub fn on_frame(&self, frame: InboundFrame) -> FrameOutcome {
        self.on_frame_at(frame, now_ms())
    }

    /// Dispatch an inbound frame observed at `at_ms` (ms since epoch).
    pub fn on_frame_at(&self, frame: InboundFrame, at_ms: f64) -> FrameOutcome {
        if frame == InboundFrame::NotificationUpdate {
            if let Some(events) = &self.events {
                events.emit(CoreEvent::NotificationsChanged { timestamp: at_ms });
            }
            return FrameOutcome::NotificationsChanged;
        }
        let kind = frame.kind();

        let updated = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let Some(filename) = frame.filename() else {
                return FrameOutcome::Ignored;
            };
            let Some(entry) = entries
                .iter_mut()
                .rev()
                .find(|e| e.record.filename == filename && !e.record.status.is_terminal())
            else {
                debug!("Ignoring {} frame for untracked or finished transfer {}", kind, filename);
                return FrameOutcome::Ignored;
            };
            apply_frame(entry, frame, at_ms);
            entry.record.clone()
        };

        self.publish(&updated);
        if let Some(task) = updated.task_id {
            self.refresh_group(task);
        }
        FrameOutcome::Updated(updated)
    }

    /// Recompute the task wrapping a group of transfers.
    fn refresh_group(&self, task: TaskId) {
        let update = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            group_update(task, &entries)
        };
        let result = match update {
            Some(GroupUpdate::Progress { task, progress, message }) => {
                self.ledger.update_task(task, progress, message)
            }
            Some(GroupUpdate::Complete { task, message }) => self.ledger.complete_task(task, message),
            Some(GroupUpdate::Fail { task, failure }) => self.ledger.fail_task(task, failure),
            None => return,
        };
        if let Err(e) = result {
            warn!("Could not update task for transfer group: {}", e);
        }
    }

    /// Latest record for a filename.
    pub fn get(&self, filename: &str) -> Option<TransferRecord> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .find(|e| e.record.filename == filename)
            .map(|e| e.record.clone())
    }

    /// All records in start order.
    pub fn snapshot(&self) -> Vec<TransferRecord> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn active(&self) -> Vec<TransferRecord> {
        self.snapshot()
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect()
    }
}

fn check_available(entries: &[Entry], direction: Direction, filenames: &[&str]) -> Result<()> {
    for filename in filenames {
        match active_entry(entries, filename) {
            Some(active) if active.record.direction != direction => {
                return Err(TransferError::Busy {
                    filename: filename.to_string(),
                    active: active.record.direction,
                });
            }
            _ => {}
        }
    }
    Ok(())
}

fn apply_frame(entry: &mut Entry, frame: InboundFrame, at_ms: f64) {
    let record = &mut entry.record;
    match frame {
        InboundFrame::Progress {
            transferred, total, ..
        } => {
            if total > 0 {
                record.total_size = total;
            }
            record.transferred_size = transferred;
            record.progress = if record.total_size > 0 {
                (transferred as f64 / record.total_size as f64 * 100.0).min(100.0)
            } else {
                0.0
            };
            entry.throughput.push(at_ms, transferred);
            record.time_remaining = entry.throughput.rate().map(|rate| {
                record.total_size.saturating_sub(transferred) as f64 / rate
            });
        }
        InboundFrame::Completed { .. } => {
            record.status = TransferStatus::Completed;
            record.transferred_size = record.total_size.max(record.transferred_size);
            record.progress = 100.0;
            record.time_remaining = Some(0.0);
        }
        InboundFrame::Failed { reason, .. } => {
            record.status = TransferStatus::Failed;
            record.error = Some(if reason.is_empty() {
                "Transfer failed".to_string()
            } else {
                reason
            });
            record.time_remaining = None;
            entry.failure_kind = Some(FailureKind::Remote);
        }
        InboundFrame::Skipped { .. } => {
            record.status = TransferStatus::Skipped;
            record.time_remaining = None;
        }
        InboundFrame::Canceled { .. } => {
            record.status = TransferStatus::Canceled;
            record.time_remaining = None;
        }
        InboundFrame::NotificationUpdate => {}
    }
}

fn group_update(task: TaskId, entries: &[Entry]) -> Option<GroupUpdate> {
    let group: Vec<&Entry> = entries
        .iter()
        .filter(|e| e.record.task_id == Some(task))
        .collect();
    if group.is_empty() {
        return None;
    }
    let total = group.len();
    let count = |status: TransferStatus| group.iter().filter(|e| e.record.status == status).count();
    let finished = group.iter().filter(|e| e.record.status.is_terminal()).count();

    if finished < total {
        let mean = group
            .iter()
            .map(|e| if e.record.status.is_terminal() { 100.0 } else { e.record.progress })
            .sum::<f64>()
            / total as f64;
        return Some(GroupUpdate::Progress {
            task,
            progress: mean.floor().clamp(0.0, 100.0) as u8,
            message: format!("{} of {} files done", finished, total),
        });
    }

    let failed: Vec<&&Entry> = group
        .iter()
        .filter(|e| e.record.status == TransferStatus::Failed)
        .collect();
    if failed.is_empty() {
        let mut message = format!("{} completed", count(TransferStatus::Completed));
        for (status, label) in [
            (TransferStatus::Skipped, "skipped"),
            (TransferStatus::Canceled, "canceled"),
        ] {
            let n = count(status);
            if n > 0 {
                message.push_str(&format!(", {} {}", n, label));
            }
        }
        return Some(GroupUpdate::Complete { task, message });
    }

    let kind = if failed
        .iter()
        .any(|e| e.failure_kind == Some(FailureKind::Transport))
    {
        FailureKind::Transport
    } else {
        FailureKind::Remote
    };
    let title = if failed.len() == 1 {
        "1 transfer failed".to_string()
    } else {
        format!("{} transfers failed", failed.len())
    };
    let lines = failed
        .iter()
        .map(|e| {
            format!(
                "{}: {}",
                e.record.filename,
                e.record.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect();
    Some(GroupUpdate::Fail {
        task,
        failure: TaskFailure { kind, title, lines },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryChannel;
    use crate::tasks::TaskStatus;

    fn setup() -> (Arc<InMemoryChannel>, Arc<TaskLedger>, TransferCoordinator) {
        let channel = Arc::new(InMemoryChannel::new());
        let ledger = Arc::new(TaskLedger::new());
        let coordinator = TransferCoordinator::new(channel.clone(), "ana", Arc::clone(&ledger));
        (channel, ledger, coordinator)
    }

    fn progress(filename: &str, transferred: u64, total: u64) -> InboundFrame {
        InboundFrame::Progress {
            filename: filename.into(),
            transferred,
            total,
        }
    }

    #[tokio::test]
    async fn test_start_download_sends_request() {
        let (channel, _, coordinator) = setup();
        let record = coordinator.start_download("a.txt", "laptop").await.unwrap();

        assert_eq!(record.status, TransferStatus::InProgress);
        assert_eq!(record.progress, 0.0);
        assert_eq!(record.file_type, "txt");
        assert_eq!(
            channel.sent(),
            vec![OutboundFrame::StartDownload {
                username: "ana".into(),
                filename: "a.txt".into(),
                device: "laptop".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_start_download_with_closed_channel_fails_without_frame() {
        let (channel, _, coordinator) = setup();
        channel.set_open(false);
        let record = coordinator.start_download("a.txt", "laptop").await.unwrap();

        assert_eq!(record.status, TransferStatus::Failed);
        assert!(record.error.is_some());
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn test_empty_filename_rejected() {
        let (_, _, coordinator) = setup();
        assert!(matches!(
            coordinator.start_download("", "laptop").await.unwrap_err(),
            TransferError::EmptyFilename
        ));
        assert!(coordinator.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_race_waits_for_acknowledgment() {
        let (channel, _, coordinator) = setup();
        coordinator.start_download("a.txt", "laptop").await.unwrap();

        let record = coordinator.cancel("a.txt").await.unwrap();
        assert_eq!(record.status, TransferStatus::InProgress);
        assert!(record.cancel_requested);
        assert_eq!(
            channel.sent().last(),
            Some(&OutboundFrame::CancelDownload {
                username: "ana".into(),
                filename: "a.txt".into(),
            })
        );

        // Late progress still lands.
        let outcome = coordinator.on_frame_at(progress("a.txt", 300, 1000), 1000.0);
        let FrameOutcome::Updated(record) = outcome else {
            panic!("progress after cancel should update");
        };
        assert_eq!(record.transferred_size, 300);
        assert_eq!(record.status, TransferStatus::InProgress);

        coordinator.on_frame_at(
            InboundFrame::Canceled {
                filename: "a.txt".into(),
            },
            2000.0,
        );
        assert_eq!(
            coordinator.get("a.txt").unwrap().status,
            TransferStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_cancel_unknown_transfer() {
        let (_, _, coordinator) = setup();
        assert!(matches!(
            coordinator.cancel("nope.txt").await.unwrap_err(),
            TransferError::UnknownTransfer(_)
        ));
    }

    #[tokio::test]
    async fn test_upload_cancel_uses_upload_frame() {
        let (channel, _, coordinator) = setup();
        coordinator.start_upload("b.bin", "desktop").await.unwrap();
        coordinator.cancel("b.bin").await.unwrap();
        assert!(matches!(
            channel.sent().last(),
            Some(OutboundFrame::CancelUpload { .. })
        ));
    }

    #[tokio::test]
    async fn test_progress_and_time_remaining() {
        let (_, _, coordinator) = setup();
        coordinator.start_download("a.txt", "laptop").await.unwrap();

        coordinator.on_frame_at(progress("a.txt", 0, 1000), 0.0);
        let FrameOutcome::Updated(record) = coordinator.on_frame_at(progress("a.txt", 200, 1000), 1000.0)
        else {
            panic!("expected update");
        };
        assert_eq!(record.progress, 20.0);
        // 200 B/s, 800 B left
        assert!((record.time_remaining.unwrap() - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_progress_clamped_to_100() {
        let (_, _, coordinator) = setup();
        coordinator.start_download("a.txt", "laptop").await.unwrap();
        let FrameOutcome::Updated(record) = coordinator.on_frame_at(progress("a.txt", 1500, 1000), 0.0)
        else {
            panic!("expected update");
        };
        assert_eq!(record.progress, 100.0);
    }

    #[tokio::test]
    async fn test_unknown_filename_ignored() {
        let (_, _, coordinator) = setup();
        assert_eq!(
            coordinator.on_frame_at(progress("ghost.txt", 1, 2), 0.0),
            FrameOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn test_duplicate_completed_is_noop() {
        let (_, _, coordinator) = setup();
        coordinator.start_download("a.txt", "laptop").await.unwrap();
        let done = InboundFrame::Completed {
            filename: "a.txt".into(),
        };
        assert!(matches!(
            coordinator.on_frame_at(done.clone(), 0.0),
            FrameOutcome::Updated(_)
        ));
        let first = coordinator.get("a.txt").unwrap();
        assert_eq!(coordinator.on_frame_at(done, 1.0), FrameOutcome::Ignored);
        assert_eq!(coordinator.get("a.txt").unwrap(), first);
        assert_eq!(first.progress, 100.0);
    }

    #[tokio::test]
    async fn test_restart_after_terminal_creates_new_record() {
        let (channel, _, coordinator) = setup();
        coordinator.start_download("a.txt", "laptop").await.unwrap();
        coordinator.start_download("a.txt", "laptop").await.unwrap();
        assert_eq!(coordinator.snapshot().len(), 1);
        assert_eq!(channel.sent().len(), 1);

        coordinator.on_frame_at(
            InboundFrame::Failed {
                filename: "a.txt".into(),
                reason: "disk full".into(),
            },
            0.0,
        );
        let record = coordinator.start_download("a.txt", "laptop").await.unwrap();
        assert_eq!(record.status, TransferStatus::InProgress);
        assert_eq!(coordinator.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_group_task_completes_when_all_terminal() {
        let (_, ledger, coordinator) = setup();
        let task = ledger.add_task("Download 2 files", Some("laptop"));
        coordinator
            .start_transfers(Direction::Download, "laptop", &["a.txt", "b.txt"], Some(task.task_id))
            .await
            .unwrap();
        assert_eq!(ledger.get(task.task_id).unwrap().status, TaskStatus::Running);

        coordinator.on_frame_at(progress("a.txt", 50, 100), 0.0);
        assert_eq!(ledger.get(task.task_id).unwrap().progress, 25);

        coordinator.on_frame_at(InboundFrame::Completed { filename: "a.txt".into() }, 1.0);
        coordinator.on_frame_at(InboundFrame::Canceled { filename: "b.txt".into() }, 2.0);

        let task = ledger.get(task.task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
        assert_eq!(task.message, "1 completed, 1 canceled");
    }

    #[tokio::test]
    async fn test_cancel_does_not_touch_siblings_or_task() {
        let (_, ledger, coordinator) = setup();
        let task = ledger.add_task("Download 2 files", None);
        coordinator
            .start_transfers(Direction::Download, "laptop", &["a.txt", "b.txt"], Some(task.task_id))
            .await
            .unwrap();

        coordinator.cancel("a.txt").await.unwrap();
        coordinator.on_frame_at(InboundFrame::Canceled { filename: "a.txt".into() }, 0.0);

        assert_eq!(coordinator.get("b.txt").unwrap().status, TransferStatus::InProgress);
        assert!(!coordinator.get("b.txt").unwrap().cancel_requested);
        assert_eq!(ledger.get(task.task_id).unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_group_task_fails_when_any_transfer_fails() {
        let (_, ledger, coordinator) = setup();
        let task = ledger.add_task("Upload", None);
        coordinator
            .start_transfers(Direction::Upload, "laptop", &["a.txt", "b.txt"], Some(task.task_id))
            .await
            .unwrap();
        coordinator.on_frame_at(InboundFrame::Completed { filename: "a.txt".into() }, 0.0);
        coordinator.on_frame_at(
            InboundFrame::Failed {
                filename: "b.txt".into(),
                reason: "device offline".into(),
            },
            1.0,
        );

        let task = ledger.get(task.task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let failure = task.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Remote);
        assert_eq!(failure.lines, vec!["b.txt: device offline".to_string()]);
    }

    #[tokio::test]
    async fn test_closed_channel_fails_group_as_transport() {
        let (channel, ledger, coordinator) = setup();
        channel.set_open(false);
        let task = ledger.add_task("Download", None);
        let records = coordinator
            .start_transfers(Direction::Download, "laptop", &["a.txt"], Some(task.task_id))
            .await
            .unwrap();

        assert_eq!(records[0].status, TransferStatus::Failed);
        let task = ledger.get(task.task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failure.unwrap().kind, FailureKind::Transport);
    }

    #[tokio::test]
    async fn test_upload_rejected_while_download_active() {
        let (channel, _, coordinator) = setup();
        coordinator.start_download("a.txt", "laptop").await.unwrap();

        let err = coordinator.start_upload("a.txt", "desktop").await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Busy { ref filename, active: Direction::Download } if filename == "a.txt"
        ));
        assert_eq!(channel.sent().len(), 1);
        assert_eq!(coordinator.snapshot().len(), 1);
        assert_eq!(coordinator.get("a.txt").unwrap().direction, Direction::Download);
    }

    #[tokio::test]
    async fn test_busy_file_rejects_whole_group() {
        let (channel, _, coordinator) = setup();
        coordinator.start_upload("b.txt", "desktop").await.unwrap();

        let result = coordinator
            .start_transfers(Direction::Download, "laptop", &["a.txt", "b.txt"], None)
            .await;
        assert!(matches!(result, Err(TransferError::Busy { .. })));
        assert!(coordinator.get("a.txt").is_none());
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_other_direction_allowed_after_finish() {
        let (channel, _, coordinator) = setup();
        coordinator.start_download("a.txt", "laptop").await.unwrap();
        coordinator.on_frame_at(InboundFrame::Completed { filename: "a.txt".into() }, 0.0);

        let record = coordinator.start_upload("a.txt", "desktop").await.unwrap();
        assert_eq!(record.direction, Direction::Upload);
        assert_eq!(record.status, TransferStatus::InProgress);
        assert!(matches!(
            channel.sent().last(),
            Some(OutboundFrame::StartUpload { .. })
        ));
    }

    /// Channel that delivers the relay's `canceled` ack before `send` returns.
    #[derive(Default)]
    struct AckingChannel {
        coordinator: Mutex<Option<Arc<TransferCoordinator>>>,
    }

    #[async_trait::async_trait]
    impl RelayChannel for AckingChannel {
        fn is_open(&self) -> bool {
            true
        }

        async fn send(&self, frame: &OutboundFrame) -> crate::channel::Result<()> {
            let coordinator = self.coordinator.lock().unwrap().clone();
            if let (Some(coordinator), OutboundFrame::CancelDownload { filename, .. }) = (coordinator, frame) {
                coordinator.on_frame_at(
                    InboundFrame::Canceled {
                        filename: filename.clone(),
                    },
                    0.0,
                );
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancel_acknowledged_during_send() {
        let channel = Arc::new(AckingChannel::default());
        let coordinator = Arc::new(TransferCoordinator::new(
            channel.clone(),
            "ana",
            Arc::new(TaskLedger::new()),
        ));
        *channel.coordinator.lock().unwrap() = Some(Arc::clone(&coordinator));

        coordinator.start_download("a.txt", "laptop").await.unwrap();
        let record = coordinator.cancel("a.txt").await.unwrap();
        assert_eq!(record.status, TransferStatus::Canceled);

        channel.coordinator.lock().unwrap().take();
    }

    #[tokio::test]
    async fn test_finished_history_is_pruned() {
        let channel = Arc::new(InMemoryChannel::new());
        let coordinator = TransferCoordinator::new(channel, "ana", Arc::new(TaskLedger::new()))
            .with_history_limit(1);

        for name in ["a.txt", "b.txt"] {
            coordinator.start_download(name, "laptop").await.unwrap();
            coordinator.on_frame_at(InboundFrame::Completed { filename: name.into() }, 0.0);
        }
        coordinator.start_download("c.txt", "laptop").await.unwrap();

        let names: Vec<String> = coordinator.snapshot().into_iter().map(|r| r.filename).collect();
        assert_eq!(names, vec!["b.txt".to_string(), "c.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_pruning_keeps_records_of_running_group() {
        let (_, ledger, coordinator) = setup();
        let coordinator = coordinator.with_history_limit(0);
        let task = ledger.add_task("Download 2 files", None);
        coordinator
            .start_transfers(Direction::Download, "laptop", &["a.txt", "b.txt"], Some(task.task_id))
            .await
            .unwrap();
        coordinator.on_frame_at(InboundFrame::Completed { filename: "a.txt".into() }, 0.0);

        coordinator.start_download("c.txt", "laptop").await.unwrap();
        assert!(coordinator.get("a.txt").is_some());

        coordinator.on_frame_at(InboundFrame::Completed { filename: "b.txt".into() }, 1.0);
        let task = ledger.get(task.task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
        assert_eq!(task.message, "2 completed");
    }

    #[test]
    fn test_notification_update_emits_event() {
        let channel = Arc::new(InMemoryChannel::new());
        let events = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(0));
        let seen_clone = Arc::clone(&seen);
        let _sub = events.subscribe(move |event| {
            if matches!(event, CoreEvent::NotificationsChanged { .. }) {
                *seen_clone.lock().unwrap() += 1;
            }
        });
        let coordinator = TransferCoordinator::new(channel, "ana", Arc::new(TaskLedger::new()))
            .with_events(events);

        assert_eq!(
            coordinator.on_frame(InboundFrame::NotificationUpdate),
            FrameOutcome::NotificationsChanged
        );
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_file_type_of() {
        assert_eq!(file_type_of("a.TXT"), "txt");
        assert_eq!(file_type_of("archive.tar.gz"), "gz");
        assert_eq!(file_type_of(".bashrc"), "file");
        assert_eq!(file_type_of("README"), "file");
    }
}
