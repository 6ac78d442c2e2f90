//! namespace-core: device-spanning file namespace and task/transfer orchestration.
//!
//! This crate provides the core functionality for:
//! - Scoring devices from telemetry and predictions
//! - Building one hierarchical namespace from per-device file listings
//! - Tracking long-running operations in a task ledger
//! - Coordinating uploads/downloads over the relay channel
//! - FileService and RelayChannel trait abstractions

pub mod channel;
pub mod device;
pub mod engine;
pub mod events;
pub mod folders;
pub mod frames;
pub mod namespace;
pub mod records;
pub mod service;
pub mod tasks;
pub mod transfer;

pub use channel::{ChannelError, InMemoryChannel, RelayChannel};
pub use device::{Device, DevicePrediction, DeviceRegistry, DeviceTelemetry, ScoreError, ScoreWeights};
pub use engine::{Engine, EngineConfig};
pub use events::{CoreEvent, EventBus, Subscription};
pub use folders::{FolderError, SyncFolder, SyncFolderRegistry};
pub use frames::{InboundFrame, OutboundFrame};
pub use namespace::TreeNode;
pub use records::{Availability, FileRecord, Source};
pub use service::{CloudListing, FileService, FolderOutcome, InMemoryFileService, ServiceError};
pub use tasks::{FailureKind, Task, TaskFailure, TaskId, TaskLedger, TaskStatus};
pub use transfer::{Direction, FrameOutcome, TransferCoordinator, TransferRecord, TransferStatus};
