//! Wire frames exchanged with the relay over the persistent channel.
//!
//! Frames are JSON objects tagged by an `event` field:
//!
//! ```text
//! {"event":"progress","filename":"a.txt","transferred":512,"total":1024}
//! {"event":"cancel_download","username":"ana","filename":"a.txt"}
//! ```

use serde::{Deserialize, Serialize};

/// Frames larger than this are dropped unread (50MB).
pub const MAX_FRAME_SIZE: usize = 50 * 1024 * 1024;

/// Frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboundFrame {
    Progress {
        filename: String,
        transferred: u64,
        total: u64,
    },
    Completed {
        filename: String,
    },
    Failed {
        filename: String,
        #[serde(default)]
        reason: String,
    },
    Skipped {
        filename: String,
    },
    Canceled {
        filename: String,
    },
    /// Unrelated to transfers: only triggers a notifications refresh.
    NotificationUpdate,
}

impl InboundFrame {
    /// Try to parse a frame. Returns `None` for non-JSON or unknown events.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        if data.len() > MAX_FRAME_SIZE {
            return None;
        }
        serde_json::from_slice(data).ok()
    }

    /// Filename the frame refers to, if it is a transfer frame.
    pub fn filename(&self) -> Option<&str> {
        match self {
            InboundFrame::Progress { filename, .. }
            | InboundFrame::Completed { filename }
            | InboundFrame::Failed { filename, .. }
            | InboundFrame::Skipped { filename }
            | InboundFrame::Canceled { filename } => Some(filename),
            InboundFrame::NotificationUpdate => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundFrame::Progress { .. } => "progress",
            InboundFrame::Completed { .. } => "completed",
            InboundFrame::Failed { .. } => "failed",
            InboundFrame::Skipped { .. } => "skipped",
            InboundFrame::Canceled { .. } => "canceled",
            InboundFrame::NotificationUpdate => "notification_update",
        }
    }
}

/// Frames sent to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutboundFrame {
    StartDownload {
        username: String,
        filename: String,
        device: String,
    },
    StartUpload {
        username: String,
        filename: String,
        device: String,
    },
    CancelDownload {
        username: String,
        filename: String,
    },
    CancelUpload {
        username: String,
        filename: String,
    },
}

impl OutboundFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("OutboundFrame serialization should not fail")
    }

    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }

    pub fn filename(&self) -> &str {
        match self {
            OutboundFrame::StartDownload { filename, .. }
            | OutboundFrame::StartUpload { filename, .. }
            | OutboundFrame::CancelDownload { filename, .. }
            | OutboundFrame::CancelUpload { filename, .. } => filename,
        }
    }
}
