//! RelayChannel trait for the persistent channel to the relay service.
//!
//! Implementations:
//! - `InMemoryChannel` - For testing
//! - `RelayClient` (in namespace-daemon) - WebSocket connection

use crate::frames::OutboundFrame;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Relay channel is not open")]
    NotOpen,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Outbound half of the long-lived relay channel.
///
/// Inbound frames are delivered separately (the daemon forwards them to
/// `TransferCoordinator::on_frame`), so this trait only needs to send.
#[async_trait]
pub trait RelayChannel: Send + Sync {
    /// Whether frames can currently be sent.
    fn is_open(&self) -> bool;

    /// Send one frame to the relay.
    async fn send(&self, frame: &OutboundFrame) -> Result<()>;
}

/// In-memory channel for testing: records every frame sent.
pub struct InMemoryChannel {
    open: AtomicBool,
    sent: Mutex<Vec<OutboundFrame>>,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn closed() -> Self {
        let channel = Self::new();
        channel.set_open(false);
        channel
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Frames sent so far, in order.
    pub fn sent(&self) -> Vec<OutboundFrame> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayChannel for InMemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: &OutboundFrame) -> Result<()> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(frame.clone());
        Ok(())
    }
}
