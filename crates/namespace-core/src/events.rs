//! Event infrastructure for the namespace core.
//!
//! Provides `CoreEvent` for push-style consumers (UI, logging) and `EventBus`
//! for subscriptions. Every `subscribe` hands back a `Subscription`; dropping
//! it is the matching unsubscribe.

use crate::folders::SyncFolder;
use crate::tasks::Task;
use crate::transfer::TransferRecord;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the core whenever observable state changes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoreEvent {
    /// A task was added or changed state/progress.
    TaskChanged { task: Task },
    /// A transfer record changed.
    TransferChanged { record: TransferRecord },
    /// A sync folder was registered, updated or removed.
    FolderChanged {
        folder: SyncFolder,
        removed: bool,
    },
    /// Device scores were recomputed.
    DevicesScored {
        count: usize,
        /// Milliseconds since Unix epoch
        timestamp: f64,
    },
    /// A new namespace tree was published.
    NamespaceRebuilt {
        generation: u64,
        /// Total node count of the published tree
        nodes: usize,
        timestamp: f64,
    },
    /// The relay reported new notifications; consumers should refetch them.
    NotificationsChanged { timestamp: f64 },
}

/// Current time in milliseconds since Unix epoch.
pub fn now_ms() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(CoreEvent) + Send + Sync>;

/// Fan-out event bus. Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(CoreEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // emit releases its read lock before running callbacks, so a
        // Subscription dropped inside a callback cannot deadlock here.
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: CoreEvent) {
        // Snapshot the list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}
