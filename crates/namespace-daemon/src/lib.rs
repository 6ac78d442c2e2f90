//! namespace-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod http;
pub mod relay;
pub mod watcher;

// Re-export key types for convenience
pub use config::{Args, Config, ConfigError};
pub use http::HttpFileService;
pub use relay::{ReconnectConfig, RelayClient, RelayEvent, RelayState};
pub use watcher::{FileChanged, FileWatcher};
