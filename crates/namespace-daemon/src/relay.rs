//! WebSocket client for the relay channel.
//!
//! Manages the single long-lived connection to the relay, including:
//! - Connection establishment
//! - Automatic reconnection with exponential backoff
//! - State tracking (connecting, connected, reconnecting, closed)
//!
//! Inbound frames are parsed and delivered on an event channel; the
//! client itself implements `RelayChannel` for outbound frames.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use namespace_core::channel::{self, ChannelError, RelayChannel};
use namespace_core::frames::{InboundFrame, OutboundFrame, MAX_FRAME_SIZE};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// State of the relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Attempting the first connection
    Connecting,
    /// Connected; frames can be sent
    Connected,
    /// Disconnected, waiting to reconnect
    Reconnecting,
    /// Permanently closed (no reconnect)
    Closed,
}

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

/// Calculates the next reconnection delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Reconnection bookkeeping for the relay connection.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    /// Consecutive failed or dropped connections
    pub attempts: u32,
    /// Current backoff delay
    pub current_delay: Duration,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more attempt and return how long to wait before it.
    pub fn schedule_reconnect(&mut self, config: &ReconnectConfig) -> Duration {
        self.attempts += 1;
        self.current_delay = calculate_backoff(self.attempts, config);
        self.current_delay
    }

    /// Reset state after successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = Duration::ZERO;
    }

    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        config
            .max_attempts
            .map(|max| self.attempts >= max)
            .unwrap_or(false)
    }
}

/// Event emitted by the relay client.
#[derive(Debug)]
pub enum RelayEvent {
    Connected,
    /// A parsed inbound frame
    Frame(InboundFrame),
    Disconnected,
    /// Reconnection gave up
    Closed,
}

/// Client side of the relay channel.
pub struct RelayClient {
    url: String,
    state: std::sync::Mutex<RelayState>,
    write: Mutex<Option<SplitSink<WsStream, Message>>>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RelayClient {
    /// Start connecting to `url` in the background.
    ///
    /// Returns the client and the receiver for its events. The client keeps
    /// reconnecting until `close` is called or `max_attempts` is exhausted.
    pub fn start(url: impl Into<String>, config: ReconnectConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<RelayEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            url: url.into(),
            state: std::sync::Mutex::new(RelayState::Connecting),
            write: Mutex::new(None),
            supervisor: std::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(Arc::clone(&client).run(config, event_tx));
        *client.supervisor.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        (client, event_rx)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> RelayState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: RelayState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Move to `state` unless the client was closed. Returns false if closed.
    fn transition(&self, state: RelayState) -> bool {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current == RelayState::Closed {
            return false;
        }
        *current = state;
        true
    }

    /// Connect, read until the connection drops, back off, repeat.
    async fn run(self: Arc<Self>, config: ReconnectConfig, event_tx: mpsc::UnboundedSender<RelayEvent>) {
        let mut reconnect = ReconnectState::new();
        loop {
            match connect_async(&self.url).await {
                Ok((ws_stream, _)) => {
                    let (write, read) = ws_stream.split();
                    *self.write.lock().await = Some(write);
                    if !self.transition(RelayState::Connected) {
                        break;
                    }
                    reconnect.reset();
                    info!("Connected to relay {}", self.url);
                    let _ = event_tx.send(RelayEvent::Connected);

                    Self::read_loop(&self.url, read, &event_tx).await;

                    *self.write.lock().await = None;
                    if !self.transition(RelayState::Reconnecting) {
                        break;
                    }
                    let _ = event_tx.send(RelayEvent::Disconnected);
                }
                Err(e) => {
                    warn!("Could not connect to relay {}: {}", self.url, e);
                }
            }

            if event_tx.is_closed() {
                break;
            }
            if reconnect.exceeded_max_attempts(&config) {
                warn!(
                    "Giving up on relay {} after {} attempts",
                    self.url, reconnect.attempts
                );
                self.set_state(RelayState::Closed);
                let _ = event_tx.send(RelayEvent::Closed);
                break;
            }

            if !self.transition(RelayState::Reconnecting) {
                break;
            }
            let delay = reconnect.schedule_reconnect(&config);
            info!(
                "Reconnecting to relay {} in {:?} (attempt {})",
                self.url, delay, reconnect.attempts
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Read loop that forwards parsed frames to the event channel.
    async fn read_loop(
        url: &str,
        mut read: SplitStream<WsStream>,
        event_tx: &mpsc::UnboundedSender<RelayEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Binary(data) => data.to_vec(),
                        Message::Text(text) => text.as_bytes().to_vec(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", url);
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if data.len() > MAX_FRAME_SIZE {
                        warn!(
                            "Frame from {} exceeds max size ({} > {}), dropping",
                            url,
                            data.len(),
                            MAX_FRAME_SIZE
                        );
                        continue;
                    }

                    match InboundFrame::from_json(&data) {
                        Some(frame) => {
                            if event_tx.send(RelayEvent::Frame(frame)).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                        None => debug!("Ignoring unrecognized frame from {} ({} bytes)", url, data.len()),
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Relay connection {} closed", url);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", url, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Relay connection {} stream ended", url);
                    break;
                }
            }
        }
    }

    /// Close the connection for good.
    pub async fn close(&self) {
        self.set_state(RelayState::Closed);

        if let Some(mut write) = self.write.lock().await.take() {
            let _ = write.send(Message::Close(None)).await;
        }

        if let Some(task) = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

#[async_trait]
impl RelayChannel for RelayClient {
    fn is_open(&self) -> bool {
        self.state() == RelayState::Connected
    }

    async fn send(&self, frame: &OutboundFrame) -> channel::Result<()> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        let text = frame.to_json();
        let mut write = self.write.lock().await;
        let Some(write) = write.as_mut() else {
            return Err(ChannelError::NotOpen);
        };
        debug!("Sending {} frame for {}", frame_name(frame), frame.filename());
        write
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }
}

fn frame_name(frame: &OutboundFrame) -> &'static str {
    match frame {
        OutboundFrame::StartDownload { .. } => "start_download",
        OutboundFrame::StartUpload { .. } => "start_upload",
        OutboundFrame::CancelDownload { .. } => "cancel_download",
        OutboundFrame::CancelUpload { .. } => "cancel_upload",
    }
}
