//! Reconnecting duplex channel to the workspace service.
//!
//! One [`WorkspaceChannel`] exists per workspace id; its endpoint is derived
//! deterministically from the id by [`crate::config::Config::workspace_endpoint`].
//! A single supervisor task owns the socket lifecycle: connect, pump frames,
//! heartbeat, and back off on unexpected closes. Sends never queue; a send
//! while the socket is not open reports failure and the caller retries or
//! drops, since replaying stale operations against a changed remote state is
//! worse than losing them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

use workspace_proto::{ClientCommand, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Connected,
    ConnectionError,
    Disconnected,
    /// Automatic retries exhausted; only [`WorkspaceChannel::reconnect`]
    /// leaves this state.
    ConnectionFailed,
}

impl ChannelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelStatus::Connecting => "connecting",
            ChannelStatus::Connected => "connected",
            ChannelStatus::ConnectionError => "connection-error",
            ChannelStatus::Disconnected => "disconnected",
            ChannelStatus::ConnectionFailed => "connection-failed",
        }
    }
}

/// What the channel feeds into the cache reducer.
#[derive(Debug)]
pub enum ChannelEvent {
    Inbound(ServerEvent),
    /// The socket was lost; pending request sets must be cleared.
    Reset,
}

/// Outbound command surface, abstracted so schedulers and coordinators can
/// be tested against a recording fake.
pub trait CommandSink: Send + Sync {
    /// Returns false when the channel is not open. Never queues.
    fn send_command(&self, command: &ClientCommand) -> bool;
}

#[derive(Debug, Clone)]
pub struct ChannelTuning {
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub max_attempts: u32,
    pub heartbeat: Duration,
}

impl Default for ChannelTuning {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(30),
            max_attempts: 5,
            heartbeat: Duration::from_secs(30),
        }
    }
}

/// Delay before reconnect attempt `attempt` (zero-based): doubling from the
/// base, capped.
pub fn backoff_delay(tuning: &ChannelTuning, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(16);
    tuning.retry_base.saturating_mul(factor).min(tuning.retry_cap)
}

enum SocketExit {
    Dropped,
    ManualReconnect,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WorkspaceChannel {
    inner: Arc<ChannelInner>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct ChannelInner {
    endpoint: Url,
    tuning: ChannelTuning,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    status_tx: watch::Sender<ChannelStatus>,
    status_rx: watch::Receiver<ChannelStatus>,
    /// Present exactly while a socket is open.
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    reconnect: Notify,
    supervising: AtomicBool,
}

impl WorkspaceChannel {
    /// Create a channel for an already-resolved endpoint. The returned
    /// receiver carries inbound events and reset markers, in arrival order.
    pub fn new(
        endpoint: Url,
        tuning: ChannelTuning,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Disconnected);
        let channel = Self {
            inner: Arc::new(ChannelInner {
                endpoint,
                tuning,
                events_tx,
                status_tx,
                status_rx,
                outbound: Mutex::new(None),
                reconnect: Notify::new(),
                supervising: AtomicBool::new(false),
            }),
            supervisor: Mutex::new(None),
        };
        (channel, events_rx)
    }

    /// Start the supervisor. Idempotent: while one is alive for this channel,
    /// further calls are no-ops.
    pub fn connect(&self) {
        if self.inner.supervising.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.supervise().await });
        *self.supervisor.lock() = Some(handle);
    }

    /// Force-close any live socket, reset the attempt counter, and reconnect
    /// immediately. Also the only way out of `ConnectionFailed`.
    pub fn reconnect(&self) {
        tracing::info!(target: "atelier::channel", "manual reconnect requested");
        self.inner.reconnect.notify_one();
    }

    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status_rx.clone()
    }

    pub fn current_status(&self) -> ChannelStatus {
        *self.inner.status_rx.borrow()
    }
}

impl CommandSink for WorkspaceChannel {
    fn send_command(&self, command: &ClientCommand) -> bool {
        if self.current_status() != ChannelStatus::Connected {
            tracing::warn!(
                target: "atelier::channel",
                status = self.current_status().as_str(),
                "cannot send, channel is not open"
            );
            return false;
        }
        let guard = self.inner.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            tracing::warn!(target: "atelier::channel", "cannot send, no live socket");
            return false;
        };
        match serde_json::to_string(command) {
            Ok(json) => tx.send(Message::Text(json)).is_ok(),
            Err(err) => {
                tracing::warn!(target: "atelier::channel", error = %err, "failed to encode command");
                false
            }
        }
    }
}

impl Drop for WorkspaceChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }
}

impl ChannelInner {
    async fn supervise(self: Arc<Self>) {
        let mut attempts: u32 = 0;
        loop {
            self.set_status(ChannelStatus::Connecting);
            match connect_async(self.endpoint.as_str()).await {
                Ok((stream, _)) => {
                    attempts = 0;
                    tracing::info!(
                        target: "atelier::channel",
                        endpoint = %self.endpoint,
                        "workspace connection established"
                    );
                    self.set_status(ChannelStatus::Connected);
                    let exit = self.run_socket(stream).await;
                    let _ = self.events_tx.send(ChannelEvent::Reset);
                    self.set_status(ChannelStatus::Disconnected);
                    if matches!(exit, SocketExit::ManualReconnect) {
                        continue;
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target: "atelier::channel",
                        endpoint = %self.endpoint,
                        error = %err,
                        "workspace connect failed"
                    );
                    self.set_status(ChannelStatus::ConnectionError);
                }
            }

            if attempts >= self.tuning.max_attempts {
                tracing::error!(
                    target: "atelier::channel",
                    attempts,
                    "reconnect attempts exhausted"
                );
                self.set_status(ChannelStatus::ConnectionFailed);
                self.reconnect.notified().await;
                attempts = 0;
                continue;
            }

            let delay = backoff_delay(&self.tuning, attempts);
            attempts += 1;
            tracing::info!(
                target: "atelier::channel",
                attempt = attempts,
                max = self.tuning.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.reconnect.notified() => {
                    attempts = 0;
                }
            }
        }
    }

    async fn run_socket(&self, stream: WsStream) -> SocketExit {
        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock() = Some(out_tx);

        let mut heartbeat = tokio::time::interval(self.tuning.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately; consume the first tick
        heartbeat.tick().await;

        let exit = loop {
            tokio::select! {
                outbound = out_rx.recv() => {
                    match outbound {
                        Some(message) => {
                            if sink.send(message).await.is_err() {
                                break SocketExit::Dropped;
                            }
                        }
                        None => break SocketExit::Dropped,
                    }
                }
                _ = heartbeat.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break SocketExit::Dropped;
                    }
                }
                inbound = source.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                            Ok(text) => self.handle_frame(&text),
                            Err(_) => tracing::warn!(
                                target: "atelier::channel",
                                "dropping non-utf8 binary frame"
                            ),
                        },
                        Some(Ok(Message::Close(_))) | None => break SocketExit::Dropped,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::warn!(target: "atelier::channel", error = %err, "socket error");
                            break SocketExit::Dropped;
                        }
                    }
                }
                _ = self.reconnect.notified() => break SocketExit::ManualReconnect,
            }
        };

        *self.outbound.lock() = None;
        exit
    }

    fn handle_frame(&self, text: &str) {
        crate::telemetry::record_bytes("channel.inbound", text.len());
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(ServerEvent::Unknown) => {
                tracing::debug!(target: "atelier::channel", raw = text, "ignoring unknown server action");
            }
            Ok(event) => {
                let _ = self.events_tx.send(ChannelEvent::Inbound(event));
            }
            Err(err) => {
                tracing::warn!(target: "atelier::channel", error = %err, "dropping malformed frame");
            }
        }
    }

    fn set_status(&self, status: ChannelStatus) {
        let changed = *self.status_rx.borrow() != status;
        if changed {
            tracing::debug!(target: "atelier::channel", status = status.as_str(), "channel status");
        }
        self.status_tx.send_replace(status);
    }
}
