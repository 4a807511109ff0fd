//! NakenChat connection management
//!
//! Owns the TCP socket exclusively: a background read loop frames and
//! sanitizes inbound lines and hands them to the dispatch channel, the
//! write path serializes outbound lines, and a single-flight reconnect
//! task drives the backoff state machine after read or write failures.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (read error/EOF)
//!      ^                                          |
//!      |            Reconnecting <----------------+
//!      +--- attempts exhausted --+   ^___ retry __|
//!
//! ShuttingDown: terminal, reachable from anywhere via disconnect()
//! ```

use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::classifier::sanitize_line;
use crate::config::ChatConfig;

/// Grace period for the best-effort `.q` quit notice on disconnect.
const QUIT_NOTICE_TIMEOUT: Duration = Duration::from_millis(500);

/// Transport-level failures
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal; no further reconnection attempts.
    ShuttingDown,
}

struct ConnInner {
    config: ChatConfig,
    username: String,
    /// Sanitized inbound lines flow to the bot's dispatch loop.
    line_tx: mpsc::Sender<String>,
    /// Async mutex doubles as the per-send exclusive-write scope.
    writer: Mutex<Option<OwnedWriteHalf>>,
    state: SyncMutex<ConnectionState>,
    shutdown: AtomicBool,
    attempts: AtomicU32,
    read_task: SyncMutex<Option<JoinHandle<()>>>,
    reconnect_task: SyncMutex<Option<JoinHandle<()>>>,
}

/// Handle to the one persistent chat connection. Cheap to clone; all
/// clones share the socket and state machine.
#[derive(Clone)]
pub struct ChatConnection {
    inner: Arc<ConnInner>,
}

impl ChatConnection {
    pub fn new(config: ChatConfig, username: &str, line_tx: mpsc::Sender<String>) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                config,
                username: username.to_string(),
                line_tx,
                writer: Mutex::new(None),
                state: SyncMutex::new(ConnectionState::Disconnected),
                shutdown: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                read_task: SyncMutex::new(None),
                reconnect_task: SyncMutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.inner.state.lock();
        if *state != next {
            info!(from = ?*state, to = ?next, "connection state");
            *state = next;
        }
    }

    /// Open the transport, register the bot name with `.n`, and start
    /// the background read loop.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let host = &self.inner.config.host;
        let port = self.inner.config.port;

        self.set_state(ConnectionState::Connecting);
        info!(host, port, "connecting to chat server");

        let stream = match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ConnectionError::Connect(e));
            }
        };

        let (read_half, write_half) = stream.into_split();
        *self.inner.writer.lock().await = Some(write_half);
        self.inner.attempts.store(0, Ordering::Relaxed);
        self.set_state(ConnectionState::Connected);

        self.send(&format!(".n {}", self.inner.username)).await?;
        info!(username = %self.inner.username, "registered display name");

        let conn = self.clone();
        let handle = tokio::spawn(async move { conn.read_loop(read_half).await });
        *self.inner.read_task.lock() = Some(handle);

        Ok(())
    }

    /// Write one newline-terminated line. Fails with `NotConnected` when
    /// there is no live socket; a write failure drops the socket and
    /// triggers the reconnection policy.
    pub async fn send(&self, line: &str) -> Result<(), ConnectionError> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConnectionError::NotConnected)?;

        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(b'\n');

        match writer.write_all(&frame).await {
            Ok(()) => {
                debug!(line, "sent");
                Ok(())
            }
            Err(e) => {
                error!("write failed: {e}");
                *guard = None;
                drop(guard);
                self.schedule_reconnect();
                Err(ConnectionError::Write(e))
            }
        }
    }

    /// Graceful shutdown: best-effort `.q` quit notice, cancel the read
    /// loop and any pending reconnect, close the socket. Terminal.
    pub async fn disconnect(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::ShuttingDown);

        let read_task = self.inner.read_task.lock().take();
        if let Some(handle) = read_task {
            handle.abort();
            let _ = handle.await;
        }

        let reconnect_task = self.inner.reconnect_task.lock().take();
        if let Some(handle) = reconnect_task {
            handle.abort();
            let _ = handle.await;
        }

        match timeout(QUIT_NOTICE_TIMEOUT, self.send(".q")).await {
            Ok(Ok(())) => info!("sent quit notice"),
            Ok(Err(e)) => warn!("failed to send quit notice: {e}"),
            Err(_) => warn!("quit notice timed out"),
        }

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        info!("disconnected from chat server");
    }

    /// Block for one line at a time until EOF, read error or shutdown.
    /// Invalid bytes are dropped from the lossy decode, never fatal.
    async fn read_loop(&self, read_half: OwnedReadHalf) {
        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    // Peer closed: a connection error unless shutting down.
                    if !self.is_shutting_down() {
                        warn!("server closed connection");
                    }
                    break;
                }
                Ok(_) => {
                    let decoded = String::from_utf8_lossy(&buf).replace('\u{FFFD}', "");
                    let line = sanitize_line(&decoded);
                    if line.is_empty() {
                        continue;
                    }
                    debug!(%line, "received");
                    if self.inner.line_tx.send(line).await.is_err() {
                        // Dispatch loop is gone; nothing left to do.
                        break;
                    }
                }
                Err(e) => {
                    if !self.is_shutting_down() {
                        error!("read failed: {e}");
                    }
                    break;
                }
            }
        }

        if !self.is_shutting_down() {
            self.schedule_reconnect();
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Start the reconnect task unless one is already pending.
    fn schedule_reconnect(&self) {
        if self.is_shutting_down() {
            return;
        }

        let mut guard = self.inner.reconnect_task.lock();
        if guard.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        self.set_state(ConnectionState::Reconnecting);
        let conn = self.clone();
        *guard = Some(tokio::spawn(async move { conn.reconnect_loop().await }));
    }

    /// Retry with fixed backoff until success or attempt exhaustion.
    async fn reconnect_loop(&self) {
        // The old socket is dead; sends degrade to NotConnected until
        // a new one is installed.
        *self.inner.writer.lock().await = None;

        let max_attempts = self.inner.config.max_reconnect_attempts;
        loop {
            let attempt = self.inner.attempts.fetch_add(1, Ordering::Relaxed) + 1;
            if attempt > max_attempts {
                error!(max_attempts, "max reconnection attempts reached");
                self.set_state(ConnectionState::Disconnected);
                return;
            }

            info!(attempt, max_attempts, "attempting reconnection");
            sleep(self.inner.config.reconnect_delay).await;
            if self.is_shutting_down() {
                return;
            }

            match self.connect().await {
                Ok(()) => {
                    info!("successfully reconnected");
                    return;
                }
                Err(e) => {
                    warn!(attempt, "reconnection failed: {e}");
                    self.set_state(ConnectionState::Reconnecting);
                }
            }
        }
    }
}
