// StreamConnection: one reconnecting, resumable consumer of the bus event stream.
//
// The read loop runs as its own tokio task:
//
//   Idle ─connect()─▶ Connecting ─open ok─▶ Connected ─EOF/error/probe fail─▶ Backoff(n) ─delay─▶ Connecting
//
// Consumers never see a connection error: `connect()` only starts the loop,
// and the loop retries until `disconnect()` cancels it. Each consumer gets
// its own unbounded queue so a slow consumer never stalls the read loop.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::parser::{decode_record, Decoded, RecordParser};
use super::state::{Backoff, ConnectionInput, ConnectionState};
use crate::bus::{BusApi, EventByteStream, Message};
use crate::config::StreamConfig;
use crate::metrics::{DAEMON_CONNECTION, METRICS};

/// Events emitted to consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Message(Message),
    Status(ConnectionStatus),
}

/// Emitted on every connect/disconnect transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected { reason: String },
}

/// Transient, in-memory connection health. Never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamHealth {
    pub connected: bool,
    pub state: ConnectionState,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub reconnect_count: u64,
    /// Opaque resumption cursor.
    pub last_event_id: Option<String>,
    pub probes_sent: u64,
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self {
            connected: false,
            state: ConnectionState::Idle,
            last_connected_at: None,
            last_event_at: None,
            reconnect_count: 0,
            last_event_id: None,
            probes_sent: 0,
        }
    }
}

/// Why a single open stream stopped.
#[derive(Debug)]
enum StreamEnd {
    Cancelled,
    Eof,
    Error(String),
    ProbeFailed(String),
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Shared state the read loop writes and everyone else reads.
struct Shared {
    health: Mutex<StreamHealth>,
    consumers: Mutex<Vec<mpsc::UnboundedSender<StreamEvent>>>,
}

impl Shared {
    fn emit(&self, event: StreamEvent) {
        let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
        consumers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn update<R>(&self, f: impl FnOnce(&mut StreamHealth) -> R) -> R {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut health)
    }

    fn transition(&self, input: ConnectionInput) -> ConnectionState {
        self.update(|h| {
            h.state = h.state.next(input);
            h.connected = h.state.is_connected();
            h.state
        })
    }
}

pub struct StreamConnection {
    bus: Arc<dyn BusApi>,
    machine_id: String,
    config: StreamConfig,
    /// `connection` label on the stream metrics.
    metrics_label: &'static str,
    shared: Arc<Shared>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl StreamConnection {
    pub fn new(bus: Arc<dyn BusApi>, machine_id: impl Into<String>, config: StreamConfig) -> Self {
        Self {
            bus,
            machine_id: machine_id.into(),
            config,
            metrics_label: DAEMON_CONNECTION,
            shared: Arc::new(Shared {
                health: Mutex::new(StreamHealth::default()),
                consumers: Mutex::new(Vec::new()),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Report this connection's metrics under `label` instead of the
    /// daemon's.
    pub fn with_metrics_label(mut self, label: &'static str) -> Self {
        self.metrics_label = label;
        self
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Register a consumer. Each consumer gets every event emitted after
    /// this call, in emission order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Snapshot of connection health.
    pub fn health(&self) -> StreamHealth {
        self.shared.update(|h| h.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.update(|h| h.connected)
    }

    /// Whether the read loop task is alive. A live loop may be connecting or
    /// waiting out a backoff delay.
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Start the read loop. No-op if it is already running.
    pub async fn connect(&self) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let worker = ReadLoop {
            bus: self.bus.clone(),
            machine_id: self.machine_id.clone(),
            config: self.config.clone(),
            backoff: Backoff::from_config(&self.config),
            metrics_label: self.metrics_label,
            shared: self.shared.clone(),
            cancel: cancel.clone(),
        };
        self.shared.update(|h| h.state = ConnectionState::Idle);
        let handle = tokio::spawn(worker.run());
        *running = Some(Running { cancel, handle });
        tracing::debug!(machine_id = %self.machine_id, "stream read loop started");
    }

    /// Stop the read loop. Idempotent: cancels any pending reconnect and the
    /// keepalive timer, aborts the in-flight request, and emits nothing
    /// after returning.
    pub async fn disconnect(&self) {
        let mut running = self.running.lock().await;
        let Some(Running { cancel, handle }) = running.take() else {
            return;
        };
        cancel.cancel();
        handle.abort();
        let _ = handle.await;

        let was_connected = self.shared.update(|h| {
            let was = h.connected;
            h.state = h.state.next(ConnectionInput::Stopped);
            h.connected = false;
            was
        });
        METRICS
            .stream_connected
            .with_label_values(&[self.metrics_label])
            .set(0);
        if was_connected {
            self.shared.emit(StreamEvent::Status(ConnectionStatus::Disconnected {
                reason: "disconnect requested".to_string(),
            }));
        }
        tracing::debug!(machine_id = %self.machine_id, "stream read loop stopped");
    }
}

struct ReadLoop {
    bus: Arc<dyn BusApi>,
    machine_id: String,
    config: StreamConfig,
    backoff: Backoff,
    metrics_label: &'static str,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl ReadLoop {
    async fn run(self) {
        let mut attempt: u32 = 0;
        let mut ever_connected = false;

        loop {
            self.shared.update(|h| {
                h.state = ConnectionState::Connecting;
                h.connected = false;
                h.last_event_at = None;
            });
            let cursor = self.shared.update(|h| h.last_event_id.clone());

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.bus.open_stream(&self.machine_id, cursor.as_deref()) => result,
            };

            match opened {
                Ok(stream) => {
                    attempt = 0;
                    self.shared.update(|h| {
                        h.state = h.state.next(ConnectionInput::Opened);
                        h.connected = true;
                        h.last_connected_at = Some(Utc::now());
                        if ever_connected {
                            h.reconnect_count += 1;
                        }
                    });
                    if ever_connected {
                        METRICS
                            .stream_reconnects
                            .with_label_values(&[self.metrics_label])
                            .inc();
                    }
                    ever_connected = true;
                    self.set_connected_gauge(1);
                    tracing::info!(
                        machine_id = %self.machine_id,
                        resumed_from = cursor.as_deref().unwrap_or("-"),
                        "event stream connected"
                    );
                    self.shared
                        .emit(StreamEvent::Status(ConnectionStatus::Connected));

                    let end = self.consume(stream).await;
                    self.set_connected_gauge(0);
                    let (input, reason) = match end {
                        StreamEnd::Cancelled => return,
                        StreamEnd::Eof => (ConnectionInput::Failed, "stream closed".to_string()),
                        StreamEnd::Error(e) => (ConnectionInput::Failed, e),
                        StreamEnd::ProbeFailed(e) => {
                            (ConnectionInput::ProbeFailed, format!("keepalive probe failed: {}", e))
                        }
                    };
                    self.shared.transition(input);
                    tracing::warn!(machine_id = %self.machine_id, %reason, "event stream disconnected");
                    self.shared.emit(StreamEvent::Status(ConnectionStatus::Disconnected {
                        reason,
                    }));
                }
                Err(e) => {
                    self.shared.update(|h| {
                        h.state = h.state.next_after_attempt(ConnectionInput::Failed, attempt);
                        h.connected = false;
                    });
                    if e.is_auth() {
                        tracing::error!(error = %e, "event stream rejected the credential");
                    } else {
                        tracing::warn!(error = %e, "failed to open event stream");
                    }
                }
            }

            attempt = attempt.saturating_add(1);
            self.shared
                .update(|h| h.state = ConnectionState::Backoff { attempt });
            let delay = self.backoff.delay(attempt);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting after delay");

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn set_connected_gauge(&self, value: i64) {
        METRICS
            .stream_connected
            .with_label_values(&[self.metrics_label])
            .set(value);
    }

    /// Read one open stream until it ends, keeping it honest with probes.
    async fn consume(&self, mut stream: EventByteStream) -> StreamEnd {
        let mut parser = RecordParser::new();
        let idle = Duration::from_millis(self.config.keepalive_idle_ms);
        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let mut check = tokio::time::interval(Duration::from_millis(self.config.keepalive_check_ms));
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Last event or last successful probe, whichever is later.
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
                chunk = stream.next() => match chunk {
                    None => return StreamEnd::Eof,
                    Some(Err(e)) => return StreamEnd::Error(e.to_string()),
                    Some(Ok(bytes)) => {
                        for record in parser.push(&bytes) {
                            last_activity = Instant::now();
                            self.handle_record(record);
                        }
                    }
                },
                _ = check.tick() => {
                    if last_activity.elapsed() < idle {
                        continue;
                    }
                    self.shared.update(|h| h.probes_sent += 1);
                    let probe = tokio::time::timeout(probe_timeout, self.bus.probe(&self.machine_id));
                    let result = tokio::select! {
                        _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
                        result = probe => result,
                    };
                    match result {
                        Ok(Ok(())) => {
                            METRICS.keepalive_probes.with_label_values(&["ok"]).inc();
                            tracing::debug!("keepalive probe ok");
                            last_activity = Instant::now();
                        }
                        Ok(Err(e)) => {
                            METRICS.keepalive_probes.with_label_values(&["failed"]).inc();
                            return StreamEnd::ProbeFailed(e.to_string());
                        }
                        Err(_) => {
                            METRICS.keepalive_probes.with_label_values(&["timeout"]).inc();
                            return StreamEnd::ProbeFailed(format!("no answer within {:?}", probe_timeout));
                        }
                    }
                }
            }
        }
    }

    fn handle_record(&self, record: super::parser::StreamRecord) {
        let cursor = record.id.clone();
        self.shared.update(|h| {
            h.last_event_at = Some(Utc::now());
            if cursor.is_some() {
                h.last_event_id = cursor;
            }
        });

        match decode_record(&record) {
            Ok(Decoded::Message(message)) => {
                tracing::trace!(message_id = %message.id, "stream message");
                self.shared.emit(StreamEvent::Message(message));
            }
            Ok(Decoded::Ignored) => {}
            Err(reason) => {
                tracing::warn!(%reason, event = record.event.as_deref().unwrap_or("-"), "dropping malformed stream record");
            }
        }
    }
}
