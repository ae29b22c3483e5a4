//! Observability events and the fan-out collector.
//!
//! Every sink gets its own bounded queue drained by a dedicated task.
//! [`EventCollector::emit`] only ever `try_send`s, so a slow sink loses
//! events instead of slowing the orchestrator down.

use crate::{
    Result,
    capabilities::{HealthResult, ObservabilitySink},
    state::ServiceState,
};
use async_channel::{Receiver, Sender, TrySendError};
use chrono::{DateTime, Utc};
use futures::AsyncWriteExt;
use futures::lock::Mutex as AsyncMutex;
use hive_runtime::Spawner;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, trace, warn};

/// Severity of a log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace
    Trace,
    /// Debug
    Debug,
    /// Info
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

/// Free-form log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: LogLevel,
    /// Service the line concerns
    pub service: Option<String>,
    /// Message
    pub message: String,
}

/// A service entered a lifecycle state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Service name
    pub service: String,
    /// State entered
    pub state: ServiceState,
    /// What caused the transition
    pub message: String,
}

impl LifecycleEvent {
    /// Event stamped now
    pub fn new(service: impl Into<String>, state: ServiceState, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            service: service.into(),
            state,
            message: message.into(),
        }
    }
}

/// Result of one health check probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckEvent {
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Service name
    pub service: String,
    /// Health check id
    pub check: String,
    /// Probe result
    pub result: HealthResult,
}

/// Numeric measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    /// When it was taken
    pub timestamp: DateTime<Utc>,
    /// Metric name
    pub name: String,
    /// Value
    pub value: f64,
    /// Dimensions
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Event distributed to every sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObservabilityEvent {
    /// Log line
    Log(LogEvent),
    /// Lifecycle transition
    Lifecycle(LifecycleEvent),
    /// Health probe result
    HealthCheck(HealthCheckEvent),
    /// Metric sample
    Metric(MetricEvent),
}

impl ObservabilityEvent {
    /// Log event for a service
    pub fn log(level: LogLevel, service: Option<&str>, message: impl Into<String>) -> Self {
        ObservabilityEvent::Log(LogEvent {
            timestamp: Utc::now(),
            level,
            service: service.map(str::to_string),
            message: message.into(),
        })
    }

    /// Warning about a service
    pub fn warning(service: &str, message: impl Into<String>) -> Self {
        Self::log(LogLevel::Warn, Some(service), message)
    }

    /// Health probe event
    pub fn health(service: &str, check: &str, result: HealthResult) -> Self {
        ObservabilityEvent::HealthCheck(HealthCheckEvent {
            timestamp: Utc::now(),
            service: service.to_string(),
            check: check.to_string(),
            result,
        })
    }

    /// Metric sample with labels
    pub fn metric<'a>(
        name: impl Into<String>,
        value: f64,
        labels: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        ObservabilityEvent::Metric(MetricEvent {
            timestamp: Utc::now(),
            name: name.into(),
            value,
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }

    /// When the event happened
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ObservabilityEvent::Log(e) => e.timestamp,
            ObservabilityEvent::Lifecycle(e) => e.timestamp,
            ObservabilityEvent::HealthCheck(e) => e.timestamp,
            ObservabilityEvent::Metric(e) => e.timestamp,
        }
    }

    /// Service the event concerns, if any
    pub fn service(&self) -> Option<&str> {
        match self {
            ObservabilityEvent::Log(e) => e.service.as_deref(),
            ObservabilityEvent::Lifecycle(e) => Some(&e.service),
            ObservabilityEvent::HealthCheck(e) => Some(&e.service),
            ObservabilityEvent::Metric(e) => e.labels.get("service").map(String::as_str),
        }
    }

    /// Whether this is a log event at warning level or above
    pub fn is_warning(&self) -> bool {
        matches!(self, ObservabilityEvent::Log(e) if e.level >= LogLevel::Warn)
    }
}

impl From<LifecycleEvent> for ObservabilityEvent {
    fn from(event: LifecycleEvent) -> Self {
        ObservabilityEvent::Lifecycle(event)
    }
}

enum Envelope {
    Event(Arc<ObservabilityEvent>),
    Flush(Sender<Result<()>>),
}

struct SinkQueue {
    id: String,
    tx: Sender<Envelope>,
    dropped: Arc<AtomicU64>,
}

/// Fire-and-forget fan-out to every registered sink
pub struct EventCollector {
    queues: Vec<SinkQueue>,
}

impl EventCollector {
    /// Start one worker per sink, each with a queue of `capacity` events
    pub fn new(
        sinks: Vec<(String, Arc<dyn ObservabilitySink>)>,
        capacity: usize,
        spawner: &Arc<dyn Spawner>,
    ) -> Self {
        let queues = sinks
            .into_iter()
            .map(|(id, sink)| {
                let (tx, rx) = async_channel::bounded(capacity.max(1));
                spawner.spawn(Box::pin(drain(id.clone(), sink, rx)));
                SinkQueue {
                    id,
                    tx,
                    dropped: Arc::new(AtomicU64::new(0)),
                }
            })
            .collect();
        Self { queues }
    }

    /// Collector with no sinks
    pub fn disabled() -> Self {
        Self { queues: Vec::new() }
    }

    /// Queue an event for every sink without waiting
    pub fn emit(&self, event: impl Into<ObservabilityEvent>) {
        if self.queues.is_empty() {
            return;
        }
        let event = Arc::new(event.into());
        for queue in &self.queues {
            match queue.tx.try_send(Envelope::Event(event.clone())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let dropped = queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    trace!(sink = %queue.id, dropped, "Sink queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    queue.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Events dropped so far, per sink id
    pub fn dropped(&self) -> BTreeMap<String, u64> {
        self.queues
            .iter()
            .map(|q| (q.id.clone(), q.dropped.load(Ordering::Relaxed)))
            .collect()
    }

    /// Wait for every queued event to be handled, then flush each sink
    ///
    /// Returns the first sink flush error after all sinks were flushed.
    pub async fn flush(&self) -> Result<()> {
        let mut first_error = None;
        for queue in &self.queues {
            let (reply_tx, reply_rx) = async_channel::bounded(1);
            if queue.tx.send(Envelope::Flush(reply_tx)).await.is_err() {
                continue;
            }
            if let Ok(Err(e)) = reply_rx.recv().await {
                warn!(sink = %queue.id, "Sink flush failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn drain(id: String, sink: Arc<dyn ObservabilitySink>, rx: Receiver<Envelope>) {
    debug!(sink = %id, "Observability sink worker started");
    while let Ok(envelope) = rx.recv().await {
        match envelope {
            Envelope::Event(event) => sink.handle(&event).await,
            Envelope::Flush(reply) => {
                let _ = reply.send(sink.flush().await).await;
            }
        }
    }
    debug!(sink = %id, "Observability sink worker stopped");
}

/// Re-emits events as `tracing` records
pub struct TracingSink;

#[async_trait::async_trait]
impl ObservabilitySink for TracingSink {
    async fn handle(&self, event: &ObservabilityEvent) {
        match event {
            ObservabilityEvent::Log(e) => {
                let service = e.service.as_deref().unwrap_or("-");
                match e.level {
                    LogLevel::Trace => trace!(service, "{}", e.message),
                    LogLevel::Debug => debug!(service, "{}", e.message),
                    LogLevel::Info => info!(service, "{}", e.message),
                    LogLevel::Warn => warn!(service, "{}", e.message),
                    LogLevel::Error => error!(service, "{}", e.message),
                }
            }
            ObservabilityEvent::Lifecycle(e) => {
                info!(service = %e.service, state = %e.state, "{}", e.message);
            }
            ObservabilityEvent::HealthCheck(e) => {
                debug!(
                    service = %e.service,
                    check = %e.check,
                    healthy = e.result.healthy,
                    response_time_ms = e.result.response_time_ms,
                    "{}",
                    e.result.message.as_deref().unwrap_or("health check")
                );
            }
            ObservabilityEvent::Metric(e) => {
                debug!(metric = %e.name, value = e.value, labels = ?e.labels, "metric");
            }
        }
    }
}

/// Keeps the most recent events in memory
pub struct MemorySink {
    events: Mutex<VecDeque<ObservabilityEvent>>,
    capacity: usize,
}

impl MemorySink {
    /// Sink holding at most `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Copy of the buffered events, oldest first
    pub fn events(&self) -> Vec<ObservabilityEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Buffered warnings and errors
    pub fn warnings(&self) -> Vec<ObservabilityEvent> {
        self.events().into_iter().filter(|e| e.is_warning()).collect()
    }

    /// Forget everything buffered
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait::async_trait]
impl ObservabilitySink for MemorySink {
    async fn handle(&self, event: &ObservabilityEvent) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

/// Appends each event as one JSON line to a file
pub struct JsonLinesSink {
    path: PathBuf,
    file: AsyncMutex<Option<async_fs::File>>,
}

impl JsonLinesSink {
    /// Sink writing to `path`; the file is created on first use
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: AsyncMutex::new(None),
        }
    }

    async fn write_line(&self, line: &[u8]) -> Result<()> {
        let mut file = self.file.lock().await;
        if file.is_none() {
            *file = Some(
                async_fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await?,
            );
        }
        if let Some(file) = file.as_mut() {
            file.write_all(line).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObservabilitySink for JsonLinesSink {
    async fn handle(&self, event: &ObservabilityEvent) {
        let mut line = match serde_json::to_vec(event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode event: {}", e);
                return;
            }
        };
        line.push(b'\n');
        if let Err(e) = self.write_line(&line).await {
            warn!(path = %self.path.display(), "Failed to write event: {}", e);
        }
    }

    async fn flush(&self) -> Result<()> {
        if let Some(file) = self.file.lock().await.as_mut() {
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }
}
