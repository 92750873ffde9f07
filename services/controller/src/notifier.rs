//! Transition notifications.
//!
//! Every committed status change of an instance is turned into a
//! [`TransitionRecord`] and handed to a [`NotificationSink`]. Delivery is
//! best-effort: a slow or failing sink is logged and counted, never allowed
//! to hold up or fail the state change that produced the record.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ensemble_id::InstanceKey;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::state::InstanceStatus;

/// Default upper bound on one delivery.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Severity of a transition record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Normal,
    Warning,
}

/// One instance status change, ready for an event sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub instance: InstanceKey,
    pub status: InstanceStatus,
    pub severity: Severity,
    pub reason: String,
    pub message: String,
    pub observed_at: DateTime<Utc>,
}

/// Map a new status to `(severity, reason, message)`.
pub fn describe(key: &InstanceKey, status: InstanceStatus) -> (Severity, &'static str, String) {
    let subject = format!(
        "instance {} of role {} in group {}",
        key.instance_id,
        key.role_name(),
        key.group()
    );

    match status {
        InstanceStatus::Creating => (
            Severity::Normal,
            "InstanceCreating",
            format!("Creating {subject}"),
        ),
        InstanceStatus::Running => (
            Severity::Normal,
            "InstanceRunning",
            format!("All resources of {subject} are ready"),
        ),
        InstanceStatus::Deleting => (
            Severity::Warning,
            "InstanceDeleting",
            format!("Deleting {subject}"),
        ),
    }
}

impl TransitionRecord {
    pub fn new(key: &InstanceKey, status: InstanceStatus) -> Self {
        let (severity, reason, message) = describe(key, status);
        Self {
            instance: key.clone(),
            status,
            severity,
            reason: reason.to_string(),
            message,
            observed_at: Utc::now(),
        }
    }
}

/// Sink delivery errors.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,

    #[error("sink rejected record: {0}")]
    Rejected(String),
}

/// Destination for transition records.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one record.
    async fn deliver(&self, record: TransitionRecord) -> Result<(), SinkError>;

    /// Sink name for logs.
    fn name(&self) -> &'static str;
}

// =============================================================================
// Sinks
// =============================================================================

/// Writes records to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn deliver(&self, record: TransitionRecord) -> Result<(), SinkError> {
        match record.severity {
            Severity::Normal => info!(
                instance = %record.instance,
                status = %record.status,
                reason = %record.reason,
                "{}", record.message
            ),
            Severity::Warning => warn!(
                instance = %record.instance,
                status = %record.status,
                reason = %record.reason,
                "{}", record.message
            ),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// Forwards records over a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<TransitionRecord>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<TransitionRecord>) -> Self {
        Self { tx }
    }

    /// Create a sink and the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TransitionRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn deliver(&self, record: TransitionRecord) -> Result<(), SinkError> {
        self.tx.send(record).await.map_err(|_| SinkError::Closed)
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<TransitionRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<TransitionRecord> {
        self.records.lock().await.clone()
    }

    /// Number of records for `key` reporting `status`.
    pub async fn count(&self, key: &InstanceKey, status: InstanceStatus) -> usize {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| &r.instance == key && r.status == status)
            .count()
    }

    /// Statuses reported for `key`, in delivery order.
    pub async fn history(&self, key: &InstanceKey) -> Vec<InstanceStatus> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| &r.instance == key)
            .map(|r| r.status)
            .collect()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn deliver(&self, record: TransitionRecord) -> Result<(), SinkError> {
        self.records.lock().await.push(record);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// =============================================================================
// Notifier
// =============================================================================

/// Best-effort emitter of transition records.
pub struct TransitionNotifier {
    sink: Arc<dyn NotificationSink>,
    send_timeout: Duration,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl TransitionNotifier {
    pub fn new(sink: Arc<dyn NotificationSink>, send_timeout: Duration) -> Self {
        Self {
            sink,
            send_timeout,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Emit a record for `key` entering `status`.
    ///
    /// Never fails. Delivery errors and timeouts are logged and counted.
    pub async fn notify(&self, key: &InstanceKey, status: InstanceStatus) {
        let record = TransitionRecord::new(key, status);

        match tokio::time::timeout(self.send_timeout, self.sink.deliver(record)).await {
            Ok(Ok(())) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    instance = %key,
                    %status,
                    sink = self.sink.name(),
                    error = %e,
                    "Failed to deliver transition record"
                );
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    instance = %key,
                    %status,
                    sink = self.sink.name(),
                    timeout_ms = self.send_timeout.as_millis() as u64,
                    "Timed out delivering transition record"
                );
            }
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TransitionNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionNotifier")
            .field("sink", &self.sink.name())
            .field("send_timeout", &self.send_timeout)
            .field("delivered", &self.delivered())
            .field("dropped", &self.dropped())
            .finish()
    }
}
