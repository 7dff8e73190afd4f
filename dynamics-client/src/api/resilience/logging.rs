//! Per-attempt diagnostics
//!
//! Every attempt of a logical call produces one [`AttemptRecord`]. The
//! [`ApiLogger`] writes it to the `log` facade and forwards it to an optional
//! [`DiagnosticsSink`] so callers can collect structured records.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Result of one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded,
    /// Failed, another attempt follows after `pause`
    Retrying { pause: Duration, throttled: bool },
    /// Failed, no further attempts
    Failed { throttled: bool, error: String },
    /// The cancellation signal fired before the attempt started
    Cancelled,
}

/// Structured diagnostics for one attempt
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub timestamp: DateTime<Utc>,
    pub request_name: String,
    /// Caller-supplied label (e.g., "Execute Batch - nightly")
    pub tag: Option<String>,
    pub correlation_id: Uuid,
    pub session_tracking_id: Option<Uuid>,
    /// Retries performed before this attempt
    pub retry_count: u32,
    pub elapsed: Duration,
    pub lock_wait: Duration,
    pub outcome: AttemptOutcome,
}

impl AttemptRecord {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Succeeded)
    }
}

/// Receiver for attempt records
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, record: &AttemptRecord);
}

/// Sink that keeps every record in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<AttemptRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AttemptRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
    }
}

impl DiagnosticsSink for MemorySink {
    fn record(&self, record: &AttemptRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

/// Logs attempt records and forwards them to a sink
#[derive(Clone, Default)]
pub struct ApiLogger {
    sink: Option<Arc<dyn DiagnosticsSink>>,
}

impl std::fmt::Debug for ApiLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiLogger")
            .field("sink", &self.sink.as_ref().map(|_| "<sink>"))
            .finish()
    }
}

impl ApiLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn DiagnosticsSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn log_attempt(&self, record: &AttemptRecord) {
        let tag = record.tag.as_deref().unwrap_or("-");
        let session = record
            .session_tracking_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());

        match &record.outcome {
            AttemptOutcome::Succeeded => info!(
                "{} [{}] succeeded: correlation={} session={} retries={} elapsed={}ms lock_wait={}ms",
                record.request_name,
                tag,
                record.correlation_id,
                session,
                record.retry_count,
                record.elapsed.as_millis(),
                record.lock_wait.as_millis()
            ),
            AttemptOutcome::Retrying { pause, throttled } => warn!(
                "{} [{}] failed, retrying in {:?} ({}): correlation={} session={} retries={} elapsed={}ms lock_wait={}ms",
                record.request_name,
                tag,
                pause,
                if *throttled { "throttled" } else { "transient" },
                record.correlation_id,
                session,
                record.retry_count,
                record.elapsed.as_millis(),
                record.lock_wait.as_millis()
            ),
            AttemptOutcome::Failed { throttled, error } => log::error!(
                "{} [{}] failed{}: {} correlation={} session={} retries={} elapsed={}ms lock_wait={}ms",
                record.request_name,
                tag,
                if *throttled { " (throttled)" } else { "" },
                error,
                record.correlation_id,
                session,
                record.retry_count,
                record.elapsed.as_millis(),
                record.lock_wait.as_millis()
            ),
            AttemptOutcome::Cancelled => debug!(
                "{} [{}] cancelled: correlation={} session={} retries={}",
                record.request_name, tag, record.correlation_id, session, record.retry_count
            ),
        }

        if let Some(sink) = &self.sink {
            sink.record(record);
        }
    }
}
