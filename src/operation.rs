//! # Sync Operation Model
//!
//! Progress record for a single attendance sync run. The orchestrator is
//! the only writer for the lifetime of a run; once the operation reaches a
//! terminal status it is never mutated again.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The flavor of sync run requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    /// Full re-pull of the configured date range.
    Full,
    /// Delta pull since the last successful run.
    Incremental,
    /// Operator-initiated run.
    Manual,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Full => "full",
            SyncKind::Incremental => "incremental",
            SyncKind::Manual => "manual",
        }
    }
}

/// Lifecycle status of a sync operation.
///
/// `Pending -> Running -> {Completed, Failed, Cancelled}`; the last three
/// are terminal and reached exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatus::Completed | SyncStatus::Failed | SyncStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
        }
    }
}

/// Inclusive attendance date range covered by a run. Immutable once the
/// operation is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }
}

/// Monotonically non-decreasing progress counters for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Records known to exist (seeded from upstream total hints, otherwise
    /// grown as pages arrive).
    pub total: u64,
    /// Records handed to the record sink.
    pub processed: u64,
    /// Records the sink accepted.
    pub succeeded: u64,
    /// Records the sink rejected.
    pub failed: u64,
    /// Batches started so far across all partitions.
    pub current_batch: u32,
    /// Batches known so far (current plus any the upstream has signalled).
    pub total_batches: u32,
}

/// One entry in the operation's append-only error log.
///
/// Carries only the failure message, batch identity, and timestamp; raw
/// upstream payloads and credentials never land here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOperationError {
    pub id: String,
    pub partition: String,
    pub batch_number: u32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// One run of an attendance sync job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: String,
    pub kind: SyncKind,
    pub status: SyncStatus,
    pub date_range: DateRange,
    pub progress: SyncProgress,
    pub errors: Vec<SyncOperationError>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SyncOperation {
    /// Create a new operation in `Pending` state.
    pub fn new(kind: SyncKind, date_range: DateRange) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            status: SyncStatus::Pending,
            date_range,
            progress: SyncProgress::default(),
            errors: Vec::new(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Append a batch-level failure to the error log.
    pub fn record_error<S: Into<String>>(&mut self, partition: &str, batch_number: u32, message: S) {
        self.errors.push(SyncOperationError {
            id: Uuid::new_v4().to_string(),
            partition: partition.to_string(),
            batch_number,
            message: message.into(),
            timestamp: Utc::now(),
        });
    }
}
