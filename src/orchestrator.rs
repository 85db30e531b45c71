//! # Sync Orchestrator
//!
//! Drives a full attendance synchronization run: enumerates partitions from
//! the [`BatchSource`], pages through batches under the circuit breaker and
//! retry policy, applies records to the [`RecordSink`], and parks exhausted
//! batches in the dead letter queue. One operation runs at a time; progress
//! snapshots are persisted after every batch so an interrupted run can be
//! inspected after restart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::ExponentialBackoff;
use crate::breaker::{BreakerError, CircuitBreaker};
use crate::classifier::{ErrorClassification, ErrorClassifier, RawError};
use crate::config::SyncConfig;
use crate::dlq::{DeadLetterQueue, DlqEntry, DlqStats};
use crate::error::EngineError;
use crate::operation::{DateRange, SyncKind, SyncOperation, SyncStatus};
use crate::store::{DlqStore, SnapshotStore};

/// One attendance record as produced by the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: String,
    pub data: serde_json::Value,
}

/// One page of records from a partition.
#[derive(Debug, Clone)]
pub struct BatchPage {
    pub records: Vec<SyncRecord>,
    pub has_more: bool,
    /// Total records in the partition, when the source knows it up front.
    pub total_hint: Option<u64>,
}

/// Upstream SIS read surface. Batch numbers start at 1.
#[async_trait]
pub trait BatchSource: Send + Sync {
    async fn partitions(
        &self,
        kind: SyncKind,
        range: &DateRange,
    ) -> Result<Vec<String>, RawError>;

    async fn fetch_batch(
        &self,
        partition: &str,
        batch_number: u32,
        range: &DateRange,
    ) -> Result<BatchPage, RawError>;
}

/// Local write surface for synced records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn apply(&self, record: &SyncRecord) -> Result<(), RawError>;
}

/// Per-run options for [`SyncOrchestrator::start_sync`]. Without an
/// explicit range the run covers the current day only.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub date_range: Option<DateRange>,
    /// Restrict the run to these partitions; empty means all.
    pub partitions: Vec<String>,
}

impl SyncOptions {
    pub fn for_range(date_range: DateRange) -> Self {
        Self {
            date_range: Some(date_range),
            partitions: Vec::new(),
        }
    }
}

/// Dead letter payload pointing back at the batch that failed, with enough
/// context to re-fetch it later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRef {
    pub partition: String,
    pub batch_number: u32,
    pub kind: SyncKind,
    pub date_range: DateRange,
}

impl BatchRef {
    pub fn entry_id(&self) -> String {
        format!("batch:{}:{}", self.partition, self.batch_number)
    }
}

/// Knobs for a dead letter replay pass.
#[derive(Debug, Clone, Default)]
pub struct DlqRetryOptions {
    /// Stop after this many entries; `None` drains everything due.
    pub max_items: Option<usize>,
}

/// Outcome of a dead letter replay pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DlqRetryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub permanently_failed: usize,
}

enum BatchFailure {
    /// Retries exhausted on a retryable error; the batch goes to the queue.
    Exhausted(ErrorClassification, String),
    /// Not worth retrying; logged and counted, never queued.
    NotRetryable(ErrorClassification, String),
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    source: Arc<dyn BatchSource>,
    sink: Arc<dyn RecordSink>,
    snapshots: Arc<dyn SnapshotStore>,
    dlq_store: Option<Arc<dyn DlqStore>>,
    classifier: ErrorClassifier,
    breaker: Arc<CircuitBreaker>,
    dlq: Arc<DeadLetterQueue>,
    running: AtomicBool,
    current: Mutex<Option<SyncOperation>>,
    history: Mutex<Vec<SyncOperation>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn BatchSource>,
        sink: Arc<dyn RecordSink>,
        snapshots: Arc<dyn SnapshotStore>,
        dlq_store: Option<Arc<dyn DlqStore>>,
    ) -> Result<Self, EngineError> {
        config.orchestrator.validate()?;
        config.backoff.validate()?;
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone())?);
        let dlq = Arc::new(DeadLetterQueue::new(config.dlq.clone())?);
        Ok(Self {
            config,
            source,
            sink,
            snapshots,
            dlq_store,
            classifier: ErrorClassifier::new(),
            breaker,
            dlq,
            running: AtomicBool::new(false),
            current: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            cancel: Mutex::new(None),
        })
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn dead_letter_queue(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// The operation currently running, or the last one observed.
    pub fn current_operation(&self) -> Option<SyncOperation> {
        self.lock_current().clone()
    }

    /// Completed operations, most recent first. At most `limit` entries,
    /// further bounded by the configured retention limit.
    pub fn history(&self, limit: usize) -> Vec<SyncOperation> {
        let history = self.lock_history();
        history.iter().take(limit).cloned().collect()
    }

    pub fn dlq_stats(&self) -> DlqStats {
        self.dlq.stats()
    }

    /// Request cancellation of the running operation. Returns whether a
    /// running operation was signalled; the operation itself stops at the
    /// next batch boundary.
    pub fn cancel_sync(&self) -> bool {
        let guard = self.lock_cancel();
        match guard.as_ref() {
            Some(token) if self.running.load(Ordering::SeqCst) => {
                info!("sync cancellation requested");
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Run one synchronization operation to a terminal state and return it.
    /// At most one operation runs at a time; a concurrent call fails fast
    /// with [`EngineError::AlreadyInProgress`].
    #[instrument(skip(self, options), fields(kind = kind.as_str()))]
    pub async fn start_sync(
        &self,
        kind: SyncKind,
        options: SyncOptions,
    ) -> Result<SyncOperation, EngineError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("rejected start_sync, an operation is already running");
            return Err(EngineError::AlreadyInProgress);
        }

        let token = CancellationToken::new();
        *self.lock_cancel() = Some(token.clone());
        gauge!("sync_in_progress").set(1.0);

        let operation = self.run_operation(kind, options, token).await;

        gauge!("sync_in_progress").set(0.0);
        *self.lock_cancel() = None;
        self.running.store(false, Ordering::SeqCst);
        Ok(operation)
    }

    async fn run_operation(
        &self,
        kind: SyncKind,
        options: SyncOptions,
        token: CancellationToken,
    ) -> SyncOperation {
        let range = options.date_range.unwrap_or_else(|| {
            let today = Utc::now().date_naive();
            DateRange::new(today, today)
        });
        let mut operation = SyncOperation::new(kind, range);
        operation.status = SyncStatus::Running;
        operation.started_at = Some(Utc::now());
        info!(id = %operation.id, start = %range.start, end = %range.end, "sync operation started");
        self.update_current(&operation);
        self.persist_snapshot(&operation).await;
        let started = std::time::Instant::now();

        match self.source.partitions(kind, &range).await {
            Ok(mut partitions) => {
                if !options.partitions.is_empty() {
                    partitions.retain(|p| options.partitions.contains(p));
                }
                // Lower bound; each partition carries at least one batch.
                operation.progress.total_batches = partitions.len() as u32;
                for partition in &partitions {
                    if token.is_cancelled() {
                        break;
                    }
                    self.sync_partition(&mut operation, partition, &range, &token)
                        .await;
                }
            }
            Err(raw) => {
                let classification = self.classifier.classify(&raw);
                error!(
                    id = %operation.id,
                    error_type = classification.error_type.as_str(),
                    %raw,
                    "failed to enumerate partitions"
                );
                operation.record_error("*", 0, raw.to_string());
            }
        }

        // Per-record sink failures degrade the counters but only batch-level
        // errors fail the run.
        operation.status = if token.is_cancelled() {
            SyncStatus::Cancelled
        } else if operation.errors.is_empty() {
            SyncStatus::Completed
        } else {
            SyncStatus::Failed
        };
        operation.ended_at = Some(Utc::now());

        let elapsed = started.elapsed();
        info!(
            id = %operation.id,
            status = operation.status.as_str(),
            processed = operation.progress.processed,
            succeeded = operation.progress.succeeded,
            failed = operation.progress.failed,
            duration_ms = elapsed.as_millis() as u64,
            "sync operation finished"
        );
        counter!("sync_operations_total", "status" => operation.status.as_str()).increment(1);
        histogram!("sync_operation_duration_ms").record(elapsed.as_secs_f64() * 1_000.0);

        self.persist_snapshot(&operation).await;
        if let Some(store) = &self.dlq_store {
            if let Err(e) = self.dlq.persist(store.as_ref()).await {
                warn!(error = %e, "failed to persist dead letter queue");
            }
        }
        self.update_current(&operation);
        self.push_history(&operation);
        operation
    }

    /// Page through one partition, batch by batch. A failed batch fails the
    /// partition; later partitions still run.
    async fn sync_partition(
        &self,
        operation: &mut SyncOperation,
        partition: &str,
        range: &DateRange,
        token: &CancellationToken,
    ) {
        debug!(partition, "syncing partition");
        let mut batch_number: u32 = 1;
        let mut total_seeded = false;

        loop {
            if token.is_cancelled() {
                info!(partition, batch_number, "stopping partition, cancellation requested");
                return;
            }
            operation.progress.current_batch += 1;

            let page = match self
                .fetch_with_retry(operation, partition, batch_number, range, token)
                .await
            {
                Ok(page) => page,
                Err(BatchFailure::Exhausted(classification, message)) => {
                    operation.record_error(partition, batch_number, message.clone());
                    let batch_ref = BatchRef {
                        partition: partition.to_string(),
                        batch_number,
                        kind: operation.kind,
                        date_range: *range,
                    };
                    match serde_json::to_value(&batch_ref) {
                        Ok(payload) => {
                            let entry = DlqEntry::new(
                                batch_ref.entry_id(),
                                payload,
                                classification.error_type.as_str(),
                                message,
                            );
                            if let Err(e) = self.dlq.add(entry) {
                                error!(partition, batch_number, error = %e, "could not park failed batch");
                            }
                        }
                        Err(e) => {
                            error!(partition, batch_number, error = %e, "could not encode batch reference");
                        }
                    }
                    return;
                }
                Err(BatchFailure::NotRetryable(classification, message)) => {
                    error!(
                        partition,
                        batch_number,
                        error_type = classification.error_type.as_str(),
                        %message,
                        "batch failed with non-retryable error"
                    );
                    operation.record_error(partition, batch_number, message);
                    return;
                }
            };

            if !total_seeded {
                if let Some(hint) = page.total_hint {
                    operation.progress.total += hint;
                    total_seeded = true;
                }
            }

            for record in &page.records {
                operation.progress.processed += 1;
                match self.sink.apply(record).await {
                    Ok(()) => operation.progress.succeeded += 1,
                    Err(raw) => {
                        let classification = self.classifier.classify(&raw);
                        warn!(
                            partition,
                            record_id = %record.id,
                            error_type = classification.error_type.as_str(),
                            %raw,
                            "record failed to apply"
                        );
                        operation.progress.failed += 1;
                    }
                }
            }
            counter!("sync_records_processed_total").increment(page.records.len() as u64);
            self.update_current(operation);
            self.persist_snapshot(operation).await;

            if !page.has_more {
                return;
            }
            operation.progress.total_batches =
                operation.progress.total_batches.max(operation.progress.current_batch + 1);
            batch_number += 1;
            sleep(self.config.orchestrator.batch_pause()).await;
        }
    }

    /// Fetch one batch through the breaker, retrying per the backoff policy
    /// for retryable failures. Circuit-open rejections consume a retry slot
    /// and wait at least until the breaker admits a probe.
    async fn fetch_with_retry(
        &self,
        operation: &SyncOperation,
        partition: &str,
        batch_number: u32,
        range: &DateRange,
        token: &CancellationToken,
    ) -> Result<BatchPage, BatchFailure> {
        // Validated in `new`.
        let mut backoff = match ExponentialBackoff::new(self.config.backoff.clone()) {
            Ok(backoff) => backoff,
            Err(e) => {
                return Err(BatchFailure::NotRetryable(
                    crate::classifier::classify(&RawError::unknown(e.to_string())),
                    e.to_string(),
                ));
            }
        };

        loop {
            let outcome = self
                .breaker
                .execute(|| self.source.fetch_batch(partition, batch_number, range))
                .await;

            // A circuit-open rejection never reaches the classifier history;
            // an upstream error's delay hint overrides the computed backoff,
            // while an open circuit only floors it.
            let (classification, message, hint, floor) = match outcome {
                Ok(page) => return Ok(page),
                Err(BreakerError::Open { retry_in }) => {
                    let raw = RawError::unknown("circuit open, call rejected");
                    (
                        crate::classifier::classify(&raw),
                        raw.to_string(),
                        None,
                        Some(retry_in),
                    )
                }
                Err(BreakerError::Inner(raw)) => {
                    let classification = self.classifier.classify(&raw);
                    if !classification.retryable {
                        return Err(BatchFailure::NotRetryable(classification, raw.to_string()));
                    }
                    let hint = classification.retry_delay_hint;
                    (classification, raw.to_string(), hint, None)
                }
            };

            if !backoff.should_retry() {
                warn!(
                    id = %operation.id,
                    partition,
                    batch_number,
                    attempts = backoff.attempt(),
                    "batch retries exhausted"
                );
                return Err(BatchFailure::Exhausted(classification, message));
            }
            // next_delay is Some while should_retry holds.
            let computed = backoff.next_delay().unwrap_or(Duration::ZERO);
            let mut delay = hint.unwrap_or(computed);
            if let Some(floor) = floor {
                delay = delay.max(floor);
            }
            debug!(
                partition,
                batch_number,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                error_type = classification.error_type.as_str(),
                "batch fetch failed, retrying"
            );

            tokio::select! {
                _ = token.cancelled() => {
                    return Err(BatchFailure::NotRetryable(classification, message));
                }
                _ = sleep(delay) => {}
            }
        }
    }

    /// Replay dead letter entries, lowest retry count first. Each entry is
    /// re-fetched once through the breaker and marked processed on success;
    /// failures advance the entry's retry schedule.
    #[instrument(skip(self, options))]
    pub async fn retry_dlq(&self, options: DlqRetryOptions) -> Result<DlqRetryReport, EngineError> {
        let mut report = DlqRetryReport::default();
        let limit = options.max_items.unwrap_or(usize::MAX);

        while report.attempted < limit {
            let Some(entry) = self.dlq.get_next_item() else {
                break;
            };
            report.attempted += 1;

            let batch_ref: BatchRef = match serde_json::from_value(entry.payload.clone()) {
                Ok(batch_ref) => batch_ref,
                Err(e) => {
                    warn!(id = %entry.id, error = %e, "unreadable dead letter payload, dropping");
                    self.dlq.remove(&entry.id)?;
                    report.failed += 1;
                    continue;
                }
            };

            match self.replay_batch(&batch_ref).await {
                Ok(()) => {
                    info!(id = %entry.id, "dead letter entry replayed successfully");
                    counter!("sync_dlq_replays_total", "outcome" => "success").increment(1);
                    self.dlq.mark_as_processed(&entry.id);
                    report.succeeded += 1;
                }
                Err(raw) => {
                    let classification = self.classifier.classify(&raw);
                    warn!(
                        id = %entry.id,
                        error_type = classification.error_type.as_str(),
                        %raw,
                        "dead letter replay failed"
                    );
                    counter!("sync_dlq_replays_total", "outcome" => "failure").increment(1);
                    let updated = self.dlq.add(self.dlq.increment_retry_count(&entry))?;
                    if updated.is_permanently_failed() {
                        report.permanently_failed += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }

        if let Some(store) = &self.dlq_store {
            self.dlq.persist(store.as_ref()).await?;
        }
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            permanently_failed = report.permanently_failed,
            "dead letter replay pass finished"
        );
        Ok(report)
    }

    async fn replay_batch(&self, batch_ref: &BatchRef) -> Result<(), RawError> {
        let page = self
            .breaker
            .execute(|| {
                self.source.fetch_batch(
                    &batch_ref.partition,
                    batch_ref.batch_number,
                    &batch_ref.date_range,
                )
            })
            .await
            .map_err(|e| match e {
                BreakerError::Open { .. } => RawError::unknown("circuit open, call rejected"),
                BreakerError::Inner(raw) => raw,
            })?;

        for record in &page.records {
            self.sink.apply(record).await?;
        }
        Ok(())
    }

    /// Load a persisted operation snapshot, e.g. after a restart.
    pub async fn load_operation(&self, id: &str) -> Result<Option<SyncOperation>, EngineError> {
        Ok(self.snapshots.load(id).await?)
    }

    /// Restore the dead letter queue from the configured store, if any.
    pub async fn restore_dlq(&self) -> Result<usize, EngineError> {
        match &self.dlq_store {
            Some(store) => Ok(self.dlq.restore(store.as_ref()).await?),
            None => Ok(0),
        }
    }

    async fn persist_snapshot(&self, operation: &SyncOperation) {
        if let Err(e) = self.snapshots.save(operation).await {
            // Persistence trouble must not abort the run.
            warn!(id = %operation.id, error = %e, "failed to persist operation snapshot");
        }
    }

    fn update_current(&self, operation: &SyncOperation) {
        *self.lock_current() = Some(operation.clone());
    }

    fn push_history(&self, operation: &SyncOperation) {
        let mut history = self.lock_history();
        history.insert(0, operation.clone());
        history.truncate(self.config.orchestrator.history_limit);
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<SyncOperation>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, Vec<SyncOperation>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_cancel(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner())
    }
}
