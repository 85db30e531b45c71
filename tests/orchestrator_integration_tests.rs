//! End-to-end orchestrator runs against scripted sources and sinks:
//! clean completion, retry-then-recover, dead-lettering, cancellation,
//! the single-operation guard, and dead letter replay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use sis_sync::classifier::RawError;
use sis_sync::config::{BackoffConfig, BreakerConfig, DlqConfig, OrchestratorConfig, SyncConfig};
use sis_sync::operation::{DateRange, SyncKind, SyncOperation, SyncStatus};
use sis_sync::orchestrator::{
    BatchPage, BatchSource, DlqRetryOptions, RecordSink, SyncOptions, SyncOrchestrator, SyncRecord,
};
use sis_sync::store::{SnapshotStore, StoreError};
use sis_sync::EngineError;

fn test_range() -> DateRange {
    let today = Utc::now().date_naive();
    DateRange::new(today, today)
}

/// Fast-everything configuration so paused-clock tests finish instantly.
fn test_config() -> SyncConfig {
    SyncConfig {
        backoff: BackoffConfig {
            base_delay_ms: 10,
            max_delay_ms: 100,
            max_attempts: 2,
            multiplier: 2.0,
            jitter: false,
        },
        breaker: BreakerConfig {
            failure_threshold: 10,
            ..BreakerConfig::default()
        },
        dlq: DlqConfig {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 10,
            ..DlqConfig::default()
        },
        orchestrator: OrchestratorConfig {
            batch_pause_ms: 1,
            history_limit: 10,
        },
        ..SyncConfig::default()
    }
}

/// Scripted upstream: fixed partitions, `batches` pages per partition with
/// `records_per_batch` records each, and optional per-partition failure
/// plans (HTTP status plus how many calls should fail, `u32::MAX` meaning
/// every call).
struct ScriptedSource {
    partitions: Vec<String>,
    batches: u32,
    records_per_batch: usize,
    failures: Mutex<HashMap<String, (u16, u32)>>,
    fetch_calls: AtomicU32,
}

impl ScriptedSource {
    fn new(partitions: &[&str], batches: u32, records_per_batch: usize) -> Self {
        Self {
            partitions: partitions.iter().map(|p| p.to_string()).collect(),
            batches,
            records_per_batch,
            failures: Mutex::new(HashMap::new()),
            fetch_calls: AtomicU32::new(0),
        }
    }

    fn fail_partition(self, partition: &str, status: u16, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(partition.to_string(), (status, times));
        self
    }

    fn calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn heal(&self, partition: &str) {
        self.failures.lock().unwrap().remove(partition);
    }
}

#[async_trait]
impl BatchSource for ScriptedSource {
    async fn partitions(
        &self,
        _kind: SyncKind,
        _range: &DateRange,
    ) -> Result<Vec<String>, RawError> {
        Ok(self.partitions.clone())
    }

    async fn fetch_batch(
        &self,
        partition: &str,
        batch_number: u32,
        _range: &DateRange,
    ) -> Result<BatchPage, RawError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let mut failures = self.failures.lock().unwrap();
        if let Some((status, remaining)) = failures.get_mut(partition) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(RawError::http(*status));
            }
        }
        drop(failures);

        let records = (0..self.records_per_batch)
            .map(|i| SyncRecord {
                id: format!("{partition}-b{batch_number}-r{i}"),
                data: serde_json::json!({"present": true}),
            })
            .collect();
        Ok(BatchPage {
            records,
            has_more: batch_number < self.batches,
            total_hint: Some((self.batches as usize * self.records_per_batch) as u64),
        })
    }
}

/// Sink that counts applies and can reject specific record ids.
#[derive(Default)]
struct CountingSink {
    applied: AtomicU64,
    reject: Mutex<Vec<String>>,
    first_apply: Option<Arc<Notify>>,
}

impl CountingSink {
    fn applied(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSink for CountingSink {
    async fn apply(&self, record: &SyncRecord) -> Result<(), RawError> {
        if self.reject.lock().unwrap().contains(&record.id) {
            return Err(RawError::http(422));
        }
        self.applied.fetch_add(1, Ordering::SeqCst);
        if let Some(notify) = &self.first_apply {
            notify.notify_one();
        }
        Ok(())
    }
}

/// Snapshot store that keeps everything in memory for inspection.
#[derive(Default)]
struct MemorySnapshots {
    saved: Mutex<HashMap<String, SyncOperation>>,
}

impl MemorySnapshots {
    fn get(&self, id: &str) -> Option<SyncOperation> {
        self.saved.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshots {
    async fn save(&self, operation: &SyncOperation) -> Result<(), StoreError> {
        self.saved
            .lock()
            .unwrap()
            .insert(operation.id.clone(), operation.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<SyncOperation>, StoreError> {
        Ok(self.get(id))
    }
}

fn build(
    config: SyncConfig,
    source: Arc<ScriptedSource>,
    sink: Arc<CountingSink>,
    snapshots: Arc<MemorySnapshots>,
) -> SyncOrchestrator {
    SyncOrchestrator::new(config, source, sink, snapshots, None).unwrap()
}

#[tokio::test(start_paused = true)]
async fn full_sync_applies_every_record_and_completes() {
    let source = Arc::new(ScriptedSource::new(&["school-1", "school-2"], 2, 3));
    let sink = Arc::new(CountingSink::default());
    let snapshots = Arc::new(MemorySnapshots::default());
    let orchestrator = build(test_config(), source.clone(), sink.clone(), snapshots.clone());

    let operation = orchestrator
        .start_sync(SyncKind::Full, SyncOptions::for_range(test_range()))
        .await
        .unwrap();

    assert_eq!(operation.status, SyncStatus::Completed);
    assert_eq!(operation.progress.processed, 12);
    assert_eq!(operation.progress.succeeded, 12);
    assert_eq!(operation.progress.failed, 0);
    assert_eq!(operation.progress.total, 12);
    assert!(operation.errors.is_empty());
    assert!(operation.started_at.is_some());
    assert!(operation.ended_at.is_some());
    assert_eq!(sink.applied(), 12);
    assert_eq!(source.calls(), 4);

    // The final snapshot reflects the terminal state.
    let snapshot = snapshots.get(&operation.id).unwrap();
    assert_eq!(snapshot.status, SyncStatus::Completed);

    let history = orchestrator.history(10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, operation.id);
    assert!(orchestrator.dead_letter_queue().is_empty());
}

#[tokio::test(start_paused = true)]
async fn partition_filter_restricts_the_run() {
    let source = Arc::new(ScriptedSource::new(&["school-1", "school-2"], 1, 2));
    let sink = Arc::new(CountingSink::default());
    let orchestrator = build(
        test_config(),
        source.clone(),
        sink.clone(),
        Arc::new(MemorySnapshots::default()),
    );

    let options = SyncOptions {
        partitions: vec!["school-2".to_string()],
        ..SyncOptions::for_range(test_range())
    };
    let operation = orchestrator.start_sync(SyncKind::Manual, options).await.unwrap();

    assert_eq!(operation.status, SyncStatus::Completed);
    assert_eq!(sink.applied(), 2);
    assert_eq!(source.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_to_success() {
    // Two 503s, then healthy; max_attempts 2 allows three calls per batch.
    let source = Arc::new(ScriptedSource::new(&["school-1"], 1, 2).fail_partition("school-1", 503, 2));
    let sink = Arc::new(CountingSink::default());
    let orchestrator = build(
        test_config(),
        source.clone(),
        sink.clone(),
        Arc::new(MemorySnapshots::default()),
    );

    let operation = orchestrator
        .start_sync(SyncKind::Incremental, SyncOptions::for_range(test_range()))
        .await
        .unwrap();

    assert_eq!(operation.status, SyncStatus::Completed);
    assert_eq!(source.calls(), 3);
    assert_eq!(sink.applied(), 2);
    assert!(orchestrator.dead_letter_queue().is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_park_the_batch_and_fail_the_run() {
    let source = Arc::new(
        ScriptedSource::new(&["school-ok", "school-bad"], 1, 2)
            .fail_partition("school-bad", 503, u32::MAX),
    );
    let sink = Arc::new(CountingSink::default());
    let orchestrator = build(
        test_config(),
        source.clone(),
        sink.clone(),
        Arc::new(MemorySnapshots::default()),
    );

    let operation = orchestrator
        .start_sync(SyncKind::Full, SyncOptions::for_range(test_range()))
        .await
        .unwrap();

    // The healthy partition still synced; the run is a partial failure.
    assert_eq!(operation.status, SyncStatus::Failed);
    assert_eq!(sink.applied(), 2);
    assert_eq!(operation.errors.len(), 1);
    assert_eq!(operation.errors[0].partition, "school-bad");

    let entries = orchestrator.dead_letter_queue().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].error_type, "service_unavailable");
    assert_eq!(entries[0].id, "batch:school-bad:1");
    assert_eq!(entries[0].payload["partition"], "school-bad");
}

#[tokio::test(start_paused = true)]
async fn non_retryable_errors_are_not_dead_lettered() {
    let source = Arc::new(
        ScriptedSource::new(&["school-1"], 1, 2).fail_partition("school-1", 404, u32::MAX),
    );
    let orchestrator = build(
        test_config(),
        source.clone(),
        Arc::new(CountingSink::default()),
        Arc::new(MemorySnapshots::default()),
    );

    let operation = orchestrator
        .start_sync(SyncKind::Full, SyncOptions::for_range(test_range()))
        .await
        .unwrap();

    assert_eq!(operation.status, SyncStatus::Failed);
    // One call only: 404 is never retried.
    assert_eq!(source.calls(), 1);
    assert!(orchestrator.dead_letter_queue().is_empty());
}

#[tokio::test(start_paused = true)]
async fn record_level_sink_failures_count_but_do_not_abort() {
    let source = Arc::new(ScriptedSource::new(&["school-1"], 1, 3));
    let sink = Arc::new(CountingSink {
        reject: Mutex::new(vec!["school-1-b1-r1".to_string()]),
        ..CountingSink::default()
    });
    let orchestrator = build(
        test_config(),
        source,
        sink.clone(),
        Arc::new(MemorySnapshots::default()),
    );

    let operation = orchestrator
        .start_sync(SyncKind::Full, SyncOptions::for_range(test_range()))
        .await
        .unwrap();

    // Record-level failures degrade the counters without failing the run.
    assert_eq!(operation.status, SyncStatus::Completed);
    assert_eq!(operation.progress.processed, 3);
    assert_eq!(operation.progress.succeeded, 2);
    assert_eq!(operation.progress.failed, 1);
    assert!(operation.errors.is_empty());
    // Record failures stay out of the dead letter queue.
    assert!(orchestrator.dead_letter_queue().is_empty());
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_trip_the_circuit() {
    let config = SyncConfig {
        breaker: BreakerConfig {
            failure_threshold: 2,
            ..BreakerConfig::default()
        },
        backoff: BackoffConfig {
            max_attempts: 3,
            ..test_config().backoff
        },
        ..test_config()
    };
    let source = Arc::new(
        ScriptedSource::new(&["school-1"], 1, 1).fail_partition("school-1", 503, u32::MAX),
    );
    let orchestrator = build(
        config,
        source.clone(),
        Arc::new(CountingSink::default()),
        Arc::new(MemorySnapshots::default()),
    );

    let operation = orchestrator
        .start_sync(SyncKind::Full, SyncOptions::for_range(test_range()))
        .await
        .unwrap();

    assert_eq!(operation.status, SyncStatus::Failed);
    assert_eq!(orchestrator.breaker().state(), sis_sync::CircuitState::Open);
    // Calls stop once the circuit opens, well below one per retry slot.
    assert!(source.calls() <= 3, "calls: {}", source.calls());
    assert_eq!(orchestrator.dead_letter_queue().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn second_start_is_rejected_while_running() {
    struct BlockingSource {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl BatchSource for BlockingSource {
        async fn partitions(
            &self,
            _kind: SyncKind,
            _range: &DateRange,
        ) -> Result<Vec<String>, RawError> {
            Ok(vec!["school-1".to_string()])
        }

        async fn fetch_batch(
            &self,
            _partition: &str,
            _batch_number: u32,
            _range: &DateRange,
        ) -> Result<BatchPage, RawError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(BatchPage {
                records: Vec::new(),
                has_more: false,
                total_hint: None,
            })
        }
    }

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let orchestrator = Arc::new(
        SyncOrchestrator::new(
            test_config(),
            Arc::new(BlockingSource {
                entered: entered.clone(),
                release: release.clone(),
            }),
            Arc::new(CountingSink::default()),
            Arc::new(MemorySnapshots::default()),
            None,
        )
        .unwrap(),
    );

    let first = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .start_sync(SyncKind::Full, SyncOptions::for_range(test_range()))
                .await
        })
    };
    entered.notified().await;

    let second = orchestrator
        .start_sync(SyncKind::Full, SyncOptions::for_range(test_range()))
        .await;
    assert!(matches!(second, Err(EngineError::AlreadyInProgress)));
    assert_eq!(
        orchestrator.current_operation().map(|op| op.status),
        Some(SyncStatus::Running)
    );

    release.notify_one();
    let operation = first.await.unwrap().unwrap();
    assert_eq!(operation.status, SyncStatus::Completed);

    // With the first run finished a new one is admitted again.
    release.notify_one();
    let third = orchestrator
        .start_sync(SyncKind::Manual, SyncOptions::for_range(test_range()))
        .await
        .unwrap();
    assert_eq!(third.status, SyncStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_at_a_batch_boundary() {
    // Endless partition: every page says has_more.
    struct EndlessSource;

    #[async_trait]
    impl BatchSource for EndlessSource {
        async fn partitions(
            &self,
            _kind: SyncKind,
            _range: &DateRange,
        ) -> Result<Vec<String>, RawError> {
            Ok(vec!["school-1".to_string()])
        }

        async fn fetch_batch(
            &self,
            partition: &str,
            batch_number: u32,
            _range: &DateRange,
        ) -> Result<BatchPage, RawError> {
            Ok(BatchPage {
                records: vec![SyncRecord {
                    id: format!("{partition}-b{batch_number}"),
                    data: serde_json::json!({}),
                }],
                has_more: true,
                total_hint: Some(1_000),
            })
        }
    }

    let first_apply = Arc::new(Notify::new());
    let sink = Arc::new(CountingSink {
        first_apply: Some(first_apply.clone()),
        ..CountingSink::default()
    });
    let orchestrator = Arc::new(
        SyncOrchestrator::new(
            test_config(),
            Arc::new(EndlessSource),
            sink.clone(),
            Arc::new(MemorySnapshots::default()),
            None,
        )
        .unwrap(),
    );

    let run = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .start_sync(SyncKind::Full, SyncOptions::for_range(test_range()))
                .await
        })
    };
    first_apply.notified().await;
    assert!(orchestrator.cancel_sync());

    let operation = run.await.unwrap().unwrap();
    assert_eq!(operation.status, SyncStatus::Cancelled);
    assert!(operation.ended_at.is_some());
    // Progress stops short of the hinted total.
    assert!(operation.progress.processed < operation.progress.total);

    // Nothing left running.
    assert!(!orchestrator.cancel_sync());
}

#[tokio::test]
async fn dead_letter_replay_processes_entries_once_upstream_heals() {
    let source = Arc::new(
        ScriptedSource::new(&["school-1"], 1, 2).fail_partition("school-1", 503, u32::MAX),
    );
    let sink = Arc::new(CountingSink::default());
    let orchestrator = build(
        test_config(),
        source.clone(),
        sink.clone(),
        Arc::new(MemorySnapshots::default()),
    );

    let operation = orchestrator
        .start_sync(SyncKind::Full, SyncOptions::for_range(test_range()))
        .await
        .unwrap();
    assert_eq!(operation.status, SyncStatus::Failed);
    assert_eq!(orchestrator.dead_letter_queue().len(), 1);

    source.heal("school-1");
    // Entries become due after the 1ms retry base delay.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let report = orchestrator.retry_dlq(DlqRetryOptions::default()).await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(sink.applied(), 2);

    // The entry stays for stats, marked processed, and is never re-served.
    let stats = orchestrator.dlq_stats();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.pending, 0);
    assert!(orchestrator.dead_letter_queue().get_next_item().is_none());
}

#[tokio::test]
async fn failed_replay_advances_the_retry_schedule() {
    let config = SyncConfig {
        dlq: DlqConfig {
            max_retries: 2,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 10,
            ..DlqConfig::default()
        },
        ..test_config()
    };
    let source = Arc::new(
        ScriptedSource::new(&["school-1"], 1, 1).fail_partition("school-1", 503, u32::MAX),
    );
    let orchestrator = build(
        config,
        source.clone(),
        Arc::new(CountingSink::default()),
        Arc::new(MemorySnapshots::default()),
    );

    orchestrator
        .start_sync(SyncKind::Full, SyncOptions::for_range(test_range()))
        .await
        .unwrap();
    assert_eq!(orchestrator.dead_letter_queue().len(), 1);

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let report = orchestrator.retry_dlq(DlqRetryOptions::default()).await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failed, 1);

    // Second failed replay hits max_retries and parks the entry for good.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let report = orchestrator.retry_dlq(DlqRetryOptions::default()).await.unwrap();
    assert_eq!(report.permanently_failed, 1);

    let stats = orchestrator.dlq_stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.permanently_failed, 1);
}
