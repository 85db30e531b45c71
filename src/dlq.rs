//! # Dead Letter Queue
//!
//! Bounded in-memory parking lot for batches that exhausted their retries.
//! Entries are retried lowest-retry-count-first on an exponential schedule,
//! parked as permanently failed once they hit the retry ceiling, and swept
//! out by a periodic cleanup task. The queue can be persisted to and
//! restored from a [`DlqStore`] across restarts.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, DlqConfig};
use crate::store::{DlqStore, StoreError};

#[derive(Debug, Error)]
pub enum DlqError {
    /// The queue is at capacity and the entry id is not already present.
    #[error("dead letter queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("dead letter entry not found: {id}")]
    NotFound { id: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One parked batch with its failure metadata and retry bookkeeping.
///
/// `processed_at` is set either when a replay succeeded or when the entry
/// hit the retry ceiling; `permanently_failed` distinguishes the two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: String,
    pub payload: serde_json::Value,
    pub error_type: String,
    pub error_message: String,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    /// Unset until [`DeadLetterQueue::add`] schedules the entry.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub permanently_failed: bool,
}

impl DlqEntry {
    pub fn new(
        id: impl Into<String>,
        payload: serde_json::Value,
        error_type: &str,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            payload,
            error_type: error_type.to_string(),
            error_message: error_message.into(),
            retry_count: 0,
            created_at: Utc::now(),
            next_retry_at: None,
            last_attempt_at: None,
            processed_at: None,
            permanently_failed: false,
        }
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    pub fn is_permanently_failed(&self) -> bool {
        self.permanently_failed
    }
}

/// Queue snapshot used for monitoring.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DlqStats {
    pub total: usize,
    /// Entries awaiting a retry (now or later).
    pub pending: usize,
    /// Successfully replayed entries not yet swept out.
    pub processed: usize,
    pub permanently_failed: usize,
    pub average_retry_count: f64,
    pub oldest_created_at: Option<DateTime<Utc>>,
    /// Fill ratio against the configured capacity, 0.0 to 1.0.
    pub utilization: f64,
    pub by_error_type: BTreeMap<String, u64>,
}

pub struct DeadLetterQueue {
    config: DlqConfig,
    entries: Mutex<Vec<DlqEntry>>,
}

impl DeadLetterQueue {
    pub fn new(config: DlqConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            entries: Mutex::new(Vec::new()),
        })
    }

    /// Park a failed batch. An entry already at the retry ceiling is stored
    /// as permanently failed; otherwise a missing `next_retry_at` is
    /// computed from the retry count. Re-adding an existing id replaces
    /// that entry in place and is exempt from the capacity check; a
    /// brand-new id on a full queue is rejected with [`DlqError::QueueFull`].
    pub fn add(&self, mut entry: DlqEntry) -> Result<DlqEntry, DlqError> {
        let now = Utc::now();
        if entry.retry_count >= self.config.max_retries {
            entry.processed_at = Some(now);
            entry.permanently_failed = true;
            entry.next_retry_at = None;
            counter!("sync_dlq_permanently_failed_total").increment(1);
            warn!(
                id = %entry.id,
                retry_count = entry.retry_count,
                "dead letter entry parked as permanently failed"
            );
        } else if entry.next_retry_at.is_none() {
            entry.next_retry_at = Some(now + self.retry_delay(entry.retry_count));
        }

        let mut entries = self.lock();
        if let Some(existing) = entries.iter_mut().find(|e| e.id == entry.id) {
            debug!(id = %entry.id, "replacing existing dead letter entry");
            *existing = entry.clone();
        } else {
            if entries.len() >= self.config.max_queue_size {
                warn!(
                    capacity = self.config.max_queue_size,
                    id = %entry.id,
                    "dead letter queue full, rejecting entry"
                );
                return Err(DlqError::QueueFull {
                    capacity: self.config.max_queue_size,
                });
            }
            entries.push(entry.clone());
        }

        counter!("sync_dlq_added_total", "error_type" => entry.error_type.clone()).increment(1);
        gauge!("sync_dlq_depth").set(entries.len() as f64);
        info!(
            id = %entry.id,
            error_type = %entry.error_type,
            retry_count = entry.retry_count,
            "batch moved to dead letter queue"
        );
        Ok(entry)
    }

    /// Next entry due for a retry: lowest retry count first, oldest first
    /// within a count, with `next_retry_at` due (or unset) and not yet
    /// processed. The entry stays in the queue until marked or removed.
    pub fn get_next_item(&self) -> Option<DlqEntry> {
        let now = Utc::now();
        let entries = self.lock();
        entries
            .iter()
            .filter(|e| !e.is_processed() && e.next_retry_at.is_none_or(|at| at <= now))
            .min_by(|a, b| {
                (a.retry_count, a.created_at, &a.id).cmp(&(b.retry_count, b.created_at, &b.id))
            })
            .cloned()
    }

    /// Derive the follow-up record for a failed retry attempt: retry count
    /// bumped, fresh timestamps, rescheduled on the exponential curve. Does
    /// not touch the queue; pass the result back through [`add`](Self::add).
    pub fn increment_retry_count(&self, entry: &DlqEntry) -> DlqEntry {
        let now = Utc::now();
        let mut next = entry.clone();
        next.retry_count += 1;
        next.created_at = now;
        next.last_attempt_at = Some(now);
        next.next_retry_at = Some(now + self.retry_delay(next.retry_count));
        next
    }

    /// Mark a successfully replayed entry; it stays visible for stats until
    /// cleanup sweeps it. No-op when the id is absent or already marked.
    pub fn mark_as_processed(&self, id: &str) {
        let mut entries = self.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            if entry.processed_at.is_none() {
                entry.processed_at = Some(Utc::now());
                debug!(id, "dead letter entry marked as processed");
            }
        }
    }

    /// Evict an entry outright.
    pub fn remove(&self, id: &str) -> Result<DlqEntry, DlqError> {
        let mut entries = self.lock();
        let index = entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| DlqError::NotFound { id: id.to_string() })?;
        let entry = entries.remove(index);
        gauge!("sync_dlq_depth").set(entries.len() as f64);
        Ok(entry)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Full copy of the queue, retry order not implied.
    pub fn entries(&self) -> Vec<DlqEntry> {
        self.lock().clone()
    }

    /// Entries whose failure classified as `error_type`.
    pub fn entries_by_error_type(&self, error_type: &str) -> Vec<DlqEntry> {
        self.lock()
            .iter()
            .filter(|e| e.error_type == error_type)
            .cloned()
            .collect()
    }

    /// Entries that have been retried exactly `retry_count` times.
    pub fn entries_with_retry_count(&self, retry_count: u32) -> Vec<DlqEntry> {
        self.lock()
            .iter()
            .filter(|e| e.retry_count == retry_count)
            .cloned()
            .collect()
    }

    pub fn has_capacity(&self) -> bool {
        self.lock().len() < self.config.max_queue_size
    }

    pub fn remaining_capacity(&self) -> usize {
        self.config.max_queue_size.saturating_sub(self.lock().len())
    }

    pub fn stats(&self) -> DlqStats {
        let entries = self.lock();
        let mut stats = DlqStats {
            total: entries.len(),
            ..DlqStats::default()
        };
        let mut retry_sum: u64 = 0;
        for entry in entries.iter() {
            if entry.is_permanently_failed() {
                stats.permanently_failed += 1;
            } else if entry.is_processed() {
                stats.processed += 1;
            } else {
                stats.pending += 1;
            }
            retry_sum += u64::from(entry.retry_count);
            *stats.by_error_type.entry(entry.error_type.clone()).or_insert(0) += 1;
            if stats.oldest_created_at.is_none_or(|oldest| entry.created_at < oldest) {
                stats.oldest_created_at = Some(entry.created_at);
            }
        }
        if stats.total > 0 {
            stats.average_retry_count = retry_sum as f64 / stats.total as f64;
        }
        stats.utilization = stats.total as f64 / self.config.max_queue_size as f64;
        stats
    }

    /// Evict processed entries older than `max_age` and permanently failed
    /// entries created longer than `max_age` ago. Returns the number of
    /// entries removed.
    pub fn cleanup(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| {
            if e.is_permanently_failed() {
                e.created_at >= cutoff
            } else if let Some(processed_at) = e.processed_at {
                processed_at >= cutoff
            } else {
                true
            }
        });
        let removed = before - entries.len();
        if removed > 0 {
            counter!("sync_dlq_cleanup_removed_total").increment(removed as u64);
            gauge!("sync_dlq_depth").set(entries.len() as f64);
            info!(removed, "dead letter cleanup removed expired entries");
        }
        removed
    }

    /// Periodic cleanup loop at the configured interval and max age; runs
    /// until `shutdown` fires.
    pub async fn run_cleanup(&self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.config.cleanup_interval_ms,
            max_age_ms = self.config.cleanup_max_age_ms,
            "starting dead letter cleanup loop"
        );
        let max_age = chrono::Duration::milliseconds(self.config.cleanup_max_age_ms as i64);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("dead letter cleanup shutdown requested");
                    break;
                }
                _ = sleep(self.config.cleanup_interval()) => {
                    self.cleanup(max_age);
                }
            }
        }
    }

    /// Write the current queue contents through the store.
    pub async fn persist(&self, store: &dyn DlqStore) -> Result<(), DlqError> {
        let snapshot = self.entries();
        store.save(&snapshot).await?;
        debug!(entries = snapshot.len(), "dead letter queue persisted");
        Ok(())
    }

    /// Replace the queue contents from the store. A missing snapshot leaves
    /// the queue empty; entries beyond capacity are dropped.
    pub async fn restore(&self, store: &dyn DlqStore) -> Result<usize, DlqError> {
        let mut loaded = store.load().await?.unwrap_or_default();
        loaded.truncate(self.config.max_queue_size);
        let count = loaded.len();
        {
            let mut entries = self.lock();
            *entries = loaded;
            gauge!("sync_dlq_depth").set(entries.len() as f64);
        }
        info!(entries = count, "dead letter queue restored");
        Ok(count)
    }

    fn retry_delay(&self, retry_count: u32) -> chrono::Duration {
        let exp = self
            .config
            .retry_base_delay_ms
            .saturating_mul(2u64.saturating_pow(retry_count));
        chrono::Duration::milliseconds(exp.min(self.config.retry_max_delay_ms) as i64)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DlqEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
