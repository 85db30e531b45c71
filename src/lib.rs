//! # sis-sync
//!
//! Resilient attendance synchronization engine for upstream Student
//! Information System (SIS) APIs. The crate layers an error classifier,
//! jittered exponential backoff, a circuit breaker, and a bounded dead
//! letter queue under a single-operation orchestrator, so flaky upstreams
//! degrade a sync run instead of killing it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sis_sync::config::ConfigLoader;
//! use sis_sync::orchestrator::{SyncOptions, SyncOrchestrator};
//! use sis_sync::operation::SyncKind;
//! use sis_sync::store::{FileDlqStore, FileSnapshotStore};
//! # use sis_sync::orchestrator::{BatchSource, RecordSink};
//! # async fn run(source: Arc<dyn BatchSource>, sink: Arc<dyn RecordSink>) -> anyhow::Result<()> {
//! let config = ConfigLoader::new().load()?;
//! sis_sync::telemetry::init_tracing(&config)?;
//!
//! let orchestrator = SyncOrchestrator::new(
//!     config,
//!     source,
//!     sink,
//!     Arc::new(FileSnapshotStore::new("data/operations")),
//!     Some(Arc::new(FileDlqStore::new("data"))),
//! )?;
//! orchestrator.restore_dlq().await?;
//! let operation = orchestrator.start_sync(SyncKind::Full, SyncOptions::default()).await?;
//! println!("finished: {}", operation.status.as_str());
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod breaker;
pub mod classifier;
pub mod config;
pub mod dlq;
pub mod error;
pub mod operation;
pub mod orchestrator;
pub mod store;
pub mod telemetry;

pub use backoff::ExponentialBackoff;
pub use breaker::{BreakerError, CircuitBreaker, CircuitState};
pub use classifier::{ErrorClassification, ErrorClassifier, ErrorType, RawError};
pub use config::{ConfigLoader, SyncConfig};
pub use dlq::{DeadLetterQueue, DlqEntry, DlqError, DlqStats};
pub use error::EngineError;
pub use operation::{DateRange, SyncKind, SyncOperation, SyncStatus};
pub use orchestrator::{
    BatchPage, BatchSource, DlqRetryOptions, DlqRetryReport, RecordSink, SyncOptions,
    SyncOrchestrator, SyncRecord,
};
pub use store::{DlqStore, FileDlqStore, FileSnapshotStore, SnapshotStore, StoreError};
