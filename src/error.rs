//! # Error Handling
//!
//! Crate-level error type for the public orchestrator surface. Component
//! modules define their own focused error enums ([`crate::config::ConfigError`],
//! [`crate::dlq::DlqError`], [`crate::store::StoreError`]); this enum is the
//! union callers see.

use thiserror::Error;

use crate::config::ConfigError;
use crate::dlq::DlqError;
use crate::store::StoreError;

/// Errors surfaced by the sync engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A second `start_sync` was attempted while an operation was running.
    #[error("a sync operation is already in progress")]
    AlreadyInProgress,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dlq(#[from] DlqError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
