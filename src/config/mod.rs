//! Configuration for the sync engine.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `SISSYNC_`, producing a typed [`SyncConfig`]. Every component config
//! validates its own bounds; construction of a component with an invalid
//! config fails rather than clamping silently.

use std::{collections::BTreeMap, env, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine configuration derived from `SISSYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct BreakerConfig {
    /// Consecutive failures in `Closed` that trip the circuit (default: 5).
    ///
    /// Environment variable: `SISSYNC_BREAKER_FAILURE_THRESHOLD`
    #[serde(default = "default_breaker_failure_threshold")]
    pub failure_threshold: u32,

    /// Milliseconds the circuit stays `Open` before admitting a probe
    /// (default: 60000).
    ///
    /// Environment variable: `SISSYNC_BREAKER_RECOVERY_TIMEOUT_MS`
    #[serde(default = "default_breaker_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,

    /// Width of the rolling request-outcome window used for statistics,
    /// in milliseconds (default: 300000). Independent of the transition
    /// counters.
    ///
    /// Environment variable: `SISSYNC_BREAKER_MONITORING_PERIOD_MS`
    #[serde(default = "default_breaker_monitoring_period_ms")]
    pub monitoring_period_ms: u64,

    /// Probe calls admitted while `HalfOpen` (default: 1).
    ///
    /// Environment variable: `SISSYNC_BREAKER_HALF_OPEN_MAX_REQUESTS`
    #[serde(default = "default_breaker_half_open_max_requests")]
    pub half_open_max_requests: u32,

    /// Interval for the optional external health probe, in milliseconds
    /// (default: 30000).
    ///
    /// Environment variable: `SISSYNC_BREAKER_HEALTH_CHECK_INTERVAL_MS`
    #[serde(default = "default_breaker_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

/// Exponential backoff tuning for per-batch retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct BackoffConfig {
    /// Starting delay in milliseconds (default: 1000).
    ///
    /// Environment variable: `SISSYNC_BACKOFF_BASE_DELAY_MS`
    #[serde(default = "default_backoff_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Delay ceiling in milliseconds (default: 30000). Must exceed the
    /// base delay.
    ///
    /// Environment variable: `SISSYNC_BACKOFF_MAX_DELAY_MS`
    #[serde(default = "default_backoff_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Retries allowed after the initial attempt (default: 3).
    ///
    /// Environment variable: `SISSYNC_BACKOFF_MAX_ATTEMPTS`
    #[serde(default = "default_backoff_max_attempts")]
    pub max_attempts: u32,

    /// Growth factor per attempt (default: 2.0, minimum 1.0).
    ///
    /// Environment variable: `SISSYNC_BACKOFF_MULTIPLIER`
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    /// Apply symmetric ±25% jitter to computed delays (default: true).
    ///
    /// Environment variable: `SISSYNC_BACKOFF_JITTER`
    #[serde(default = "default_backoff_jitter")]
    pub jitter: bool,
}

/// Dead letter queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DlqConfig {
    /// Hard cap on stored entries (default: 1000). `add` past this fails.
    ///
    /// Environment variable: `SISSYNC_DLQ_MAX_QUEUE_SIZE`
    #[serde(default = "default_dlq_max_queue_size")]
    pub max_queue_size: usize,

    /// Retry budget per entry (default: 5). An entry at this count is
    /// permanently failed and never rescheduled.
    ///
    /// Environment variable: `SISSYNC_DLQ_MAX_RETRIES`
    #[serde(default = "default_dlq_max_retries")]
    pub max_retries: u32,

    /// Base delay for retry scheduling in milliseconds (default: 60000).
    /// Scheduling uses `base * 2^retry_count` capped at the max below.
    ///
    /// Environment variable: `SISSYNC_DLQ_RETRY_BASE_DELAY_MS`
    #[serde(default = "default_dlq_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Retry scheduling ceiling in milliseconds (default: 1800000, i.e.
    /// 30 minutes).
    ///
    /// Environment variable: `SISSYNC_DLQ_RETRY_MAX_DELAY_MS`
    #[serde(default = "default_dlq_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Background cleanup interval in milliseconds (default: 3600000).
    ///
    /// Environment variable: `SISSYNC_DLQ_CLEANUP_INTERVAL_MS`
    #[serde(default = "default_dlq_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// Age past which processed and permanently-failed entries are
    /// evicted by cleanup, in milliseconds (default: 86400000).
    ///
    /// Environment variable: `SISSYNC_DLQ_CLEANUP_MAX_AGE_MS`
    #[serde(default = "default_dlq_cleanup_max_age_ms")]
    pub cleanup_max_age_ms: u64,
}

/// Orchestrator run-loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct OrchestratorConfig {
    /// Minimum pause between successive upstream calls in milliseconds,
    /// applied even on success to respect upstream rate limits
    /// (default: 200).
    ///
    /// Environment variable: `SISSYNC_BATCH_PAUSE_MS`
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,

    /// Completed operations retained for `history()` (default: 50).
    ///
    /// Environment variable: `SISSYNC_HISTORY_LIMIT`
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl BreakerConfig {
    /// Validate breaker bounds; all parameters must be positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidBreakerThreshold {
                value: self.failure_threshold,
            });
        }
        if self.recovery_timeout_ms == 0 {
            return Err(ConfigError::InvalidBreakerRecoveryTimeout {
                value: self.recovery_timeout_ms,
            });
        }
        if self.monitoring_period_ms == 0 {
            return Err(ConfigError::InvalidBreakerMonitoringPeriod {
                value: self.monitoring_period_ms,
            });
        }
        if self.half_open_max_requests == 0 {
            return Err(ConfigError::InvalidBreakerHalfOpenRequests {
                value: self.half_open_max_requests,
            });
        }
        if self.health_check_interval_ms == 0 {
            return Err(ConfigError::InvalidBreakerHealthCheckInterval {
                value: self.health_check_interval_ms,
            });
        }
        Ok(())
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn monitoring_period(&self) -> Duration {
        Duration::from_millis(self.monitoring_period_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl BackoffConfig {
    /// Validate backoff bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay_ms == 0 {
            return Err(ConfigError::InvalidBackoffBaseDelay {
                value: self.base_delay_ms,
            });
        }
        if self.max_delay_ms <= self.base_delay_ms {
            return Err(ConfigError::InvalidBackoffBounds {
                base: self.base_delay_ms,
                max: self.max_delay_ms,
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidBackoffMaxAttempts {
                value: self.max_attempts,
            });
        }
        if self.multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier {
                value: self.multiplier,
            });
        }
        Ok(())
    }
}

impl DlqConfig {
    /// Validate queue bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::InvalidDlqCapacity {
                value: self.max_queue_size,
            });
        }
        if self.max_retries == 0 {
            return Err(ConfigError::InvalidDlqMaxRetries {
                value: self.max_retries,
            });
        }
        if self.retry_base_delay_ms == 0 || self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::InvalidDlqRetryBounds {
                base: self.retry_base_delay_ms,
                max: self.retry_max_delay_ms,
            });
        }
        if self.cleanup_interval_ms == 0 {
            return Err(ConfigError::InvalidDlqCleanupInterval {
                value: self.cleanup_interval_ms,
            });
        }
        Ok(())
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn cleanup_max_age(&self) -> Duration {
        Duration::from_millis(self.cleanup_max_age_ms)
    }
}

impl OrchestratorConfig {
    /// Validate orchestrator bounds. A zero batch pause is allowed for
    /// tests and trusted upstreams.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_limit == 0 {
            return Err(ConfigError::InvalidHistoryLimit {
                value: self.history_limit,
            });
        }
        Ok(())
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }
}

impl SyncConfig {
    /// Validate all component configs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.breaker.validate()?;
        self.backoff.validate()?;
        self.dlq.validate()?;
        self.orchestrator.validate()?;
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            breaker: BreakerConfig::default(),
            backoff: BackoffConfig::default(),
            dlq: DlqConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_failure_threshold(),
            recovery_timeout_ms: default_breaker_recovery_timeout_ms(),
            monitoring_period_ms: default_breaker_monitoring_period_ms(),
            half_open_max_requests: default_breaker_half_open_max_requests(),
            health_check_interval_ms: default_breaker_health_check_interval_ms(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_backoff_base_delay_ms(),
            max_delay_ms: default_backoff_max_delay_ms(),
            max_attempts: default_backoff_max_attempts(),
            multiplier: default_backoff_multiplier(),
            jitter: default_backoff_jitter(),
        }
    }
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_dlq_max_queue_size(),
            max_retries: default_dlq_max_retries(),
            retry_base_delay_ms: default_dlq_retry_base_delay_ms(),
            retry_max_delay_ms: default_dlq_retry_max_delay_ms(),
            cleanup_interval_ms: default_dlq_cleanup_interval_ms(),
            cleanup_max_age_ms: default_dlq_cleanup_max_age_ms(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_pause_ms: default_batch_pause_ms(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_recovery_timeout_ms() -> u64 {
    60_000 // 1 minute
}

fn default_breaker_monitoring_period_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_breaker_half_open_max_requests() -> u32 {
    1
}

fn default_breaker_health_check_interval_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_backoff_base_delay_ms() -> u64 {
    1_000
}

fn default_backoff_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_max_attempts() -> u32 {
    3
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_jitter() -> bool {
    true
}

fn default_dlq_max_queue_size() -> usize {
    1_000
}

fn default_dlq_max_retries() -> u32 {
    5
}

fn default_dlq_retry_base_delay_ms() -> u64 {
    60_000 // 1 minute
}

fn default_dlq_retry_max_delay_ms() -> u64 {
    1_800_000 // 30 minutes
}

fn default_dlq_cleanup_interval_ms() -> u64 {
    3_600_000 // hourly
}

fn default_dlq_cleanup_max_age_ms() -> u64 {
    86_400_000 // 24 hours
}

fn default_batch_pause_ms() -> u64 {
    200
}

fn default_history_limit() -> usize {
    50
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("breaker failure threshold must be positive, got {value}")]
    InvalidBreakerThreshold { value: u32 },
    #[error("breaker recovery timeout must be positive, got {value} ms")]
    InvalidBreakerRecoveryTimeout { value: u64 },
    #[error("breaker monitoring period must be positive, got {value} ms")]
    InvalidBreakerMonitoringPeriod { value: u64 },
    #[error("breaker half-open request budget must be positive, got {value}")]
    InvalidBreakerHalfOpenRequests { value: u32 },
    #[error("breaker health check interval must be positive, got {value} ms")]
    InvalidBreakerHealthCheckInterval { value: u64 },
    #[error("backoff base delay must be positive, got {value} ms")]
    InvalidBackoffBaseDelay { value: u64 },
    #[error("backoff max delay ({max} ms) must exceed base delay ({base} ms)")]
    InvalidBackoffBounds { base: u64, max: u64 },
    #[error("backoff max attempts must be positive, got {value}")]
    InvalidBackoffMaxAttempts { value: u32 },
    #[error("backoff multiplier must be at least 1.0, got {value}")]
    InvalidBackoffMultiplier { value: f64 },
    #[error("dead letter queue capacity must be positive, got {value}")]
    InvalidDlqCapacity { value: usize },
    #[error("dead letter queue retry budget must be positive, got {value}")]
    InvalidDlqMaxRetries { value: u32 },
    #[error("dead letter queue retry base delay ({base} ms) must be positive and not exceed max ({max} ms)")]
    InvalidDlqRetryBounds { base: u64, max: u64 },
    #[error("dead letter queue cleanup interval must be positive, got {value} ms")]
    InvalidDlqCleanupInterval { value: u64 },
    #[error("operation history limit must be positive, got {value}")]
    InvalidHistoryLimit { value: usize },
}

/// Loads configuration using layered `.env` files and `SISSYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration. Later layers win: `.env`,
    /// `.env.local`, `.env.<profile>`, `.env.<profile>.local`, then the
    /// process environment.
    pub fn load(&self) -> Result<SyncConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("SISSYNC_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);

        let breaker = BreakerConfig {
            failure_threshold: parse_or(
                &mut layered,
                "BREAKER_FAILURE_THRESHOLD",
                default_breaker_failure_threshold,
            ),
            recovery_timeout_ms: parse_or(
                &mut layered,
                "BREAKER_RECOVERY_TIMEOUT_MS",
                default_breaker_recovery_timeout_ms,
            ),
            monitoring_period_ms: parse_or(
                &mut layered,
                "BREAKER_MONITORING_PERIOD_MS",
                default_breaker_monitoring_period_ms,
            ),
            half_open_max_requests: parse_or(
                &mut layered,
                "BREAKER_HALF_OPEN_MAX_REQUESTS",
                default_breaker_half_open_max_requests,
            ),
            health_check_interval_ms: parse_or(
                &mut layered,
                "BREAKER_HEALTH_CHECK_INTERVAL_MS",
                default_breaker_health_check_interval_ms,
            ),
        };

        let backoff = BackoffConfig {
            base_delay_ms: parse_or(
                &mut layered,
                "BACKOFF_BASE_DELAY_MS",
                default_backoff_base_delay_ms,
            ),
            max_delay_ms: parse_or(
                &mut layered,
                "BACKOFF_MAX_DELAY_MS",
                default_backoff_max_delay_ms,
            ),
            max_attempts: parse_or(
                &mut layered,
                "BACKOFF_MAX_ATTEMPTS",
                default_backoff_max_attempts,
            ),
            multiplier: parse_or(
                &mut layered,
                "BACKOFF_MULTIPLIER",
                default_backoff_multiplier,
            ),
            jitter: parse_or(&mut layered, "BACKOFF_JITTER", default_backoff_jitter),
        };

        let dlq = DlqConfig {
            max_queue_size: parse_or(
                &mut layered,
                "DLQ_MAX_QUEUE_SIZE",
                default_dlq_max_queue_size,
            ),
            max_retries: parse_or(&mut layered, "DLQ_MAX_RETRIES", default_dlq_max_retries),
            retry_base_delay_ms: parse_or(
                &mut layered,
                "DLQ_RETRY_BASE_DELAY_MS",
                default_dlq_retry_base_delay_ms,
            ),
            retry_max_delay_ms: parse_or(
                &mut layered,
                "DLQ_RETRY_MAX_DELAY_MS",
                default_dlq_retry_max_delay_ms,
            ),
            cleanup_interval_ms: parse_or(
                &mut layered,
                "DLQ_CLEANUP_INTERVAL_MS",
                default_dlq_cleanup_interval_ms,
            ),
            cleanup_max_age_ms: parse_or(
                &mut layered,
                "DLQ_CLEANUP_MAX_AGE_MS",
                default_dlq_cleanup_max_age_ms,
            ),
        };

        let orchestrator = OrchestratorConfig {
            batch_pause_ms: parse_or(&mut layered, "BATCH_PAUSE_MS", default_batch_pause_ms),
            history_limit: parse_or(&mut layered, "HISTORY_LIMIT", default_history_limit),
        };

        let config = SyncConfig {
            profile,
            log_level,
            log_format,
            breaker,
            backoff,
            dlq,
            orchestrator,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("SISSYNC_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix("SISSYNC_") {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_or<T: std::str::FromStr>(
    values: &mut BTreeMap<String, String>,
    key: &str,
    default: fn() -> T,
) -> T {
    values
        .remove(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(default)
}
