//! # Error Classification
//!
//! Normalizes every upstream failure shape into a tagged [`RawError`] and
//! derives the retry policy for it: retryable or not, severity, category,
//! and a suggested delay. Classification is a pure function of the raw
//! error; the classifier also keeps a rolling 24-hour history of outcomes
//! for observability, which never feeds back into the decision.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

/// Width of the rolling classification history window.
const HISTORY_WINDOW: chrono::Duration = chrono::Duration::hours(24);

/// Connection-level fault flavors reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionFault {
    Refused,
    DnsFailure,
    Reset,
}

/// Normalized upstream failure, produced at the transport boundary.
///
/// Integration clients map whatever their HTTP stack throws into one of
/// these variants before the core ever sees it; the classifier never
/// inspects transport-specific error types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawError {
    /// Socket-level fault before any response arrived.
    Connection {
        kind: ConnectionFault,
        message: String,
    },
    /// The call exceeded its transport deadline.
    Timeout { message: String },
    /// The upstream answered with a non-success status.
    Http {
        status: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        /// Parsed `Retry-After` header, in seconds, when the caller saw one.
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },
    /// Anything that could not be normalized further.
    Unknown { message: String },
}

impl RawError {
    pub fn http(status: u16) -> Self {
        RawError::Http {
            status,
            body: None,
            retry_after: None,
        }
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        RawError::Timeout {
            message: message.into(),
        }
    }

    pub fn unknown<S: Into<String>>(message: S) -> Self {
        RawError::Unknown {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RawError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawError::Connection { kind, message } => {
                let label = match kind {
                    ConnectionFault::Refused => "connection refused",
                    ConnectionFault::DnsFailure => "DNS failure",
                    ConnectionFault::Reset => "connection reset",
                };
                write!(f, "{}: {}", label, message)
            }
            RawError::Timeout { message } => write!(f, "timeout: {}", message),
            RawError::Http { status, body, .. } => {
                write!(f, "HTTP error {}", status)?;
                if let Some(body) = body {
                    write!(f, ": {}", body)?;
                }
                Ok(())
            }
            RawError::Unknown { message } => write!(f, "unknown error: {}", message),
        }
    }
}

impl std::error::Error for RawError {}

/// Coarse error family used for routing and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Connection,
    Timeout,
    Auth,
    Authz,
    NotFound,
    RateLimit,
    Validation,
    ServiceUnavailable,
    Server,
    Unknown,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Connection => "connection",
            ErrorType::Timeout => "timeout",
            ErrorType::Auth => "auth",
            ErrorType::Authz => "authz",
            ErrorType::NotFound => "not_found",
            ErrorType::RateLimit => "rate_limit",
            ErrorType::Validation => "validation",
            ErrorType::ServiceUnavailable => "service_unavailable",
            ErrorType::Server => "server",
            ErrorType::Unknown => "unknown",
        }
    }
}

/// How bad the failure is for operators triaging a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

/// Retry-policy category per the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Permanent,
    Auth,
    Authz,
}

/// Structured classification of one upstream failure. Derived, never
/// stored; always recomputed from the raw error.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorClassification {
    pub error_type: ErrorType,
    pub retryable: bool,
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    /// Suggested wait before the next attempt, when the error implies one.
    pub retry_delay_hint: Option<Duration>,
    /// Structured validation messages extracted from a 4xx response body.
    pub validation_errors: Vec<String>,
}

/// Classify a normalized failure. Pure and total: every input maps to a
/// classification, with `Unknown`/not-retryable as the conservative
/// fallback. Rules apply in priority order; the first match wins.
pub fn classify(error: &RawError) -> ErrorClassification {
    match error {
        RawError::Connection { .. } => ErrorClassification {
            error_type: ErrorType::Connection,
            retryable: true,
            severity: ErrorSeverity::High,
            category: ErrorCategory::Transient,
            retry_delay_hint: Some(Duration::from_millis(2_000)),
            validation_errors: Vec::new(),
        },
        RawError::Timeout { .. } => ErrorClassification {
            error_type: ErrorType::Timeout,
            retryable: true,
            severity: ErrorSeverity::Medium,
            category: ErrorCategory::Transient,
            retry_delay_hint: Some(Duration::from_millis(1_500)),
            validation_errors: Vec::new(),
        },
        RawError::Http {
            status,
            body,
            retry_after,
        } => classify_http(*status, body.as_deref(), *retry_after),
        RawError::Unknown { .. } => fallback(),
    }
}

fn classify_http(status: u16, body: Option<&str>, retry_after: Option<u64>) -> ErrorClassification {
    match status {
        401 => ErrorClassification {
            error_type: ErrorType::Auth,
            retryable: false,
            severity: ErrorSeverity::Critical,
            category: ErrorCategory::Auth,
            retry_delay_hint: None,
            validation_errors: Vec::new(),
        },
        403 => ErrorClassification {
            error_type: ErrorType::Authz,
            retryable: false,
            severity: ErrorSeverity::Critical,
            category: ErrorCategory::Authz,
            retry_delay_hint: None,
            validation_errors: Vec::new(),
        },
        404 => ErrorClassification {
            error_type: ErrorType::NotFound,
            retryable: false,
            severity: ErrorSeverity::Low,
            category: ErrorCategory::Permanent,
            retry_delay_hint: None,
            validation_errors: Vec::new(),
        },
        429 => ErrorClassification {
            error_type: ErrorType::RateLimit,
            retryable: true,
            severity: ErrorSeverity::Medium,
            category: ErrorCategory::Transient,
            retry_delay_hint: Some(Duration::from_secs(retry_after.unwrap_or(5))),
            validation_errors: Vec::new(),
        },
        503 => ErrorClassification {
            error_type: ErrorType::ServiceUnavailable,
            retryable: true,
            severity: ErrorSeverity::High,
            category: ErrorCategory::Transient,
            retry_delay_hint: Some(Duration::from_millis(3_000)),
            validation_errors: Vec::new(),
        },
        s if (400..500).contains(&s) => ErrorClassification {
            error_type: ErrorType::Validation,
            retryable: false,
            severity: ErrorSeverity::Medium,
            category: ErrorCategory::Permanent,
            retry_delay_hint: None,
            validation_errors: extract_validation_errors(body),
        },
        s if (500..600).contains(&s) => ErrorClassification {
            error_type: ErrorType::Server,
            retryable: true,
            severity: ErrorSeverity::High,
            category: ErrorCategory::Transient,
            retry_delay_hint: Some(Duration::from_millis(2_500)),
            validation_errors: Vec::new(),
        },
        _ => fallback(),
    }
}

fn fallback() -> ErrorClassification {
    ErrorClassification {
        error_type: ErrorType::Unknown,
        retryable: false,
        severity: ErrorSeverity::Medium,
        category: ErrorCategory::Permanent,
        retry_delay_hint: None,
        validation_errors: Vec::new(),
    }
}

/// Pull structured validation messages out of a 4xx response body.
/// Accepts `{"errors": ["..."]}` and `{"errors": [{"message": "..."}]}`.
fn extract_validation_errors(body: Option<&str>) -> Vec<String> {
    let Some(body) = body else {
        return Vec::new();
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return Vec::new();
    };
    let Some(errors) = value.get("errors").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    errors
        .iter()
        .filter_map(|entry| {
            entry
                .as_str()
                .map(str::to_string)
                .or_else(|| entry.get("message")?.as_str().map(str::to_string))
        })
        .collect()
}

/// One observed classification, retained for the rolling history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationRecord {
    pub recorded_at: DateTime<Utc>,
    pub error_type: ErrorType,
    pub severity: ErrorSeverity,
    pub retryable: bool,
}

/// Aggregated view of the rolling classification history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassificationStats {
    pub total: u64,
    pub retryable: u64,
    pub by_type: BTreeMap<&'static str, u64>,
    pub by_severity: BTreeMap<&'static str, u64>,
}

/// Stateless classification plus a rolling 24-hour observation history.
///
/// The history is bookkeeping only; `classify` never consults it.
pub struct ErrorClassifier {
    history: Mutex<VecDeque<ClassificationRecord>>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Classify a failure and record the outcome in the rolling history.
    pub fn classify(&self, error: &RawError) -> ErrorClassification {
        let classification = classify(error);

        let now = Utc::now();
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(front) = history.front() {
            if now - front.recorded_at > HISTORY_WINDOW {
                history.pop_front();
            } else {
                break;
            }
        }
        history.push_back(ClassificationRecord {
            recorded_at: now,
            error_type: classification.error_type,
            severity: classification.severity,
            retryable: classification.retryable,
        });
        drop(history);

        counter!(
            "sync_errors_classified_total",
            "type" => classification.error_type.as_str(),
            "severity" => classification.severity.as_str()
        )
        .increment(1);

        classification
    }

    /// Aggregate the rolling history for dashboards/alerting.
    pub fn history_stats(&self) -> ClassificationStats {
        let now = Utc::now();
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let mut stats = ClassificationStats::default();
        for record in history.iter() {
            if now - record.recorded_at > HISTORY_WINDOW {
                continue;
            }
            stats.total += 1;
            if record.retryable {
                stats.retryable += 1;
            }
            *stats.by_type.entry(record.error_type.as_str()).or_insert(0) += 1;
            *stats
                .by_severity
                .entry(record.severity.as_str())
                .or_insert(0) += 1;
        }
        stats
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}
