//! # Circuit Breaker
//!
//! Fault-isolation state machine guarding the upstream SIS API:
//! `Closed -> Open -> HalfOpen -> {Closed, Open}`. Consecutive failures in
//! `Closed` trip the circuit; after a recovery timeout a bounded number of
//! probe calls are admitted, and their outcome decides whether the circuit
//! closes again. Every transition lands in an append-only history and is
//! broadcast to subscribers.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BreakerConfig, ConfigError};

/// Buffered state-change events per subscriber.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Breaker position in the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    FailureThresholdExceeded,
    RecoveryTimeoutElapsed,
    RecoverySuccessful,
    ProbeFailed,
    HealthCheckPassed,
    Forced,
}

impl TransitionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionReason::FailureThresholdExceeded => "failure_threshold_exceeded",
            TransitionReason::RecoveryTimeoutElapsed => "recovery_timeout_elapsed",
            TransitionReason::RecoverySuccessful => "recovery_successful",
            TransitionReason::ProbeFailed => "probe_failed",
            TransitionReason::HealthCheckPassed => "health_check_passed",
            TransitionReason::Forced => "forced",
        }
    }
}

/// One entry in the append-only transition history, also broadcast to
/// subscribers on each transition.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub state: CircuitState,
    pub at: DateTime<Utc>,
    pub reason: TransitionReason,
    pub time_in_previous: Duration,
}

/// Success/failure rates and latency over the rolling outcome window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BreakerStatistics {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub average_latency: Duration,
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; no call was made.
    #[error("circuit open; next probe admitted in {retry_in:?}")]
    Open { retry_in: Duration },
    /// The call was admitted and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct RequestOutcome {
    at: Instant,
    success: bool,
    latency: Duration,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    probes_admitted: u32,
    probe_successes: u32,
    entered_state_at: Instant,
    outcomes: VecDeque<RequestOutcome>,
    history: Vec<StateChange>,
}

/// Process-wide circuit breaker. All mutation is internally serialized;
/// callers never hold the guarded call's future under the lock.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
    events: broadcast::Sender<StateChange>,
}

impl CircuitBreaker {
    /// Build a breaker in `Closed`, validating the configuration.
    pub fn new(config: BreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                probes_admitted: 0,
                probe_successes: 0,
                entered_state_at: Instant::now(),
                outcomes: VecDeque::new(),
                history: Vec::new(),
            }),
            events,
        })
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Copy of the append-only transition history.
    pub fn transition_history(&self) -> Vec<StateChange> {
        self.lock().history.clone()
    }

    /// Subscribe to state-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Run `f` through the breaker: admission check, then the call, then
    /// outcome bookkeeping. Rejections carry the time until the next probe
    /// is admitted.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;
        let started = Instant::now();
        match f().await {
            Ok(value) => {
                self.record_success(started.elapsed());
                Ok(value)
            }
            Err(err) => {
                self.record_failure(started.elapsed());
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// As [`execute`](Self::execute), but a circuit-open rejection invokes
    /// `fallback` instead of propagating.
    pub async fn execute_with_fallback<T, E, F, Fut, FB, FbFut>(
        &self,
        f: F,
        fallback: FB,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> FbFut,
        FbFut: Future<Output = Result<T, E>>,
    {
        match self.execute(f).await {
            Ok(value) => Ok(value),
            Err(BreakerError::Open { retry_in }) => {
                debug!(retry_in_ms = retry_in.as_millis() as u64, "circuit open, using fallback");
                fallback().await
            }
            Err(BreakerError::Inner(err)) => Err(err),
        }
    }

    /// Operational/test override; resets the failure and probe counters.
    pub fn force_state(&self, state: CircuitState) {
        let mut inner = self.lock();
        if inner.state == state {
            return;
        }
        warn!(from = inner.state.as_str(), to = state.as_str(), "circuit state forced");
        self.transition(&mut inner, state, TransitionReason::Forced);
    }

    /// Success rate, failure rate, and mean latency over the trailing
    /// `window` (clamped to the configured monitoring period). Independent
    /// bookkeeping from the transition counters.
    pub fn statistics(&self, window: Duration) -> BreakerStatistics {
        let window = window.min(self.config.monitoring_period());
        let now = Instant::now();
        let inner = self.lock();

        let mut stats = BreakerStatistics::default();
        let mut latency_total = Duration::ZERO;
        for outcome in inner.outcomes.iter() {
            if now.duration_since(outcome.at) > window {
                continue;
            }
            stats.requests += 1;
            if outcome.success {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
            latency_total += outcome.latency;
        }
        if stats.requests > 0 {
            stats.success_rate = stats.successes as f64 / stats.requests as f64;
            stats.failure_rate = stats.failures as f64 / stats.requests as f64;
            stats.average_latency = latency_total / stats.requests as u32;
        }
        stats
    }

    /// Periodic external health probe. A healthy probe while `Open` moves
    /// the breaker to `HalfOpen` ahead of the recovery timeout; a failed
    /// probe counts as a failure. Runs serially until `shutdown` fires, so
    /// checks never overlap themselves.
    pub async fn run_health_check<P, Fut>(&self, mut probe: P, shutdown: CancellationToken)
    where
        P: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        info!(
            interval_ms = self.config.health_check_interval_ms,
            "starting circuit health check loop"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("circuit health check shutdown requested");
                    break;
                }
                _ = sleep(self.config.health_check_interval()) => {
                    let healthy = probe().await;
                    if healthy {
                        let mut inner = self.lock();
                        if inner.state == CircuitState::Open {
                            info!("health probe passed while open, admitting probes early");
                            self.transition(
                                &mut inner,
                                CircuitState::HalfOpen,
                                TransitionReason::HealthCheckPassed,
                            );
                        }
                    } else {
                        debug!("health probe failed");
                        self.record_failure(Duration::ZERO);
                    }
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admission rule: pass in `Closed`; in `Open`, admit only once the
    /// recovery timeout has elapsed (transitioning to `HalfOpen` first);
    /// in `HalfOpen`, admit up to the configured probe budget.
    fn admit<E>(&self) -> Result<(), BreakerError<E>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let since_failure = inner
                    .last_failure_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if since_failure >= self.config.recovery_timeout() {
                    self.transition(
                        &mut inner,
                        CircuitState::HalfOpen,
                        TransitionReason::RecoveryTimeoutElapsed,
                    );
                    inner.probes_admitted = 1;
                    Ok(())
                } else {
                    counter!("circuit_breaker_rejections_total").increment(1);
                    Err(BreakerError::Open {
                        retry_in: self.config.recovery_timeout() - since_failure,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_admitted < self.config.half_open_max_requests {
                    inner.probes_admitted += 1;
                    Ok(())
                } else {
                    counter!("circuit_breaker_rejections_total").increment(1);
                    Err(BreakerError::Open {
                        retry_in: Duration::ZERO,
                    })
                }
            }
        }
    }

    fn record_success(&self, latency: Duration) {
        let mut inner = self.lock();
        Self::push_outcome(&mut inner, true, latency, self.config.monitoring_period());
        histogram!("circuit_breaker_call_duration_ms").record(latency.as_secs_f64() * 1_000.0);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.half_open_max_requests {
                    self.transition(
                        &mut inner,
                        CircuitState::Closed,
                        TransitionReason::RecoverySuccessful,
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, latency: Duration) {
        let mut inner = self.lock();
        Self::push_outcome(&mut inner, false, latency, self.config.monitoring_period());
        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "failure threshold reached, opening circuit"
                    );
                    self.transition(
                        &mut inner,
                        CircuitState::Open,
                        TransitionReason::FailureThresholdExceeded,
                    );
                }
            }
            CircuitState::HalfOpen => {
                warn!("probe call failed, reopening circuit");
                self.transition(&mut inner, CircuitState::Open, TransitionReason::ProbeFailed);
            }
            CircuitState::Open => {}
        }
    }

    fn push_outcome(
        inner: &mut BreakerState,
        success: bool,
        latency: Duration,
        window: Duration,
    ) {
        let now = Instant::now();
        inner.outcomes.push_back(RequestOutcome {
            at: now,
            success,
            latency,
        });
        while let Some(front) = inner.outcomes.front() {
            if now.duration_since(front.at) > window {
                inner.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState, reason: TransitionReason) {
        let time_in_previous = inner.entered_state_at.elapsed();
        let from = inner.state;
        inner.state = to;
        inner.entered_state_at = Instant::now();
        inner.consecutive_failures = 0;
        inner.probes_admitted = 0;
        inner.probe_successes = 0;

        let change = StateChange {
            state: to,
            at: Utc::now(),
            reason,
            time_in_previous,
        };
        inner.history.push(change.clone());

        info!(
            from = from.as_str(),
            to = to.as_str(),
            reason = reason.as_str(),
            time_in_previous_ms = time_in_previous.as_millis() as u64,
            "circuit state changed"
        );
        counter!(
            "circuit_breaker_transitions_total",
            "to" => to.as_str(),
            "reason" => reason.as_str()
        )
        .increment(1);

        // Nobody listening is fine; the history retains the transition.
        let _ = self.events.send(change);
    }
}
