//! Per-key circuit breakers guarding handler execution.
//!
//! A breaker starts `Closed`. Once `failure_threshold` counted failures land
//! within `monitoring_window` it trips `Open` and rejects calls with
//! [`JobError::CircuitOpen`] without running them. After `recovery_timeout`
//! the next call moves it to `HalfOpen`, where up to `half_open_max_calls`
//! trial calls are admitted: a counted failure re-opens it, and that many
//! successes close it again.
//!
//! Only error kinds listed in `expected_error_kinds` count as failures. A
//! permanent or validation error says nothing about downstream health.

use crate::config::duration_format;
use crate::error::{JobError, JobErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Counted failures within the window that trip the breaker
    pub failure_threshold: u32,
    /// Time spent open before a trial call is let through
    #[serde(with = "duration_format")]
    pub recovery_timeout: Duration,
    /// Failures older than this are forgotten
    #[serde(with = "duration_format")]
    pub monitoring_window: Duration,
    /// Trial calls admitted while half-open; this many successes close the breaker
    pub half_open_max_calls: u32,
    /// Error kinds that count as failures
    pub expected_error_kinds: Vec<JobErrorKind>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            monitoring_window: Duration::from_secs(300),
            half_open_max_calls: 1,
            expected_error_kinds: vec![
                JobErrorKind::Timeout,
                JobErrorKind::Transient,
                JobErrorKind::Handler,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerStats {
    pub key: String,
    pub state: CircuitState,
    /// Counted failures inside the current window
    pub recent_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
    half_open_successes: u32,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
    last_failure_at: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            opened_at_utc: None,
            half_open_in_flight: 0,
            half_open_successes: 0,
            total_calls: 0,
            total_failures: 0,
            total_rejections: 0,
            last_failure_at: None,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

/// Admission ticket for one call. Dropping it unsettled (the call future was
/// cancelled) gives a half-open trial slot back.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut state = self.breaker.lock();
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            state: Mutex::new(BreakerState::closed()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `call` unless the breaker is open, recording its outcome.
    pub async fn execute<F, T>(&self, call: F) -> Result<T, JobError>
    where
        F: Future<Output = Result<T, JobError>>,
    {
        let mut admission = self.try_acquire()?;
        let result = call.await;

        admission.settled = true;
        match &result {
            Ok(_) => self.on_success(admission.trial),
            Err(error) => self.on_error(error, admission.trial),
        }
        result
    }

    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        self.refresh(&mut state, Instant::now());
        state.state
    }

    /// Force the breaker closed and forget recorded failures.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.state = CircuitState::Closed;
        state.failures.clear();
        state.opened_at = None;
        state.opened_at_utc = None;
        state.half_open_in_flight = 0;
        state.half_open_successes = 0;
        tracing::info!("Circuit breaker '{}' reset", self.key);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut state = self.lock();
        let now = Instant::now();
        self.refresh(&mut state, now);
        self.prune(&mut state, now);

        CircuitBreakerStats {
            key: self.key.clone(),
            state: state.state,
            recent_failures: state.failures.len() as u32,
            total_calls: state.total_calls,
            total_failures: state.total_failures,
            total_rejections: state.total_rejections,
            opened_at: state.opened_at_utc,
            last_failure_at: state.last_failure_at,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_acquire(&self) -> Result<Admission<'_>, JobError> {
        let mut state = self.lock();
        self.refresh(&mut state, Instant::now());

        let trial = match state.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen
                if state.half_open_in_flight + state.half_open_successes
                    < self.config.half_open_max_calls.max(1) =>
            {
                state.half_open_in_flight += 1;
                true
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                state.total_rejections += 1;
                tracing::debug!("Circuit breaker '{}' rejected call", self.key);
                return Err(JobError::CircuitOpen {
                    key: self.key.clone(),
                });
            }
        };

        state.total_calls += 1;
        Ok(Admission {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// Move an open breaker to half-open once the recovery timeout has passed.
    fn refresh(&self, state: &mut BreakerState, now: Instant) {
        if state.state != CircuitState::Open {
            return;
        }
        let ready = state
            .opened_at
            .is_none_or(|opened| now.duration_since(opened) >= self.config.recovery_timeout);
        if ready {
            state.state = CircuitState::HalfOpen;
            state.half_open_in_flight = 0;
            state.half_open_successes = 0;
            tracing::info!("Circuit breaker '{}' half-open, probing recovery", self.key);
        }
    }

    fn prune(&self, state: &mut BreakerState, now: Instant) {
        while let Some(oldest) = state.failures.front() {
            if now.duration_since(*oldest) > self.config.monitoring_window {
                state.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut state = self.lock();
        if !trial || state.state != CircuitState::HalfOpen {
            return;
        }

        state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        state.half_open_successes += 1;
        if state.half_open_successes >= self.config.half_open_max_calls.max(1) {
            state.state = CircuitState::Closed;
            state.failures.clear();
            state.opened_at = None;
            state.opened_at_utc = None;
            state.half_open_successes = 0;
            tracing::info!("Circuit breaker '{}' closed after recovery", self.key);
        }
    }

    fn on_error(&self, error: &JobError, trial: bool) {
        if !self.config.expected_error_kinds.contains(&error.kind()) {
            // Not a health signal; a trial that ends this way still proves reachability.
            self.on_success(trial);
            return;
        }

        let mut state = self.lock();
        let now = Instant::now();
        state.total_failures += 1;
        state.last_failure_at = Some(Utc::now());

        if trial {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }

        match state.state {
            CircuitState::HalfOpen => self.trip(&mut state, now),
            CircuitState::Closed => {
                state.failures.push_back(now);
                self.prune(&mut state, now);
                if state.failures.len() as u32 >= self.config.failure_threshold {
                    self.trip(&mut state, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, state: &mut BreakerState, now: Instant) {
        state.state = CircuitState::Open;
        state.opened_at = Some(now);
        state.opened_at_utc = Some(Utc::now());
        state.half_open_in_flight = 0;
        state.half_open_successes = 0;
        tracing::warn!(
            "Circuit breaker '{}' opened after {} failures; retrying in {:?}",
            self.key,
            state.failures.len().max(1),
            self.config.recovery_timeout
        );
    }
}
