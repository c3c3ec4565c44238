//! Runs one execution against its handler.
//!
//! Every attempt goes through the same steps: a double-submit guard, handler
//! lookup, payload validation, then the handler call inside the job name's
//! circuit breaker and a timeout. Handler panics are caught and reported as
//! [`JobError::Handler`]. The processor never touches queue state; it returns
//! the outcome and the manager records it.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::error::JobError;
use crate::job::{ExecutionId, JobExecution};
use crate::registry::{JobContext, JobHandler, JobRegistry};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Counters describing processor activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessorStats {
    pub accepting: bool,
    pub in_flight: usize,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub panicked: u64,
    pub circuit_breakers: Vec<CircuitBreakerStats>,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    panicked: AtomicU64,
}

pub struct JobProcessor {
    registry: Arc<JobRegistry>,
    default_timeout: Duration,
    breaker_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    in_flight: Mutex<HashSet<ExecutionId>>,
    accepting: AtomicBool,
    counters: Counters,
}

impl std::fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProcessor")
            .field("default_timeout", &self.default_timeout)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

/// Exclusive right to process one execution. Dropping it releases the
/// execution id.
#[derive(Debug)]
pub struct ProcessingClaim<'a> {
    in_flight: &'a Mutex<HashSet<ExecutionId>>,
    execution_id: ExecutionId,
}

impl Drop for ProcessingClaim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.execution_id);
    }
}

impl JobProcessor {
    pub fn new(
        registry: Arc<JobRegistry>,
        default_timeout: Duration,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            registry,
            default_timeout,
            breaker_config,
            breakers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            accepting: AtomicBool::new(true),
            counters: Counters::default(),
        }
    }

    pub fn start(&self) {
        self.accepting.store(true, Ordering::SeqCst);
        debug!("Job processor accepting work");
    }

    /// Refuse new attempts with [`JobError::ShuttingDown`]. Attempts already
    /// running are not interrupted.
    pub fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        debug!("Job processor stopped accepting work");
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Run one attempt of `execution` and return the handler's result.
    pub async fn process(
        &self,
        execution: &JobExecution,
    ) -> Result<serde_json::Value, JobError> {
        if !self.is_accepting() {
            return Err(JobError::ShuttingDown);
        }
        let claim = self.claim(execution.execution_id)?;
        self.process_claimed(execution, claim).await
    }

    /// Run one attempt of an execution already claimed with [`claim`].
    ///
    /// [`claim`]: JobProcessor::claim
    pub async fn process_claimed(
        &self,
        execution: &JobExecution,
        _claim: ProcessingClaim<'_>,
    ) -> Result<serde_json::Value, JobError> {
        if !self.is_accepting() {
            return Err(JobError::ShuttingDown);
        }

        let execution_id = execution.execution_id;
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        let name = execution.name();
        let handler = self
            .registry
            .get_handler(name)
            .ok_or_else(|| JobError::Configuration {
                name: name.to_string(),
            })
            .inspect_err(|_| {
                error!("No handler registered for job type '{}'", name);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            })?;

        if let Err(message) = handler.validate(&execution.definition.payload) {
            warn!(
                "Payload validation failed for job {} ({}): {}",
                execution.job_id(),
                name,
                message
            );
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            return Err(JobError::Validation {
                name: name.to_string(),
                message,
            });
        }

        let breaker = self.breaker_for(name);
        let timeout = execution.definition.timeout.unwrap_or(self.default_timeout);
        let (ctx, cancel) = JobContext::new(
            execution_id,
            execution.job_id(),
            name,
            execution.retry_count + 1,
        );

        debug!(
            "Executing job {} ({}) attempt {} with {:?} timeout",
            execution.job_id(),
            name,
            ctx.attempt,
            timeout
        );

        let outcome = breaker
            .execute(async {
                let call = AssertUnwindSafe(handler.execute(&execution.definition.payload, ctx))
                    .catch_unwind();
                match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(panic)) => {
                        self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                        let message = panic_message(panic.as_ref());
                        error!("Handler for job {} panicked: {}", execution.job_id(), message);
                        Err(JobError::handler(format!("handler panicked: {}", message)))
                    }
                    Err(_) => {
                        cancel.cancel();
                        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                        warn!("Job {} timed out after {:?}", execution.job_id(), timeout);
                        Err(JobError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        })
                    }
                }
            })
            .await;

        match outcome {
            Ok(result) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                run_hook(name, "on_success", handler.on_success(&result)).await;
                Ok(result)
            }
            Err(error) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                run_hook(name, "on_failure", handler.on_failure(&error)).await;
                if execution.retry_count > 0 {
                    run_hook(name, "on_retry", handler.on_retry(execution.retry_count)).await;
                }
                Err(error)
            }
        }
    }

    /// Mark `execution_id` as in flight. Fails with
    /// [`JobError::AlreadyProcessing`] while another claim on it is held.
    pub fn claim(&self, execution_id: ExecutionId) -> Result<ProcessingClaim<'_>, JobError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(execution_id) {
            warn!("Execution {} submitted while already processing", execution_id);
            return Err(JobError::AlreadyProcessing {
                execution_id: execution_id.to_string(),
            });
        }
        Ok(ProcessingClaim {
            in_flight: &self.in_flight,
            execution_id,
        })
    }

    fn breaker_for(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.breaker_config.clone())))
            .clone()
    }

    /// Close the breaker for `name`. Returns `false` if none exists yet.
    pub fn reset_circuit_breaker(&self, name: &str) -> bool {
        let breaker = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        match breaker {
            Some(breaker) => {
                breaker.reset();
                info!("Circuit breaker for '{}' reset by request", name);
                true
            }
            None => false,
        }
    }

    pub fn circuit_breaker_stats(&self, name: &str) -> Option<CircuitBreakerStats> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|breaker| breaker.stats())
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn stats(&self) -> ProcessorStats {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut circuit_breakers: Vec<CircuitBreakerStats> =
            breakers.iter().map(|breaker| breaker.stats()).collect();
        circuit_breakers.sort_by(|a, b| a.key.cmp(&b.key));

        ProcessorStats {
            accepting: self.is_accepting(),
            in_flight: self.in_flight(),
            processed: self.counters.processed.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            circuit_breakers,
        }
    }
}

/// Await a handler hook, logging its error or panic instead of propagating it.
async fn run_hook<F>(name: &str, hook: &str, fut: F)
where
    F: Future<Output = Result<(), JobError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{} hook for '{}' failed: {}", hook, name, e),
        Err(panic) => warn!(
            "{} hook for '{}' panicked: {}",
            hook,
            name,
            panic_message(panic.as_ref())
        ),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobDefinition;
    use crate::registry::handler_fn;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn processor(registry: Arc<JobRegistry>) -> JobProcessor {
        JobProcessor::new(
            registry,
            Duration::from_millis(50),
            CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
                ..Default::default()
            },
        )
    }

    fn execution(name: &str) -> JobExecution {
        JobExecution::new(JobDefinition::new(name, json!({"n": 1})), 3, Utc::now())
    }

    #[derive(Default)]
    struct HookCounter {
        successes: AtomicUsize,
        failures: AtomicUsize,
        retries: AtomicUsize,
        executes: AtomicUsize,
    }

    struct Flaky {
        counter: Arc<HookCounter>,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute(
            &self,
            payload: &serde_json::Value,
            _ctx: JobContext,
        ) -> Result<serde_json::Value, JobError> {
            self.counter.executes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(JobError::transient("upstream busy"))
            } else {
                Ok(payload.clone())
            }
        }

        fn validate(&self, payload: &serde_json::Value) -> Result<(), String> {
            if payload.get("n").is_some() {
                Ok(())
            } else {
                Err("missing n".to_string())
            }
        }

        async fn on_success(&self, _result: &serde_json::Value) -> Result<(), JobError> {
            self.counter.successes.fetch_add(1, Ordering::SeqCst);
            Err(JobError::handler("hook errors are swallowed"))
        }

        async fn on_failure(&self, _error: &JobError) -> Result<(), JobError> {
            self.counter.failures.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_retry(&self, _attempt: u32) -> Result<(), JobError> {
            self.counter.retries.fetch_add(1, Ordering::SeqCst);
            panic!("retry hook panic is swallowed");
        }
    }

    #[tokio::test]
    async fn test_missing_handler_is_configuration_error() {
        let processor = processor(Arc::new(JobRegistry::new()));
        let error = processor.process(&execution("nobody")).await.unwrap_err();
        assert!(matches!(error, JobError::Configuration { .. }));
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn test_success_runs_success_hook() {
        let counter = Arc::new(HookCounter::default());
        let registry = Arc::new(JobRegistry::new());
        registry
            .register_handler(Flaky {
                counter: counter.clone(),
                fail: false,
            })
            .unwrap();
        let processor = processor(registry);

        let result = processor.process(&execution("flaky")).await.unwrap();
        assert_eq!(result, json!({"n": 1}));
        assert_eq!(counter.successes.load(Ordering::SeqCst), 1);
        assert_eq!(processor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_hooks_and_retry_hook_only_on_retries() {
        let counter = Arc::new(HookCounter::default());
        let registry = Arc::new(JobRegistry::new());
        registry
            .register_handler(Flaky {
                counter: counter.clone(),
                fail: true,
            })
            .unwrap();
        let processor = processor(registry);

        let first = execution("flaky");
        assert!(processor.process(&first).await.is_err());
        assert_eq!(counter.failures.load(Ordering::SeqCst), 1);
        assert_eq!(counter.retries.load(Ordering::SeqCst), 0);

        let mut retried = execution("flaky");
        retried.retry_count = 1;
        assert!(processor.process(&retried).await.is_err());
        assert_eq!(counter.retries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_submit_of_same_execution_is_rejected() {
        let executes = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(JobRegistry::new());
        {
            let executes = executes.clone();
            registry
                .register(Arc::new(handler_fn("report", move |payload, _ctx| {
                    let executes = executes.clone();
                    async move {
                        executes.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(payload)
                    }
                })))
                .unwrap();
        }
        let processor = processor(registry);
        let execution = execution("report");

        let (first, second) = tokio::join!(
            processor.process(&execution),
            processor.process(&execution)
        );
        assert_eq!(first.unwrap(), json!({"n": 1}));
        assert!(matches!(
            second,
            Err(JobError::AlreadyProcessing { execution_id }) if execution_id == execution.execution_id.to_string()
        ));
        assert!(!JobError::AlreadyProcessing { execution_id: String::new() }.is_retryable());
        assert_eq!(executes.load(Ordering::SeqCst), 1);
        assert_eq!(processor.in_flight(), 0);

        assert!(processor.process(&execution).await.is_ok());
    }

    #[tokio::test]
    async fn test_claim_blocks_process_until_released() {
        let registry = Arc::new(JobRegistry::new());
        registry
            .register(Arc::new(handler_fn("report", |payload, _ctx| async move {
                Ok(payload)
            })))
            .unwrap();
        let processor = processor(registry);
        let execution = execution("report");

        let claim = processor.claim(execution.execution_id).unwrap();
        assert_eq!(processor.in_flight(), 1);
        assert!(matches!(
            processor.process(&execution).await,
            Err(JobError::AlreadyProcessing { .. })
        ));
        assert!(processor.claim(execution.execution_id).is_err());

        let result = processor.process_claimed(&execution, claim).await.unwrap();
        assert_eq!(result, json!({"n": 1}));
        assert_eq!(processor.in_flight(), 0);
        assert!(processor.claim(execution.execution_id).is_ok());
    }

    #[tokio::test]
    async fn test_validation_failure_skips_execute() {
        let counter = Arc::new(HookCounter::default());
        let registry = Arc::new(JobRegistry::new());
        registry
            .register_handler(Flaky {
                counter: counter.clone(),
                fail: false,
            })
            .unwrap();
        let processor = processor(registry);

        let invalid = JobExecution::new(JobDefinition::new("flaky", json!({})), 3, Utc::now());
        let error = processor.process(&invalid).await.unwrap_err();
        assert!(matches!(error, JobError::Validation { .. }));
        assert_eq!(counter.executes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_cancels_context() {
        let registry = Arc::new(JobRegistry::new());
        let observed = Arc::new(AtomicBool::new(false));
        let seen = observed.clone();
        registry
            .register(Arc::new(handler_fn("slow", move |_payload, ctx| {
                let seen = seen.clone();
                async move {
                    let watcher = ctx.clone();
                    tokio::spawn(async move {
                        watcher.cancelled().await;
                        seen.store(true, Ordering::SeqCst);
                    });
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(json!(null))
                }
            })))
            .unwrap();
        let processor = processor(registry);

        let error = processor.process(&execution("slow")).await.unwrap_err();
        assert_eq!(error, JobError::Timeout { timeout_ms: 50 });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(observed.load(Ordering::SeqCst));
        assert_eq!(processor.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_handler_error() {
        let registry = Arc::new(JobRegistry::new());
        registry
            .register(Arc::new(handler_fn("explode", |_payload, _ctx| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(json!(null))
            })))
            .unwrap();
        let processor = processor(registry);

        let error = processor.process(&execution("explode")).await.unwrap_err();
        assert_eq!(error, JobError::handler("handler panicked: kaboom"));
        assert_eq!(processor.stats().panicked, 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_resets() {
        let counter = Arc::new(HookCounter::default());
        let registry = Arc::new(JobRegistry::new());
        registry
            .register_handler(Flaky {
                counter: counter.clone(),
                fail: true,
            })
            .unwrap();
        let processor = processor(registry);

        for _ in 0..2 {
            let _ = processor.process(&execution("flaky")).await;
        }
        let error = processor.process(&execution("flaky")).await.unwrap_err();
        assert!(matches!(error, JobError::CircuitOpen { .. }));
        assert_eq!(counter.executes.load(Ordering::SeqCst), 2);

        assert!(processor.reset_circuit_breaker("flaky"));
        assert!(!processor.reset_circuit_breaker("unknown"));
        let _ = processor.process(&execution("flaky")).await;
        assert_eq!(counter.executes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stopped_processor_rejects() {
        let processor = processor(Arc::new(JobRegistry::new()));
        processor.stop();
        assert_eq!(
            processor.process(&execution("any")).await,
            Err(JobError::ShuttingDown)
        );
        processor.start();
        assert!(processor.is_accepting());
    }
}
