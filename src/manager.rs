//! The engine: owns every component and runs the dispatch loop.
//!
//! A single run loop pulls ready executions from the [`JobQueue`] and hands
//! each one to a spawned task that runs it through the [`JobProcessor`]. A
//! semaphore sized to `concurrency` bounds how many executions are in flight.
//! Failed attempts that may be retried go back into the queue after an
//! exponential back-off.
//!
//! ```rust,no_run
//! use jobmill::config::EngineConfig;
//! use jobmill::job::JobDefinition;
//! use jobmill::manager::JobManager;
//! use jobmill::registry::handler_fn;
//! use serde_json::json;
//!
//! # async fn run() -> jobmill::Result<()> {
//! let manager = JobManager::new(EngineConfig::default())?;
//! manager.register_handler(handler_fn("greet", |payload, _ctx| async move {
//!     Ok(json!({ "greeting": format!("hello {}", payload["name"]) }))
//! }))?;
//!
//! manager.start().await?;
//! let id = manager.add_job(JobDefinition::new("greet", json!({ "name": "ada" })))?;
//! # let _ = id;
//! manager.stop().await?;
//! # Ok(())
//! # }
//! ```

use crate::clock::{SharedClock, SystemClock};
use crate::config::EngineConfig;
use crate::error::JobError;
use crate::events::{EventBus, EventFilter, EventListener, EventSubscription, JobEvent, JobEventKind};
use crate::job::{ExecutionId, JobDefinition, JobExecution, JobResult};
use crate::monitoring::{DetailedStats, JobMetrics, JobMonitoring};
use crate::processor::{JobProcessor, ProcessorStats};
use crate::queue::{JobQueue, QueueStatus};
use crate::registry::{JobHandler, JobRegistry};
use crate::retry::RetryPolicy;
use crate::scheduler::{JobSchedule, JobScheduler, ScheduleId, ScheduledJob};
use crate::{JobmillError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::{MetricsConfig, PrometheusMetricsCollector};

/// Result of [`JobManager::health_check`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub running: bool,
    pub queue_size: usize,
    pub success_rate: f64,
    pub in_flight: usize,
    pub checked_at: DateTime<Utc>,
}

/// Handle to a job engine. Clones share the same engine.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: EngineConfig,
    events: EventBus,
    registry: Arc<JobRegistry>,
    queue: Arc<JobQueue>,
    scheduler: JobScheduler,
    scheduled: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ScheduledJob>>>,
    processor: Arc<JobProcessor>,
    monitoring: Arc<JobMonitoring>,
    #[cfg(feature = "metrics")]
    prometheus: Arc<PrometheusMetricsCollector>,
    retry_policy: RetryPolicy,
    permits: Arc<Semaphore>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("running", &self.is_running())
            .field("in_flight", &self.in_flight())
            .field("handlers", &self.inner.registry.handler_names())
            .finish()
    }
}

/// Decrements the in-flight counter when a dispatched attempt ends.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl JobManager {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build an engine whose queue and monitoring read time from `clock`.
    pub fn with_clock(config: EngineConfig, clock: SharedClock) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new(config.events.clone());
        let registry = Arc::new(JobRegistry::new());
        let queue = Arc::new(
            JobQueue::new(events.clone())
                .with_clock(clock.clone())
                .with_default_max_retries(config.job.max_retries),
        );
        let (scheduler, scheduled) = JobScheduler::new(events.clone());
        let processor = Arc::new(JobProcessor::new(
            Arc::clone(&registry),
            config.job.timeout,
            config.circuit_breaker.clone(),
        ));
        let monitoring = Arc::new(
            JobMonitoring::new(config.monitoring.clone(), events.clone())
                .with_queue(Arc::clone(&queue))
                .with_clock(clock),
        );
        let monitoring_listener: Arc<dyn EventListener> = monitoring.clone();
        events.add_listener(&monitoring_listener);

        #[cfg(feature = "metrics")]
        let prometheus = {
            let collector = Arc::new(PrometheusMetricsCollector::new(MetricsConfig::default())?);
            let listener: Arc<dyn EventListener> = collector.clone();
            events.add_listener(&listener);
            collector
        };

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                retry_policy: RetryPolicy::from_config(&config.job),
                permits: Arc::new(Semaphore::new(config.job.concurrency)),
                config,
                events,
                registry,
                queue,
                scheduler,
                scheduled: Arc::new(tokio::sync::Mutex::new(scheduled)),
                processor,
                monitoring,
                #[cfg(feature = "metrics")]
                prometheus,
                running: AtomicBool::new(false),
                shutdown,
                tasks: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }),
        })
    }

    /// Start the scheduler, processor and monitoring, then the run loop.
    /// Starting a running engine does nothing.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.config.job.enabled {
            return Err(JobmillError::Manager {
                message: "job processing is disabled in configuration".to_string(),
            });
        }
        if inner.running.swap(true, Ordering::SeqCst) {
            debug!("Job manager already running");
            return Ok(());
        }

        inner.shutdown.send_replace(false);
        if let Err(e) = inner.scheduler.start() {
            inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        inner.processor.start();
        inner.monitoring.start();

        let tasks = vec![
            tokio::spawn(run_loop(Arc::clone(inner), inner.shutdown.subscribe())),
            tokio::spawn(forward_scheduled(Arc::clone(inner), inner.shutdown.subscribe())),
            tokio::spawn(cleanup_loop(Arc::clone(inner), inner.shutdown.subscribe())),
        ];
        inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);

        info!(
            "Job manager started (concurrency {}, {} handlers)",
            inner.config.job.concurrency,
            inner.registry.len()
        );
        inner.events.publish(JobEvent::new(JobEventKind::ManagerStarted));
        Ok(())
    }

    /// Stop taking new work and wait, up to `shutdown_timeout`, for in-flight
    /// executions to finish. Executions are never interrupted.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            debug!("Job manager is not running");
            return Ok(());
        }

        info!("Stopping job manager");
        inner.shutdown.send_replace(true);
        inner.scheduler.stop();

        let tasks: Vec<JoinHandle<()>> = inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Job manager task ended abnormally: {}", e);
            }
        }

        let all = u32::try_from(inner.config.job.concurrency).unwrap_or(u32::MAX);
        match tokio::time::timeout(
            inner.config.job.shutdown_timeout,
            Arc::clone(&inner.permits).acquire_many_owned(all),
        )
        .await
        {
            Ok(Ok(permits)) => drop(permits),
            Ok(Err(e)) => warn!("Could not drain in-flight jobs: {}", e),
            Err(_) => warn!(
                "Shutdown timed out with {} jobs still in flight",
                self.in_flight()
            ),
        }

        inner.processor.stop();
        inner.monitoring.stop();
        inner.events.publish(JobEvent::new(JobEventKind::ManagerStopped));
        info!("Job manager stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Validate and enqueue a job. Returns the new execution id.
    pub fn add_job(&self, definition: JobDefinition) -> Result<ExecutionId> {
        self.inner.add_job(definition)
    }

    /// Register a recurring job. Each trigger enqueues a fresh job derived
    /// from `definition`.
    pub fn schedule_job(
        &self,
        definition: JobDefinition,
        cron_expression: &str,
        timezone: Option<&str>,
    ) -> Result<ScheduleId> {
        let definition = self.inner.validated(definition)?;
        self.inner
            .scheduler
            .schedule(definition, cron_expression, timezone)
    }

    pub fn unschedule_job(&self, schedule_id: &str) -> Result<()> {
        self.inner.scheduler.unschedule(schedule_id)
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.inner.scheduler
    }

    pub fn list_schedules(&self) -> Vec<JobSchedule> {
        self.inner.scheduler.list_schedules()
    }

    /// Cancel an execution that hasn't started. Returns `false` for running
    /// or unknown executions.
    pub fn cancel_job(&self, execution_id: ExecutionId) -> Result<bool> {
        self.inner.queue.cancel(execution_id)
    }

    /// Latest snapshot of an execution, `None` for unknown ids.
    pub fn get_job_status(&self, execution_id: ExecutionId) -> Result<Option<JobResult>> {
        self.inner.queue.get_job_status(execution_id)
    }

    pub fn get_metrics(&self) -> JobMetrics {
        self.inner.monitoring.metrics()
    }

    pub fn get_detailed_stats(&self) -> DetailedStats {
        self.inner.monitoring.detailed_stats()
    }

    pub fn get_queue_status(&self) -> Result<QueueStatus> {
        self.inner.queue.status()
    }

    pub fn processor_stats(&self) -> ProcessorStats {
        self.inner.processor.stats()
    }

    pub fn pause(&self) -> Result<()> {
        self.inner.queue.pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.inner.queue.resume()
    }

    /// Trim finished history to `max_job_history`. Returns how many results
    /// were evicted.
    pub fn cleanup(&self) -> Result<usize> {
        self.inner.queue.cleanup(self.inner.config.job.max_job_history)
    }

    pub fn reset_circuit_breaker(&self, job_name: &str) -> bool {
        self.inner.processor.reset_circuit_breaker(job_name)
    }

    /// Summarise engine health. Never fails: problems reading state become
    /// issues in the report.
    pub fn health_check(&self) -> HealthStatus {
        let inner = &self.inner;
        let health = &inner.config.health;
        let mut issues = Vec::new();

        let running = self.is_running();
        if !running {
            issues.push("Job manager is not running".to_string());
        }

        let queue_size = match inner.queue.size() {
            Ok(size) => {
                if size > health.max_queue_size {
                    issues.push(format!(
                        "Queue size {} exceeds limit of {}",
                        size, health.max_queue_size
                    ));
                }
                size
            }
            Err(e) => {
                issues.push(format!("Failed to read queue state: {}", e));
                0
            }
        };

        let metrics = inner.monitoring.metrics();
        if metrics.total_jobs > 0 && metrics.success_rate < health.min_success_rate {
            issues.push(format!(
                "Success rate {:.1}% is below {:.1}%",
                metrics.success_rate * 100.0,
                health.min_success_rate * 100.0
            ));
        }

        let in_flight = self.in_flight();
        let limit = inner.config.job.concurrency * health.max_processing_factor;
        if in_flight > limit {
            issues.push(format!(
                "{} jobs in flight exceeds limit of {}",
                in_flight, limit
            ));
        }

        HealthStatus {
            healthy: issues.is_empty(),
            issues,
            running,
            queue_size,
            success_rate: metrics.success_rate,
            in_flight,
            checked_at: Utc::now(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously in-flight executions seen so far.
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn register_handler<H: JobHandler + 'static>(&self, handler: H) -> Result<()> {
        self.inner.registry.register_handler(handler)
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.inner.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        self.inner.events.subscribe(filter)
    }

    pub fn monitoring(&self) -> &Arc<JobMonitoring> {
        &self.inner.monitoring
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Prometheus text exposition of the engine's metrics.
    #[cfg(feature = "metrics")]
    pub fn gather_metrics(&self) -> Result<String> {
        let status = self.inner.queue.status()?;
        self.inner.prometheus.update_queue_gauges(&status);
        self.inner.prometheus.gather_text()
    }
}

impl ManagerInner {
    fn validated(&self, definition: JobDefinition) -> Result<JobDefinition> {
        let definition = definition.normalized()?;
        if !self.registry.has_handler(&definition.name) {
            return Err(JobmillError::HandlerNotFound {
                name: definition.name,
            });
        }
        Ok(definition)
    }

    fn add_job(&self, definition: JobDefinition) -> Result<ExecutionId> {
        let definition = self.validated(definition)?;
        self.queue.add(definition)
    }

    /// Run one attempt and settle it with the queue.
    async fn dispatch(self: Arc<Self>, execution: JobExecution, _permit: OwnedSemaphorePermit) {
        let _in_flight = InFlight(&self.in_flight);
        let execution_id = execution.execution_id;
        let job_id = execution.job_id().to_string();

        // Claimed before job.started so a duplicate dispatch publishes nothing;
        // the holder of the claim settles the execution.
        let claim = match self.processor.claim(execution_id) {
            Ok(claim) => claim,
            Err(e) => {
                warn!("Skipping dispatch of {}: {}", execution_id, e);
                return;
            }
        };

        self.events
            .publish(JobEvent::for_execution(&execution, JobEventKind::Started));
        let started = Instant::now();
        let outcome = self.processor.process_claimed(&execution, claim).await;
        let exec_time_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => match self.queue.complete(execution_id, result, exec_time_ms) {
                Ok(_) => self
                    .monitoring
                    .record_job_completion(&job_id, true, exec_time_ms),
                Err(e) => error!("Failed to record completion of {}: {}", execution_id, e),
            },
            Err(job_error) => self.settle_failure(execution_id, &job_id, &job_error, exec_time_ms),
        }
    }

    fn settle_failure(
        &self,
        execution_id: ExecutionId,
        job_id: &str,
        job_error: &JobError,
        exec_time_ms: u64,
    ) {
        let outcome = match self.queue.fail(execution_id, job_error, exec_time_ms) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Failed to record failure of {}: {}", execution_id, e);
                return;
            }
        };

        if !outcome.will_retry {
            self.monitoring
                .record_job_completion(job_id, false, exec_time_ms);
            return;
        }

        let delay = self.retry_policy.delay_for(outcome.retry_count);
        if let Err(e) = self.queue.retry(execution_id, delay) {
            error!("Failed to schedule retry of {}: {}", execution_id, e);
        }
    }

    /// Block until a permit is free or shutdown is signalled.
    async fn acquire_permit(&self, shutdown: &mut watch::Receiver<bool>) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            _ = shutdown.changed() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        }
    }
}

/// Sleep for `duration` unless shutdown is signalled first. Returns `false`
/// on shutdown.
async fn idle(duration: std::time::Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

async fn run_loop(inner: Arc<ManagerInner>, mut shutdown: watch::Receiver<bool>) {
    debug!("Job manager run loop started");
    let poll_interval = inner.config.job.poll_interval;
    let error_backoff = inner.config.job.loop_error_backoff;

    while !*shutdown.borrow() {
        let Some(permit) = inner.acquire_permit(&mut shutdown).await else {
            break;
        };

        match inner.queue.next() {
            Ok(Some(execution)) => {
                let in_flight = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                inner.peak_in_flight.fetch_max(in_flight, Ordering::SeqCst);
                debug!(
                    "Dispatching execution {} ({} in flight)",
                    execution.execution_id, in_flight
                );
                tokio::spawn(Arc::clone(&inner).dispatch(execution, permit));
            }
            Ok(None) => {
                drop(permit);
                if !idle(poll_interval, &mut shutdown).await {
                    break;
                }
            }
            Err(e) => {
                drop(permit);
                error!("Run loop error, backing off for {:?}: {}", error_backoff, e);
                if !idle(error_backoff, &mut shutdown).await {
                    break;
                }
            }
        }
    }
    debug!("Job manager run loop exited");
}

async fn forward_scheduled(inner: Arc<ManagerInner>, mut shutdown: watch::Receiver<bool>) {
    let scheduled = Arc::clone(&inner.scheduled);
    let mut receiver = scheduled.lock().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            job = receiver.recv() => {
                let Some(job) = job else { break };
                match inner.add_job(job.definition) {
                    Ok(execution_id) => debug!(
                        "Enqueued scheduled run of {} as execution {}",
                        job.schedule_id, execution_id
                    ),
                    Err(e) => warn!(
                        "Dropping scheduled run of {}: {}",
                        job.schedule_id, e
                    ),
                }
            }
        }
    }
}

async fn cleanup_loop(inner: Arc<ManagerInner>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(inner.config.job.cleanup_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                match inner.queue.cleanup(inner.config.job.max_job_history) {
                    Ok(evicted) if evicted > 0 => info!("Cleaned up {} finished jobs", evicted),
                    Ok(_) => {}
                    Err(e) => warn!("Job history cleanup failed: {}", e),
                }
            }
        }
    }
}
