//! Operational metrics derived from job outcomes and the event stream.
//!
//! [`JobMonitoring`] is registered as an [`EventListener`] on the engine's
//! [`EventBus`]. It keeps a bounded history of events and tracks how many
//! executions are running from `job.started` and terminal events. The manager
//! reports final outcomes through [`JobMonitoring::record_job_completion`],
//! which feeds the totals, the execution time window and the threshold
//! alerts.

use crate::alerting::{Alert, AlertManager};
use crate::clock::{SharedClock, SystemClock};
use crate::config::MonitoringConfig;
use crate::events::{EventBus, EventListener, JobEvent, JobEventKind};
use crate::queue::JobQueue;
use chrono::{DateTime, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Snapshot of the headline counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub running_jobs: u64,
    /// `completed_jobs / total_jobs`, or 1.0 before anything finished
    pub success_rate: f64,
    pub average_execution_time_ms: f64,
    pub last_updated: DateTime<Utc>,
}

/// Completed and failed counts for one hour of the trailing day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HourlyStats {
    pub hour: DateTime<Utc>,
    pub completed: u64,
    pub failed: u64,
    pub average_execution_time_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetailedStats {
    pub metrics: JobMetrics,
    pub p50_execution_time_ms: u64,
    pub p95_execution_time_ms: u64,
    pub p99_execution_time_ms: u64,
    /// Oldest hour first
    pub hourly: Vec<HourlyStats>,
    pub recent_alerts: Vec<Alert>,
}

#[derive(Debug, Clone, Copy)]
struct ExecutionSample {
    at: DateTime<Utc>,
    success: bool,
    execution_time_ms: u64,
}

#[derive(Debug, Default)]
struct MonitoringState {
    total_jobs: u64,
    completed_jobs: u64,
    failed_jobs: u64,
    running_jobs: u64,
    samples: VecDeque<ExecutionSample>,
    events: VecDeque<JobEvent>,
}

impl MonitoringState {
    fn success_rate(&self) -> f64 {
        if self.total_jobs == 0 {
            1.0
        } else {
            self.completed_jobs as f64 / self.total_jobs as f64
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.total_jobs == 0 {
            0.0
        } else {
            self.failed_jobs as f64 / self.total_jobs as f64
        }
    }

    fn average_execution_time_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.samples.iter().map(|s| s.execution_time_ms).sum();
        sum as f64 / self.samples.len() as f64
    }

    fn metrics(&self, now: DateTime<Utc>) -> JobMetrics {
        JobMetrics {
            total_jobs: self.total_jobs,
            completed_jobs: self.completed_jobs,
            failed_jobs: self.failed_jobs,
            running_jobs: self.running_jobs,
            success_rate: self.success_rate(),
            average_execution_time_ms: self.average_execution_time_ms(),
            last_updated: now,
        }
    }
}

pub struct JobMonitoring {
    config: MonitoringConfig,
    state: Mutex<MonitoringState>,
    alerts: AlertManager,
    events: EventBus,
    queue: Option<Arc<JobQueue>>,
    clock: SharedClock,
    collector: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for JobMonitoring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobMonitoring")
            .field("config", &self.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl JobMonitoring {
    pub fn new(config: MonitoringConfig, events: EventBus) -> Self {
        Self {
            alerts: AlertManager::new(config.alert_cooldown),
            config,
            state: Mutex::new(MonitoringState::default()),
            events,
            queue: None,
            clock: Arc::new(SystemClock),
            collector: Mutex::new(None),
        }
    }

    /// Watch this queue for size and backup alerts.
    pub fn with_queue(mut self, queue: Arc<JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn state(&self) -> MutexGuard<'_, MonitoringState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the final outcome of an execution, then check the alert
    /// thresholds.
    pub fn record_job_completion(&self, job_id: &str, success: bool, execution_time_ms: u64) {
        let now = self.clock.now();
        let (failure_rate, total_jobs) = {
            let mut state = self.state();
            state.total_jobs += 1;
            if success {
                state.completed_jobs += 1;
            } else {
                state.failed_jobs += 1;
            }
            state.samples.push_back(ExecutionSample {
                at: now,
                success,
                execution_time_ms,
            });
            while state.samples.len() > self.config.execution_window {
                state.samples.pop_front();
            }
            (state.failure_rate(), state.total_jobs)
        };
        debug!(
            "Recorded {} for job {} in {}ms",
            if success { "completion" } else { "failure" },
            job_id,
            execution_time_ms
        );

        let mut alerts = Vec::new();
        if total_jobs >= self.config.min_samples && failure_rate > self.config.failure_rate_threshold {
            alerts.push(Alert::high_failure_rate(
                failure_rate,
                self.config.failure_rate_threshold,
                total_jobs,
            ));
        }
        if let Some(size) = self.queue_size() {
            if size > self.config.queue_size_threshold {
                alerts.push(Alert::queue_size_exceeded(size, self.config.queue_size_threshold));
            }
        }
        let threshold_ms = self.config.execution_time_threshold.as_millis() as u64;
        if execution_time_ms > threshold_ms {
            alerts.push(Alert::slow_execution(execution_time_ms, threshold_ms));
        }
        self.raise_all(alerts);
    }

    /// Append to the event history and track running executions.
    pub fn record_event(&self, event: &JobEvent) {
        let mut state = self.state();
        match &event.kind {
            JobEventKind::Started => state.running_jobs += 1,
            kind if kind.is_terminal() => {
                state.running_jobs = state.running_jobs.saturating_sub(1);
            }
            _ => {}
        }
        state.events.push_back(event.clone());
        while state.events.len() > self.config.event_history {
            state.events.pop_front();
        }
    }

    pub fn metrics(&self) -> JobMetrics {
        self.state().metrics(self.clock.now())
    }

    /// Events kept in the history ring, oldest first.
    pub fn recent_events(&self) -> Vec<JobEvent> {
        self.state().events.iter().cloned().collect()
    }

    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.alerts.recent_alerts()
    }

    /// Percentiles over the execution window and hourly buckets for the
    /// trailing 24 hours.
    pub fn detailed_stats(&self) -> DetailedStats {
        let now = self.clock.now();
        let state = self.state();

        let mut times: Vec<u64> = state.samples.iter().map(|s| s.execution_time_ms).collect();
        times.sort_unstable();

        let cutoff = now - chrono::Duration::hours(24);
        let mut buckets: BTreeMap<DateTime<Utc>, (u64, u64, u64)> = BTreeMap::new();
        for sample in state.samples.iter().filter(|s| s.at > cutoff) {
            let hour = sample
                .at
                .duration_trunc(chrono::Duration::hours(1))
                .unwrap_or(sample.at);
            let bucket = buckets.entry(hour).or_default();
            if sample.success {
                bucket.0 += 1;
            } else {
                bucket.1 += 1;
            }
            bucket.2 += sample.execution_time_ms;
        }

        let hourly = buckets
            .into_iter()
            .map(|(hour, (completed, failed, total_ms))| HourlyStats {
                hour,
                completed,
                failed,
                average_execution_time_ms: total_ms as f64 / (completed + failed) as f64,
            })
            .collect();

        DetailedStats {
            metrics: state.metrics(now),
            p50_execution_time_ms: percentile(&times, 50.0),
            p95_execution_time_ms: percentile(&times, 95.0),
            p99_execution_time_ms: percentile(&times, 99.0),
            hourly,
            recent_alerts: self.alerts.recent_alerts(),
        }
    }

    /// Flat metric map for exporters. Also checks for stuck jobs and queue
    /// backup.
    pub fn collect_metrics(&self) -> HashMap<String, f64> {
        let metrics = self.metrics();
        let queued = self.queue_size();

        let mut map = HashMap::new();
        map.insert("total_jobs".to_string(), metrics.total_jobs as f64);
        map.insert("completed_jobs".to_string(), metrics.completed_jobs as f64);
        map.insert("failed_jobs".to_string(), metrics.failed_jobs as f64);
        map.insert("running_jobs".to_string(), metrics.running_jobs as f64);
        map.insert("success_rate".to_string(), metrics.success_rate);
        map.insert(
            "average_execution_time_ms".to_string(),
            metrics.average_execution_time_ms,
        );
        if let Some(queued) = queued {
            map.insert("queue_size".to_string(), queued as f64);
        }

        let mut alerts = Vec::new();
        let stuck_ms = self.config.stuck_job_threshold.as_millis() as u64;
        if metrics.running_jobs > 0 && metrics.average_execution_time_ms > stuck_ms as f64 {
            alerts.push(Alert::stuck_jobs(
                metrics.running_jobs,
                metrics.average_execution_time_ms,
                stuck_ms,
            ));
        }
        if let Some(queued) = queued {
            let limit = metrics.running_jobs.max(1) * self.config.queue_backup_factor;
            if queued as u64 > limit {
                alerts.push(Alert::queue_backup(
                    queued,
                    metrics.running_jobs,
                    self.config.queue_backup_factor,
                ));
            }
        }
        self.raise_all(alerts);

        map
    }

    /// Run [`collect_metrics`](Self::collect_metrics) every
    /// `collection_interval` until [`stop`](Self::stop).
    pub fn start(self: &Arc<Self>) {
        let mut collector = self.collector.lock().unwrap_or_else(PoisonError::into_inner);
        if collector.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let monitoring = Arc::clone(self);
        let period = self.config.collection_interval;
        *collector = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let metrics = monitoring.collect_metrics();
                debug!(?metrics, "Collected job metrics");
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self
            .collector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    fn queue_size(&self) -> Option<usize> {
        let queue = self.queue.as_ref()?;
        match queue.size() {
            Ok(size) => Some(size),
            Err(e) => {
                warn!("Monitoring could not read queue size: {}", e);
                None
            }
        }
    }

    fn raise_all(&self, alerts: Vec<Alert>) {
        for alert in alerts {
            if let Some(alert) = self.alerts.raise(alert) {
                self.events
                    .publish(JobEvent::new(JobEventKind::Alert(alert)).at(self.clock.now()));
            }
        }
    }
}

impl EventListener for JobMonitoring {
    fn on_event(&self, event: &JobEvent) {
        self.record_event(event);
    }
}

impl Drop for JobMonitoring {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Nearest-rank percentile of an ascending slice.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
