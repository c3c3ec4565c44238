//! Prometheus export of job lifecycle events.
//!
//! [`PrometheusMetricsCollector`] listens on the engine's event bus and keeps
//! counters and histograms in its own [`Registry`]. Render them with
//! [`gather_text`](PrometheusMetricsCollector::gather_text) from whatever HTTP
//! endpoint the host application exposes.

use crate::events::{EventListener, JobEvent, JobEventKind};
use crate::queue::QueueStatus;
use crate::{JobmillError, Result};
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

/// Configuration for metrics collection
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Prefix for every metric name
    pub namespace: String,
    /// Histogram buckets for job duration, in seconds
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: "jobmill".to_string(),
            duration_buckets: vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
        }
    }
}

impl MetricsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

pub struct PrometheusMetricsCollector {
    registry: Registry,
    jobs_total: CounterVec,
    jobs_failed_total: CounterVec,
    jobs_duration: HistogramVec,
    queue_jobs: GaugeVec,
    alerts_total: CounterVec,
}

impl std::fmt::Debug for PrometheusMetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetricsCollector").finish_non_exhaustive()
    }
}

fn metrics_error(what: &str, e: prometheus::Error) -> JobmillError {
    JobmillError::Metrics {
        message: format!("{}: {}", what, e),
    }
}

impl PrometheusMetricsCollector {
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let registry = Registry::new();
        let ns = &config.namespace;

        let jobs_total = CounterVec::new(
            Opts::new(format!("{}_jobs_total", ns), "Job lifecycle events by job name and event"),
            &["job", "event"],
        )
        .map_err(|e| metrics_error("Failed to create jobs_total metric", e))?;

        let jobs_failed_total = CounterVec::new(
            Opts::new(format!("{}_jobs_failed_total", ns), "Failed job attempts by error kind"),
            &["job", "error_kind", "will_retry"],
        )
        .map_err(|e| metrics_error("Failed to create jobs_failed_total metric", e))?;

        let jobs_duration = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_job_duration_seconds", ns),
                "Job attempt duration in seconds",
            )
            .buckets(config.duration_buckets.clone()),
            &["job", "outcome"],
        )
        .map_err(|e| metrics_error("Failed to create job_duration metric", e))?;

        let queue_jobs = GaugeVec::new(
            Opts::new(format!("{}_queue_jobs", ns), "Executions held by the queue, by state"),
            &["state"],
        )
        .map_err(|e| metrics_error("Failed to create queue_jobs metric", e))?;

        let alerts_total = CounterVec::new(
            Opts::new(format!("{}_alerts_total", ns), "Alerts raised by type and severity"),
            &["type", "severity"],
        )
        .map_err(|e| metrics_error("Failed to create alerts_total metric", e))?;

        registry
            .register(Box::new(jobs_total.clone()))
            .map_err(|e| metrics_error("Failed to register jobs_total", e))?;
        registry
            .register(Box::new(jobs_failed_total.clone()))
            .map_err(|e| metrics_error("Failed to register jobs_failed_total", e))?;
        registry
            .register(Box::new(jobs_duration.clone()))
            .map_err(|e| metrics_error("Failed to register job_duration", e))?;
        registry
            .register(Box::new(queue_jobs.clone()))
            .map_err(|e| metrics_error("Failed to register queue_jobs", e))?;
        registry
            .register(Box::new(alerts_total.clone()))
            .map_err(|e| metrics_error("Failed to register alerts_total", e))?;

        Ok(Self {
            registry,
            jobs_total,
            jobs_failed_total,
            jobs_duration,
            queue_jobs,
            alerts_total,
        })
    }

    pub fn record_event(&self, event: &JobEvent) {
        let job = event.job_name.as_deref().unwrap_or("");

        match &event.kind {
            JobEventKind::Completed { exec_time_ms, .. } => {
                self.jobs_duration
                    .with_label_values(&[job, "completed"])
                    .observe(*exec_time_ms as f64 / 1000.0);
            }
            JobEventKind::Failed {
                kind,
                exec_time_ms,
                will_retry,
                ..
            } => {
                let kind = kind.to_string();
                let will_retry = if *will_retry { "true" } else { "false" };
                self.jobs_failed_total
                    .with_label_values(&[job, kind.as_str(), will_retry])
                    .inc();
                self.jobs_duration
                    .with_label_values(&[job, "failed"])
                    .observe(*exec_time_ms as f64 / 1000.0);
            }
            JobEventKind::Alert(alert) => {
                let alert_type = alert.alert_type.to_string();
                let severity = alert.severity.to_string();
                self.alerts_total
                    .with_label_values(&[alert_type.as_str(), severity.as_str()])
                    .inc();
                return;
            }
            JobEventKind::QueuePaused
            | JobEventKind::QueueResumed
            | JobEventKind::ManagerStarted
            | JobEventKind::ManagerStopped => return,
            _ => {}
        }

        self.jobs_total.with_label_values(&[job, event.name()]).inc();
    }

    pub fn update_queue_gauges(&self, status: &QueueStatus) {
        for (state, count) in [
            ("pending", status.pending),
            ("awaiting_retry", status.awaiting_retry),
            ("processing", status.processing),
            ("completed", status.completed),
            ("failed", status.failed),
        ] {
            self.queue_jobs.with_label_values(&[state]).set(count as f64);
        }
    }

    /// Metrics in the Prometheus text exposition format.
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| metrics_error("Failed to encode metrics", e))?;

        String::from_utf8(buffer).map_err(|e| JobmillError::Metrics {
            message: format!("Failed to convert metrics to string: {}", e),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl EventListener for PrometheusMetricsCollector {
    fn on_event(&self, event: &JobEvent) {
        self.record_event(event);
    }
}
