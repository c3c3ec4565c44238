use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl AlertSeverity {
    /// Critical once the observed value reaches twice the threshold.
    pub fn for_ratio(current: f64, threshold: f64) -> Self {
        if threshold > 0.0 && current >= threshold * 2.0 {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Warning => write!(f, "Warning"),
            AlertSeverity::Critical => write!(f, "Critical"),
        }
    }
}

/// Conditions monitoring can alert on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HighFailureRate,
    QueueSizeExceeded,
    SlowExecution,
    StuckJobs,
    QueueBackup,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertType::HighFailureRate => write!(f, "High Failure Rate"),
            AlertType::QueueSizeExceeded => write!(f, "Queue Size Exceeded"),
            AlertType::SlowExecution => write!(f, "Slow Execution"),
            AlertType::StuckJobs => write!(f, "Stuck Jobs"),
            AlertType::QueueBackup => write!(f, "Queue Backup"),
        }
    }
}

/// An alert that has been triggered
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    /// Observed value that crossed the threshold
    pub current_value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    /// Snapshot of the metrics the check was based on
    pub metrics: HashMap<String, f64>,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        message: impl Into<String>,
        current_value: f64,
        threshold: f64,
    ) -> Self {
        Self {
            alert_type,
            severity: AlertSeverity::for_ratio(current_value, threshold),
            message: message.into(),
            current_value,
            threshold,
            timestamp: Utc::now(),
            metrics: HashMap::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn high_failure_rate(failure_rate: f64, threshold: f64, total_jobs: u64) -> Self {
        Alert::new(
            AlertType::HighFailureRate,
            format!(
                "High failure rate detected: {:.2}% (threshold: {:.2}%)",
                failure_rate * 100.0,
                threshold * 100.0
            ),
            failure_rate,
            threshold,
        )
        .with_metric("failure_rate", failure_rate)
        .with_metric("total_jobs", total_jobs as f64)
    }

    pub fn queue_size_exceeded(queue_size: usize, threshold: usize) -> Self {
        Alert::new(
            AlertType::QueueSizeExceeded,
            format!(
                "Queue size exceeded: {} jobs (threshold: {})",
                queue_size, threshold
            ),
            queue_size as f64,
            threshold as f64,
        )
        .with_metric("queue_size", queue_size as f64)
    }

    pub fn slow_execution(execution_time_ms: u64, threshold_ms: u64) -> Self {
        Alert::new(
            AlertType::SlowExecution,
            format!(
                "Slow job execution detected: {}ms (threshold: {}ms)",
                execution_time_ms, threshold_ms
            ),
            execution_time_ms as f64,
            threshold_ms as f64,
        )
        .with_metric("execution_time_ms", execution_time_ms as f64)
    }

    pub fn stuck_jobs(running_jobs: u64, average_time_ms: f64, threshold_ms: u64) -> Self {
        Alert::new(
            AlertType::StuckJobs,
            format!(
                "Possible stuck jobs: {} running with {:.0}ms average execution time (threshold: {}ms)",
                running_jobs, average_time_ms, threshold_ms
            ),
            average_time_ms,
            threshold_ms as f64,
        )
        .with_metric("running_jobs", running_jobs as f64)
        .with_metric("average_execution_time_ms", average_time_ms)
    }

    pub fn queue_backup(queued: usize, running: u64, factor: u64) -> Self {
        let limit = running.max(1) * factor;
        Alert::new(
            AlertType::QueueBackup,
            format!(
                "Queue backup detected: {} queued vs {} running (factor: {})",
                queued, running, factor
            ),
            queued as f64,
            limit as f64,
        )
        .with_metric("queued_jobs", queued as f64)
        .with_metric("running_jobs", running as f64)
    }
}

/// Deduplicates alerts per type within a cooldown period and keeps a short
/// history of the ones that went out.
#[derive(Debug)]
pub struct AlertManager {
    cooldown: Duration,
    history_limit: usize,
    state: Mutex<AlertState>,
}

#[derive(Debug, Default)]
struct AlertState {
    last_alerts: HashMap<AlertType, DateTime<Utc>>,
    recent: VecDeque<Alert>,
}

impl AlertManager {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            history_limit: 100,
            state: Mutex::new(AlertState::default()),
        }
    }

    /// Pass the alert through unless one of the same type went out within the
    /// cooldown period.
    pub fn raise(&self, alert: Alert) -> Option<Alert> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(last) = state.last_alerts.get(&alert.alert_type) {
            let elapsed = (alert.timestamp - *last).to_std().unwrap_or(Duration::ZERO);
            if elapsed < self.cooldown {
                tracing::trace!("Suppressing {} alert during cooldown", alert.alert_type);
                return None;
            }
        }

        state.last_alerts.insert(alert.alert_type, alert.timestamp);
        state.recent.push_back(alert.clone());
        while state.recent.len() > self.history_limit {
            state.recent.pop_front();
        }

        tracing::warn!(
            severity = %alert.severity,
            alert_type = %alert.alert_type,
            "{}",
            alert.message
        );
        Some(alert)
    }

    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_alerts.clear();
        state.recent.clear();
    }
}
