//! Job definitions, live executions and result snapshots.
//!
//! A [`JobDefinition`] describes work a caller wants done. When it is enqueued
//! the queue wraps it in a [`JobExecution`], which carries the status and retry
//! state of one attempt-series. Callers observe progress through immutable
//! [`JobResult`] snapshots.

use crate::{JobmillError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Identifier the queue assigns to each execution, distinct from the job id.
pub type ExecutionId = Uuid;

/// Priority given to jobs that don't set one. Lower values are served first.
pub const DEFAULT_PRIORITY: i32 = 5;

/// How a job entered the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Jumps the line: inserted at the front of the pending list.
    Immediate,
    /// An instance materialized by the scheduler from a cron template.
    Scheduled,
    /// A template meant to be registered with the scheduler.
    Recurring,
    /// Ordinary priority-ordered work.
    #[default]
    #[serde(rename = "default")]
    Standard,
}

/// Lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Caller-supplied description of work.
///
/// # Examples
///
/// ```rust
/// use jobmill::job::{JobDefinition, JobType};
/// use serde_json::json;
/// use std::time::Duration;
///
/// let job = JobDefinition::new("send_email", json!({"to": "ops@example.com"}))
///     .with_priority(1)
///     .with_max_retries(5)
///     .with_timeout(Duration::from_secs(10))
///     .with_tag("notifications");
///
/// assert_eq!(job.job_type, JobType::Standard);
/// assert_eq!(job.priority, 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDefinition {
    pub id: String,
    /// Job type name; selects the handler.
    pub name: String,
    pub job_type: JobType,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub priority: i32,
    pub delay: Option<Duration>,
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    /// Overrides the engine-wide retry budget when set.
    pub max_retries: Option<u32>,
    /// Overrides the engine-wide timeout when set.
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            job_type: JobType::Standard,
            payload,
            priority: DEFAULT_PRIORITY,
            delay: None,
            cron_expression: None,
            timezone: None,
            max_retries: None,
            timeout: None,
            tags: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_type(mut self, job_type: JobType) -> Self {
        self.job_type = job_type;
        self
    }

    /// Mark the job as immediate so it is served before everything pending.
    pub fn immediate(self) -> Self {
        self.with_type(JobType::Immediate)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Attach a cron expression and timezone, turning this into a recurring template.
    pub fn with_cron(mut self, expression: impl Into<String>, timezone: impl Into<String>) -> Self {
        self.cron_expression = Some(expression.into());
        self.timezone = Some(timezone.into());
        self.job_type = JobType::Recurring;
        self
    }

    /// Check required fields and fill defaults.
    ///
    /// The id and name must be non-blank. A `null` payload becomes an empty
    /// object.
    pub fn normalized(mut self) -> Result<Self> {
        if self.id.trim().is_empty() {
            return Err(JobmillError::InvalidJob {
                message: "job id is required".to_string(),
            });
        }
        if self.name.trim().is_empty() {
            return Err(JobmillError::InvalidJob {
                message: format!("job name is required (job id {})", self.id),
            });
        }
        if self.payload.is_null() {
            self.payload = serde_json::Value::Object(serde_json::Map::new());
        }
        Ok(self)
    }
}

/// The queue's live record of one attempt-series of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub execution_id: ExecutionId,
    pub definition: JobDefinition,
    pub status: JobStatus,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Effective retry budget: the job's own override or the engine default.
    pub max_retries: u32,
    /// Not eligible before this instant because of an initial delay.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Not eligible before this instant because of a retry back-off.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl JobExecution {
    pub fn new(definition: JobDefinition, default_max_retries: u32, now: DateTime<Utc>) -> Self {
        let scheduled_for = definition
            .delay
            .and_then(|delay| chrono::Duration::from_std(delay).ok())
            .map(|delay| now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC));
        let max_retries = definition.max_retries.unwrap_or(default_max_retries);

        Self {
            execution_id: Uuid::new_v4(),
            definition,
            status: JobStatus::Pending,
            enqueued_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            scheduled_for,
            next_retry_at: None,
            result: None,
            error: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.definition.id
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn priority(&self) -> i32 {
        self.definition.priority
    }

    /// Earliest instant at which the execution may be dequeued.
    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        match (self.scheduled_for, self.next_retry_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.ready_at().is_none_or(|at| at <= now)
    }

    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Immutable snapshot of an execution handed to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub execution_id: ExecutionId,
    pub job_id: String,
    pub name: String,
    pub success: bool,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: u64,
    pub retry_count: u32,
}

impl JobResult {
    /// Snapshot of an execution that has not reached a terminal state.
    pub fn from_execution(execution: &JobExecution) -> Self {
        Self {
            execution_id: execution.execution_id,
            job_id: execution.definition.id.clone(),
            name: execution.definition.name.clone(),
            success: false,
            status: execution.status,
            result: execution.result.clone(),
            error: execution.error.clone(),
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            execution_time_ms: 0,
            retry_count: execution.retry_count,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_definition_defaults() {
        let job = JobDefinition::new("report", json!({"month": 3}));
        assert!(!job.id.is_empty());
        assert_eq!(job.name, "report");
        assert_eq!(job.job_type, JobType::Standard);
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert!(job.max_retries.is_none());
        assert!(job.tags.is_empty());
    }

    #[test]
    fn test_with_cron_marks_recurring() {
        let job = JobDefinition::new("digest", json!({})).with_cron("0 0 9 * * *", "Europe/Berlin");
        assert_eq!(job.job_type, JobType::Recurring);
        assert_eq!(job.cron_expression.as_deref(), Some("0 0 9 * * *"));
        assert_eq!(job.timezone.as_deref(), Some("Europe/Berlin"));
    }

    #[test]
    fn test_normalized_rejects_blank_fields() {
        let blank_id = JobDefinition::new("report", json!({})).with_id("  ");
        assert!(matches!(
            blank_id.normalized(),
            Err(JobmillError::InvalidJob { .. })
        ));

        let blank_name = JobDefinition::new("", json!({}));
        assert!(blank_name.normalized().is_err());
    }

    #[test]
    fn test_normalized_defaults_payload() {
        let job = JobDefinition::new("report", serde_json::Value::Null)
            .normalized()
            .unwrap();
        assert_eq!(job.payload, json!({}));
    }

    #[test]
    fn test_execution_readiness() {
        let now = Utc::now();
        let job = JobDefinition::new("report", json!({})).with_delay(Duration::from_secs(60));
        let mut execution = JobExecution::new(job, 3, now);

        assert!(!execution.is_ready(now));
        assert!(execution.is_ready(now + chrono::Duration::seconds(60)));

        execution.next_retry_at = Some(now + chrono::Duration::seconds(120));
        assert!(!execution.is_ready(now + chrono::Duration::seconds(90)));
        assert!(execution.is_ready(now + chrono::Duration::seconds(120)));
    }

    #[test]
    fn test_execution_retry_budget() {
        let now = Utc::now();
        let overridden = JobExecution::new(
            JobDefinition::new("a", json!({})).with_max_retries(1),
            3,
            now,
        );
        assert_eq!(overridden.max_retries, 1);

        let mut defaulted = JobExecution::new(JobDefinition::new("a", json!({})), 3, now);
        assert_eq!(defaulted.max_retries, 3);
        defaulted.retry_count = 3;
        assert!(!defaulted.has_retries_left());
    }

    #[test]
    fn test_job_type_serialization() {
        assert_eq!(
            serde_json::to_string(&JobType::Standard).unwrap(),
            "\"default\""
        );
        assert_eq!(
            serde_json::to_string(&JobType::Immediate).unwrap(),
            "\"immediate\""
        );
    }
}
