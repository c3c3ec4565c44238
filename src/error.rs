use crate::cron::CronError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobmillError {
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Schedule not found: {id}")]
    ScheduleNotFound { id: String },

    #[error("Invalid job definition: {message}")]
    InvalidJob { message: String },

    #[error("No handler registered for job '{name}'")]
    HandlerNotFound { name: String },

    #[error("Handler registration error: {message}")]
    Registration { message: String },

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("Scheduler error: {message}")]
    Scheduler { message: String },

    #[error("Manager error: {message}")]
    Manager { message: String },

    #[error("Cron error: {0}")]
    Cron(#[from] CronError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {message}")]
    Metrics { message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for JobmillError {
    fn from(err: toml::de::Error) -> Self {
        JobmillError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for JobmillError {
    fn from(err: toml::ser::Error) -> Self {
        JobmillError::Config(format!("TOML serialization error: {}", err))
    }
}

/// Classification of a failed execution attempt.
///
/// The kind decides whether the engine retries the execution and whether the
/// failure counts against a circuit breaker. Handlers pick the kind explicitly
/// when they construct a [`JobError`]; nothing is inferred from message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// No handler is registered for the job name.
    Configuration,
    /// The handler rejected the payload.
    Validation,
    /// The execution exceeded its time budget.
    Timeout,
    /// The circuit breaker for the job name rejected the call.
    CircuitOpen,
    /// A failure the handler reported as temporary (deadlocks, lock timeouts, ...).
    Transient,
    /// A failure the handler reported as permanent.
    Permanent,
    /// Any other handler failure, including panics.
    Handler,
    /// The execution was cancelled through its context.
    Cancelled,
    /// The processor stopped accepting work.
    ShuttingDown,
    /// The execution is already being processed.
    AlreadyProcessing,
}

impl JobErrorKind {
    /// Whether an execution failing with this kind may be attempted again.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            JobErrorKind::Timeout
                | JobErrorKind::CircuitOpen
                | JobErrorKind::Transient
                | JobErrorKind::Handler
                | JobErrorKind::ShuttingDown
        )
    }
}

impl std::fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobErrorKind::Configuration => "configuration",
            JobErrorKind::Validation => "validation",
            JobErrorKind::Timeout => "timeout",
            JobErrorKind::CircuitOpen => "circuit_open",
            JobErrorKind::Transient => "transient",
            JobErrorKind::Permanent => "permanent",
            JobErrorKind::Handler => "handler",
            JobErrorKind::Cancelled => "cancelled",
            JobErrorKind::ShuttingDown => "shutting_down",
            JobErrorKind::AlreadyProcessing => "already_processing",
        };
        write!(f, "{}", name)
    }
}

/// Failure of a single execution attempt, as seen by the processor and queue.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobError {
    #[error("No handler registered for job type '{name}'")]
    Configuration { name: String },

    #[error("Payload validation failed for job type '{name}': {message}")]
    Validation { name: String, message: String },

    #[error("Job timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Circuit breaker is open for '{key}'")]
    CircuitOpen { key: String },

    #[error("Transient failure: {message}")]
    Transient { message: String },

    #[error("Permanent failure: {message}")]
    Permanent { message: String },

    #[error("Handler error: {message}")]
    Handler { message: String },

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Job processor is shutting down")]
    ShuttingDown,

    #[error("Execution {execution_id} is already being processed")]
    AlreadyProcessing { execution_id: String },
}

impl JobError {
    pub fn transient(message: impl Into<String>) -> Self {
        JobError::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        JobError::Permanent {
            message: message.into(),
        }
    }

    pub fn handler(message: impl Into<String>) -> Self {
        JobError::Handler {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> JobErrorKind {
        match self {
            JobError::Configuration { .. } => JobErrorKind::Configuration,
            JobError::Validation { .. } => JobErrorKind::Validation,
            JobError::Timeout { .. } => JobErrorKind::Timeout,
            JobError::CircuitOpen { .. } => JobErrorKind::CircuitOpen,
            JobError::Transient { .. } => JobErrorKind::Transient,
            JobError::Permanent { .. } => JobErrorKind::Permanent,
            JobError::Handler { .. } => JobErrorKind::Handler,
            JobError::Cancelled => JobErrorKind::Cancelled,
            JobError::ShuttingDown => JobErrorKind::ShuttingDown,
            JobError::AlreadyProcessing { .. } => JobErrorKind::AlreadyProcessing,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::permanent(format!("payload serialization failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let queue_error = JobmillError::Queue {
            message: "Test queue error".to_string(),
        };
        assert_eq!(queue_error.to_string(), "Queue error: Test queue error");

        let job_not_found = JobmillError::JobNotFound {
            id: "test-id".to_string(),
        };
        assert_eq!(job_not_found.to_string(), "Job not found: test-id");

        let missing = JobmillError::HandlerNotFound {
            name: "send_email".to_string(),
        };
        assert_eq!(
            missing.to_string(),
            "No handler registered for job 'send_email'"
        );
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json");
        assert!(json_error.is_err());

        let error: JobmillError = json_error.unwrap_err().into();
        assert!(matches!(error, JobmillError::Serialization(_)));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(JobError::Timeout { timeout_ms: 50 }.is_retryable());
        assert!(JobError::transient("deadlock detected").is_retryable());
        assert!(JobError::handler("boom").is_retryable());
        assert!(
            JobError::CircuitOpen {
                key: "email".to_string()
            }
            .is_retryable()
        );

        assert!(!JobError::permanent("bad recipient").is_retryable());
        assert!(
            !JobError::Configuration {
                name: "email".to_string()
            }
            .is_retryable()
        );
        assert!(
            !JobError::Validation {
                name: "email".to_string(),
                message: "missing to".to_string()
            }
            .is_retryable()
        );
        assert!(!JobError::Cancelled.is_retryable());
    }

    #[test]
    fn test_message_text_does_not_affect_kind() {
        // A permanent failure mentioning "deadlock" stays permanent.
        let error = JobError::permanent("deadlock in upstream report");
        assert_eq!(error.kind(), JobErrorKind::Permanent);
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&JobErrorKind::CircuitOpen).unwrap();
        assert_eq!(json, "\"circuit_open\"");
        assert_eq!(JobErrorKind::Timeout.to_string(), "timeout");
    }
}
