//! # Jobmill
//!
//! An in-process background job engine for Tokio applications.
//!
//! ## Features
//!
//! - **Priority queue**: numeric priorities (lower runs first), delayed and immediate jobs
//! - **Cron scheduling**: six-field cron expressions evaluated in any IANA timezone
//! - **Bounded concurrency**: a fixed number of executions in flight at once
//! - **Retries**: exponential back-off with an optional jitter, capped per job
//! - **Isolation**: per-job timeouts, caught panics and a circuit breaker per job name
//! - **Events**: typed lifecycle events over a broadcast channel and inline listeners
//! - **Monitoring**: success rate, percentiles, hourly buckets and threshold alerts
//! - **Metrics**: Prometheus export (enabled by default)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use jobmill::{EngineConfig, JobDefinition, JobError, JobManager, handler_fn};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let manager = JobManager::new(EngineConfig::default())?;
//!
//!     manager.register_handler(handler_fn("send_email", |payload, _ctx| async move {
//!         let to = payload["to"]
//!             .as_str()
//!             .ok_or_else(|| JobError::permanent("missing recipient"))?;
//!         println!("sending email to {}", to);
//!         Ok(json!({ "delivered": true }))
//!     }))?;
//!
//!     manager.start().await?;
//!
//!     let execution_id = manager.add_job(
//!         JobDefinition::new("send_email", json!({ "to": "ada@example.com" })).with_priority(1),
//!     )?;
//!     manager.schedule_job(
//!         JobDefinition::new("send_email", json!({ "to": "ops@example.com" })),
//!         "0 0 9 * * Mon-Fri",
//!         Some("Europe/Berlin"),
//!     )?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!     println!("{:?}", manager.get_job_status(execution_id)?);
//!
//!     manager.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Jobs and executions
//!
//! A [`JobDefinition`] describes work: a handler name, a JSON payload, a
//! priority and optional delay, retry and timeout overrides. Enqueuing one
//! creates a [`JobExecution`] with its own id, which tracks every attempt until
//! it completes or runs out of retries.
//!
//! ### Handlers
//!
//! Handlers implement [`JobHandler`] (or [`TypedJobHandler`] for a typed
//! payload) and are registered by name in the [`JobRegistry`]. Each attempt
//! receives a [`JobContext`] whose cancellation signal fires when the attempt
//! times out.
//!
//! ### Failures
//!
//! Handlers fail with a [`JobError`], whose kind decides whether the attempt is
//! retried and whether it counts against the job's circuit breaker.
//!
//! ## Feature Flags
//!
//! - `metrics` - Enable Prometheus metrics collection (default)

pub mod alerting;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod cron;
pub mod error;
pub mod events;
pub mod job;
pub mod manager;
pub mod monitoring;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod scheduler;

#[cfg(feature = "metrics")]
pub mod metrics;

pub use alerting::{Alert, AlertManager, AlertSeverity, AlertType};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use clock::{Clock, MockClock, SharedClock, SystemClock};
pub use config::{EngineConfig, HealthConfig, JobConfig, LoggingConfig, MonitoringConfig};
pub use cron::{CronError, CronSchedule};
pub use error::{JobError, JobErrorKind, JobmillError};
pub use events::{EventBus, EventConfig, EventFilter, EventListener, EventSubscription, JobEvent, JobEventKind};
pub use job::{ExecutionId, JobDefinition, JobExecution, JobResult, JobStatus, JobType};
pub use manager::{HealthStatus, JobManager};
pub use monitoring::{DetailedStats, HourlyStats, JobMetrics, JobMonitoring};
pub use processor::{JobProcessor, ProcessingClaim, ProcessorStats};
pub use queue::{JobQueue, QueueStatus};
pub use registry::{
    CancelHandle, FnJobHandler, JobContext, JobHandler, JobRegistry, Typed, TypedJobHandler,
    handler_fn,
};
pub use retry::{JitterType, RetryPolicy};
pub use scheduler::{JobSchedule, JobScheduler, ScheduleId, ScheduleUpdate, ScheduledJob};

#[cfg(feature = "metrics")]
pub use metrics::{MetricsConfig, PrometheusMetricsCollector};

/// Convenient type alias for Results with [`JobmillError`] as the error type.
pub type Result<T> = std::result::Result<T, JobmillError>;
