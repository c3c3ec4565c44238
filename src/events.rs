//! Typed lifecycle events and the bus that delivers them.
//!
//! Every state transition in the engine is published exactly once as a
//! [`JobEvent`]. The component that performs the transition owns the event:
//!
//! - the queue publishes `job.created`, `job.completed`, `job.failed`,
//!   `job.retrying`, `job.cancelled`, `queue.paused` and `queue.resumed`
//! - the manager publishes `job.started`, `manager.started` and `manager.stopped`
//! - the scheduler publishes `job.scheduled`
//! - monitoring publishes `alert`
//!
//! The [`EventBus`] delivers each event two ways. Synchronous
//! [`EventListener`]s run inline on the publishing thread, in publish order;
//! monitoring and the Prometheus collector hook in here. Async consumers
//! subscribe to a broadcast channel through [`EventBus::subscribe`].
//!
//! # Examples
//!
//! ```rust
//! use jobmill::events::{EventBus, EventConfig, EventFilter, JobEvent, JobEventKind};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(EventConfig::default());
//! let mut subscription = bus.subscribe(EventFilter::new().with_names(["queue.paused"]));
//!
//! bus.publish(JobEvent::new(JobEventKind::QueueResumed));
//! bus.publish(JobEvent::new(JobEventKind::QueuePaused));
//!
//! let event = subscription.recv().await.unwrap();
//! assert_eq!(event.name(), "queue.paused");
//! # }
//! ```

use crate::alerting::Alert;
use crate::error::JobErrorKind;
use crate::job::{ExecutionId, JobExecution};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::broadcast;
use uuid::Uuid;

/// One entry in the engine's event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEvent {
    pub event_id: Uuid,
    pub job_id: Option<String>,
    pub job_name: Option<String>,
    pub execution_id: Option<ExecutionId>,
    pub timestamp: DateTime<Utc>,
    pub kind: JobEventKind,
}

/// What happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    Created,
    Started,
    Completed {
        result: serde_json::Value,
        exec_time_ms: u64,
    },
    Failed {
        error: String,
        kind: JobErrorKind,
        exec_time_ms: u64,
        will_retry: bool,
    },
    Retrying {
        retry_count: u32,
        delay_ms: u64,
    },
    Cancelled,
    Scheduled {
        schedule_id: String,
    },
    QueuePaused,
    QueueResumed,
    ManagerStarted,
    ManagerStopped,
    Alert(Alert),
}

impl JobEventKind {
    /// Dotted wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            JobEventKind::Created => "job.created",
            JobEventKind::Started => "job.started",
            JobEventKind::Completed { .. } => "job.completed",
            JobEventKind::Failed { .. } => "job.failed",
            JobEventKind::Retrying { .. } => "job.retrying",
            JobEventKind::Cancelled => "job.cancelled",
            JobEventKind::Scheduled { .. } => "job.scheduled",
            JobEventKind::QueuePaused => "queue.paused",
            JobEventKind::QueueResumed => "queue.resumed",
            JobEventKind::ManagerStarted => "manager.started",
            JobEventKind::ManagerStopped => "manager.stopped",
            JobEventKind::Alert(_) => "alert",
        }
    }

    /// Whether the event ends an attempt (`job.completed` or `job.failed`).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEventKind::Completed { .. } | JobEventKind::Failed { .. }
        )
    }
}

impl JobEvent {
    /// An engine-level event not tied to a job.
    pub fn new(kind: JobEventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            job_id: None,
            job_name: None,
            execution_id: None,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// An event about one execution.
    pub fn for_execution(execution: &JobExecution, kind: JobEventKind) -> Self {
        Self {
            job_id: Some(execution.definition.id.clone()),
            job_name: Some(execution.definition.name.clone()),
            execution_id: Some(execution.execution_id),
            ..Self::new(kind)
        }
    }

    /// An event about a job that has no execution yet.
    pub fn for_job(job_id: impl Into<String>, job_name: impl Into<String>, kind: JobEventKind) -> Self {
        Self {
            job_id: Some(job_id.into()),
            job_name: Some(job_name.into()),
            ..Self::new(kind)
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Inline observer of published events.
///
/// Listeners run on the publishing thread while no engine lock is held, so
/// they must be quick and must not block.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &JobEvent);
}

/// Selects which events a subscription yields. Empty lists match everything.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventFilter {
    pub event_names: Vec<String>,
    pub job_names: Vec<String>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_job_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.job_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn matches(&self, event: &JobEvent) -> bool {
        if !self.event_names.is_empty() && !self.event_names.iter().any(|n| n == event.name()) {
            return false;
        }

        if !self.job_names.is_empty() {
            match &event.job_name {
                Some(name) if self.job_names.contains(name) => {}
                _ => return false,
            }
        }

        true
    }
}

/// Filtered receiver over the broadcast channel.
#[derive(Debug)]
pub struct EventSubscription {
    pub filter: EventFilter,
    pub receiver: broadcast::Receiver<JobEvent>,
}

impl EventSubscription {
    /// Wait for the next matching event.
    ///
    /// Returns `None` once the bus is dropped. Events missed because the
    /// subscriber lagged are skipped with a warning.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event subscription lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Configuration for the event bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventConfig {
    /// Capacity of the broadcast channel
    pub max_buffer_size: usize,
    /// Log every published event at debug level
    pub log_events: bool,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 10_000,
            log_events: false,
        }
    }
}

struct EventBusInner {
    sender: broadcast::Sender<JobEvent>,
    listeners: RwLock<Vec<Weak<dyn EventListener>>>,
    config: EventConfig,
}

/// Cheaply cloneable handle to the shared event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.inner.config)
            .field("subscribers", &self.inner.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    pub fn new(config: EventConfig) -> Self {
        let (sender, _) = broadcast::channel(config.max_buffer_size.max(1));
        Self {
            inner: Arc::new(EventBusInner {
                sender,
                listeners: RwLock::new(Vec::new()),
                config,
            }),
        }
    }

    /// Deliver an event to listeners, then to subscribers.
    pub fn publish(&self, event: JobEvent) {
        if self.inner.config.log_events {
            tracing::debug!(
                "Publishing event {} for job {:?} (execution {:?})",
                event.name(),
                event.job_id,
                event.execution_id
            );
        }

        let listeners: Vec<Arc<dyn EventListener>> = {
            let guard = self
                .inner
                .listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.on_event(&event);
        }

        // No subscribers is not an error.
        let _ = self.inner.sender.send(event);
    }

    /// Register an inline listener. The bus holds it weakly; dropping the last
    /// strong reference unregisters it.
    pub fn add_listener(&self, listener: &Arc<dyn EventListener>) {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(Arc::downgrade(listener));
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|l| l.strong_count() > 0)
            .count()
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        EventSubscription {
            filter,
            receiver: self.inner.sender.subscribe(),
        }
    }

    pub fn subscribe_all(&self) -> EventSubscription {
        self.subscribe(EventFilter::default())
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventConfig::default())
    }
}
