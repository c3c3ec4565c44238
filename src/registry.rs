//! Job handlers and the registry that maps job names to them.
//!
//! Handlers implement [`JobHandler`] directly against JSON payloads, or
//! implement [`TypedJobHandler`] with a concrete payload type and register
//! through the [`Typed`] adapter. Small handlers can be built from a closure
//! with [`handler_fn`].
//!
//! # Examples
//!
//! ```rust
//! use jobmill::registry::{handler_fn, JobRegistry};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let registry = JobRegistry::new();
//! registry
//!     .register(Arc::new(handler_fn("echo", |payload, _ctx| async move {
//!         Ok(json!({ "echo": payload }))
//!     })))
//!     .unwrap();
//!
//! assert!(registry.has_handler("echo"));
//! ```

use crate::error::JobError;
use crate::job::ExecutionId;
use crate::{JobmillError, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

/// Context handed to a handler for one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub execution_id: ExecutionId,
    pub job_id: String,
    pub job_name: String,
    /// 1 for the first attempt, incremented on each retry
    pub attempt: u32,
    cancel: watch::Receiver<bool>,
}

/// Fires the cancellation signal of the paired [`JobContext`].
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl JobContext {
    pub fn new(
        execution_id: ExecutionId,
        job_id: impl Into<String>,
        job_name: impl Into<String>,
        attempt: u32,
    ) -> (Self, CancelHandle) {
        let (sender, cancel) = watch::channel(false);
        let context = Self {
            execution_id,
            job_id: job_id.into(),
            job_name: job_name.into(),
            attempt,
            cancel,
        };
        (context, CancelHandle { sender })
    }

    /// Whether the processor has given up on this attempt (it timed out).
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the attempt is cancelled. Never resolves if the
    /// attempt finishes normally.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        loop {
            if *cancel.borrow_and_update() {
                return;
            }
            if cancel.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Capability that performs work for one job name.
///
/// Only [`name`](JobHandler::name) and [`execute`](JobHandler::execute) are
/// required. The hooks are best-effort: the processor logs their errors and
/// carries on.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        payload: &serde_json::Value,
        ctx: JobContext,
    ) -> std::result::Result<serde_json::Value, JobError>;

    /// Reject a payload before execution. The error message is reported as
    /// a validation failure and the job is not retried.
    fn validate(&self, _payload: &serde_json::Value) -> std::result::Result<(), String> {
        Ok(())
    }

    async fn on_success(&self, _result: &serde_json::Value) -> std::result::Result<(), JobError> {
        Ok(())
    }

    async fn on_failure(&self, _error: &JobError) -> std::result::Result<(), JobError> {
        Ok(())
    }

    /// Called after a failed attempt that was itself a retry.
    async fn on_retry(&self, _attempt: u32) -> std::result::Result<(), JobError> {
        Ok(())
    }
}

/// Handler with a concrete payload type.
///
/// Wrap it in [`Typed`] to register it. The JSON payload is decoded before
/// `validate` and `execute`; a payload that fails to decode is a validation
/// failure.
#[async_trait]
pub trait TypedJobHandler: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send + Sync;
    type Output: Serialize + Send;

    fn name(&self) -> &str;

    fn validate(&self, _payload: &Self::Payload) -> std::result::Result<(), String> {
        Ok(())
    }

    async fn execute(
        &self,
        payload: Self::Payload,
        ctx: JobContext,
    ) -> std::result::Result<Self::Output, JobError>;
}

/// Adapter registering a [`TypedJobHandler`] as a [`JobHandler`].
pub struct Typed<H>(pub H);

impl<H> Typed<H> {
    pub fn new(handler: H) -> Self {
        Typed(handler)
    }
}

impl<H: TypedJobHandler> Typed<H> {
    fn decode(&self, payload: &serde_json::Value) -> std::result::Result<H::Payload, String> {
        serde_json::from_value(payload.clone()).map_err(|e| format!("invalid payload: {}", e))
    }
}

#[async_trait]
impl<H: TypedJobHandler> JobHandler for Typed<H> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn validate(&self, payload: &serde_json::Value) -> std::result::Result<(), String> {
        let decoded = self.decode(payload)?;
        self.0.validate(&decoded)
    }

    async fn execute(
        &self,
        payload: &serde_json::Value,
        ctx: JobContext,
    ) -> std::result::Result<serde_json::Value, JobError> {
        let decoded = self.decode(payload).map_err(|message| JobError::Validation {
            name: self.0.name().to_string(),
            message,
        })?;
        let output = self.0.execute(decoded, ctx).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Handler backed by an async closure. See [`handler_fn`].
pub struct FnJobHandler<F> {
    name: String,
    func: F,
}

/// Build a handler from a closure taking the payload and context.
pub fn handler_fn<F, Fut>(name: impl Into<String>, func: F) -> FnJobHandler<F>
where
    F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<serde_json::Value, JobError>> + Send,
{
    FnJobHandler {
        name: name.into(),
        func,
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnJobHandler<F>
where
    F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<serde_json::Value, JobError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        payload: &serde_json::Value,
        ctx: JobContext,
    ) -> std::result::Result<serde_json::Value, JobError> {
        (self.func)(payload.clone(), ctx).await
    }
}

/// Name to handler lookup shared by the manager and processor.
#[derive(Default)]
pub struct JobRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("handlers", &self.handler_names())
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own name, replacing any previous one.
    pub fn register(&self, handler: Arc<dyn JobHandler>) -> Result<()> {
        let name = Self::checked_name(handler.as_ref())?;

        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.insert(name.clone(), handler).is_some() {
            tracing::warn!("Replaced existing handler for job type '{}'", name);
        } else {
            tracing::debug!("Registered handler for job type '{}'", name);
        }
        Ok(())
    }

    pub fn register_handler<H: JobHandler + 'static>(&self, handler: H) -> Result<()> {
        self.register(Arc::new(handler))
    }

    /// Register several handlers. Nothing is registered unless all of them
    /// are valid and their names are distinct.
    pub fn register_multiple(&self, batch: Vec<Arc<dyn JobHandler>>) -> Result<()> {
        let mut seen = HashSet::new();
        for handler in &batch {
            let name = Self::checked_name(handler.as_ref())?;
            if !seen.insert(name.clone()) {
                return Err(JobmillError::Registration {
                    message: format!("duplicate handler name '{}' in batch", name),
                });
            }
        }

        for handler in batch {
            self.register(handler)?;
        }
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            tracing::debug!("Unregistered handler for job type '{}'", name);
        }
        removed
    }

    pub fn get_handler(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn checked_name(handler: &dyn JobHandler) -> Result<String> {
        let name = handler.name();
        if name.trim().is_empty() {
            return Err(JobmillError::Registration {
                message: "handler name must not be empty".to_string(),
            });
        }
        if name.trim() != name {
            return Err(JobmillError::Registration {
                message: format!("handler name '{}' has surrounding whitespace", name),
            });
        }
        Ok(name.to_string())
    }
}
