//! In-memory job queue.
//!
//! The queue owns every [`JobExecution`] from enqueue until it reaches a
//! terminal state, plus a bounded history of terminal results. All state sits
//! behind one mutex; every operation is synchronous and short. Events for the
//! transitions the queue performs are published after the lock is released.
//!
//! Ready pending executions are served in ascending priority value, FIFO among
//! equal priorities. Immediate jobs jump to the front. Executions with a delay
//! or a retry back-off are skipped until their time has come.
//!
//! ```rust
//! use jobmill::events::EventBus;
//! use jobmill::job::JobDefinition;
//! use jobmill::queue::JobQueue;
//! use serde_json::json;
//!
//! # fn main() -> jobmill::Result<()> {
//! let queue = JobQueue::new(EventBus::default());
//! let low = queue.add(JobDefinition::new("report", json!({})).with_priority(9))?;
//! let high = queue.add(JobDefinition::new("report", json!({})).with_priority(1))?;
//!
//! assert_eq!(queue.next()?.map(|e| e.execution_id), Some(high));
//! assert_eq!(queue.next()?.map(|e| e.execution_id), Some(low));
//! # Ok(())
//! # }
//! ```

use crate::clock::{SharedClock, SystemClock};
use crate::error::JobError;
use crate::events::{EventBus, JobEvent, JobEventKind};
use crate::job::{ExecutionId, JobDefinition, JobExecution, JobResult, JobStatus, JobType};
use crate::{JobmillError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Counts describing the queue at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub awaiting_retry: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: bool,
}

/// What [`JobQueue::fail`] decided.
#[derive(Debug, Clone, PartialEq)]
pub struct FailOutcome {
    pub result: JobResult,
    /// The execution is retained and waits for [`JobQueue::retry`]
    pub will_retry: bool,
    /// Retries already made before this failure
    pub retry_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: Vec<JobExecution>,
    processing: HashMap<ExecutionId, JobExecution>,
    awaiting_retry: HashMap<ExecutionId, JobExecution>,
    completed: HashMap<ExecutionId, JobResult>,
    failed: HashMap<ExecutionId, JobResult>,
    paused: bool,
}

impl QueueState {
    /// Insert keeping ascending priority; arrivals go before the first entry
    /// with a strictly higher value.
    fn insert_by_priority(&mut self, execution: JobExecution) {
        let priority = execution.priority();
        let position = self
            .pending
            .iter()
            .position(|existing| existing.priority() > priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(position, execution);
    }
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    clock: SharedClock,
    events: EventBus,
    default_max_retries: u32,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("default_max_retries", &self.default_max_retries)
            .field("clock", &self.clock)
            .finish()
    }
}

impl JobQueue {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock: Arc::new(SystemClock),
            events,
            default_max_retries: 3,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Retry budget for jobs without their own `max_retries`.
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state.lock().map_err(|_| JobmillError::Queue {
            message: "queue state lock poisoned".to_string(),
        })
    }

    /// Enqueue a job and return its new execution id.
    pub fn add(&self, definition: JobDefinition) -> Result<ExecutionId> {
        let execution = JobExecution::new(definition, self.default_max_retries, self.clock.now());
        let execution_id = execution.execution_id;
        let event = JobEvent::for_execution(&execution, JobEventKind::Created);

        {
            let mut state = self.lock()?;
            if execution.definition.job_type == JobType::Immediate {
                state.pending.insert(0, execution);
            } else {
                state.insert_by_priority(execution);
            }
        }

        tracing::debug!(
            "Enqueued job {} ({}) as execution {}",
            event.job_id.as_deref().unwrap_or_default(),
            event.job_name.as_deref().unwrap_or_default(),
            execution_id
        );
        self.events.publish(event);
        Ok(execution_id)
    }

    /// Take the first ready execution and mark it running.
    pub fn next(&self) -> Result<Option<JobExecution>> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        if state.paused {
            return Ok(None);
        }

        let Some(position) = state.pending.iter().position(|e| e.is_ready(now)) else {
            return Ok(None);
        };

        let mut execution = state.pending.remove(position);
        execution.status = JobStatus::Running;
        execution.started_at = Some(now);
        state
            .processing
            .insert(execution.execution_id, execution.clone());

        tracing::debug!(
            "Dequeued execution {} of job {} (attempt {})",
            execution.execution_id,
            execution.job_id(),
            execution.retry_count + 1
        );
        Ok(Some(execution))
    }

    /// Record a successful attempt.
    pub fn complete(
        &self,
        execution_id: ExecutionId,
        result: serde_json::Value,
        exec_time_ms: u64,
    ) -> Result<JobResult> {
        let now = self.clock.now();
        let (snapshot, event) = {
            let mut state = self.lock()?;
            let mut execution = state.processing.remove(&execution_id).ok_or_else(|| {
                JobmillError::JobNotFound {
                    id: execution_id.to_string(),
                }
            })?;

            execution.status = JobStatus::Completed;
            execution.completed_at = Some(now);
            execution.result = Some(result.clone());
            execution.error = None;

            let snapshot = JobResult {
                success: true,
                execution_time_ms: exec_time_ms,
                ..JobResult::from_execution(&execution)
            };
            state.completed.insert(execution_id, snapshot.clone());

            let event = JobEvent::for_execution(
                &execution,
                JobEventKind::Completed {
                    result,
                    exec_time_ms,
                },
            )
            .at(now);
            (snapshot, event)
        };

        tracing::info!(
            "Job {} completed in {}ms (execution {})",
            snapshot.job_id,
            exec_time_ms,
            execution_id
        );
        self.events.publish(event);
        Ok(snapshot)
    }

    /// Record a failed attempt.
    ///
    /// A retryable error with budget left keeps the execution for a later
    /// [`retry`](Self::retry); anything else moves it to failed history.
    pub fn fail(
        &self,
        execution_id: ExecutionId,
        error: &JobError,
        exec_time_ms: u64,
    ) -> Result<FailOutcome> {
        let now = self.clock.now();
        let message = error.to_string();

        let (outcome, event) = {
            let mut state = self.lock()?;
            let mut execution = state.processing.remove(&execution_id).ok_or_else(|| {
                JobmillError::JobNotFound {
                    id: execution_id.to_string(),
                }
            })?;

            let will_retry = error.is_retryable() && execution.has_retries_left();
            execution.completed_at = Some(now);
            execution.error = Some(message.clone());
            execution.status = if will_retry {
                JobStatus::Pending
            } else {
                JobStatus::Failed
            };

            let snapshot = JobResult {
                success: false,
                execution_time_ms: exec_time_ms,
                ..JobResult::from_execution(&execution)
            };
            let event = JobEvent::for_execution(
                &execution,
                JobEventKind::Failed {
                    error: message.clone(),
                    kind: error.kind(),
                    exec_time_ms,
                    will_retry,
                },
            )
            .at(now);
            let retry_count = execution.retry_count;

            if will_retry {
                state.awaiting_retry.insert(execution_id, execution);
            } else {
                state.failed.insert(execution_id, snapshot.clone());
            }

            (
                FailOutcome {
                    result: snapshot,
                    will_retry,
                    retry_count,
                },
                event,
            )
        };

        if outcome.will_retry {
            tracing::warn!(
                "Job {} failed (attempt {}), will retry: {}",
                outcome.result.job_id,
                outcome.retry_count + 1,
                message
            );
        } else {
            tracing::error!(
                "Job {} failed permanently after {} retries: {}",
                outcome.result.job_id,
                outcome.retry_count,
                message
            );
        }
        self.events.publish(event);
        Ok(outcome)
    }

    /// Put an execution that failed retryably back into the pending list,
    /// not eligible until `delay` has passed.
    pub fn retry(&self, execution_id: ExecutionId, delay: Duration) -> Result<()> {
        let now = self.clock.now();
        let event = {
            let mut state = self.lock()?;
            let mut execution = state.awaiting_retry.remove(&execution_id).ok_or_else(|| {
                JobmillError::Queue {
                    message: format!("execution {} is not awaiting retry", execution_id),
                }
            })?;

            execution.retry_count += 1;
            execution.status = JobStatus::Pending;
            execution.started_at = None;
            execution.next_retry_at = Some(
                chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            );

            let event = JobEvent::for_execution(
                &execution,
                JobEventKind::Retrying {
                    retry_count: execution.retry_count,
                    delay_ms: delay.as_millis() as u64,
                },
            )
            .at(now);
            state.insert_by_priority(execution);
            event
        };

        tracing::info!(
            "Retrying execution {} in {}ms",
            execution_id,
            delay.as_millis()
        );
        self.events.publish(event);
        Ok(())
    }

    /// Drop an execution that hasn't started. Running executions are never
    /// preempted; cancelling one (or an unknown id) returns `false`.
    pub fn cancel(&self, execution_id: ExecutionId) -> Result<bool> {
        let removed = {
            let mut state = self.lock()?;
            match state
                .pending
                .iter()
                .position(|e| e.execution_id == execution_id)
            {
                Some(position) => Some(state.pending.remove(position)),
                None => state.awaiting_retry.remove(&execution_id),
            }
        };

        match removed {
            Some(execution) => {
                tracing::info!(
                    "Cancelled execution {} of job {}",
                    execution_id,
                    execution.job_id()
                );
                self.events.publish(
                    JobEvent::for_execution(&execution, JobEventKind::Cancelled)
                        .at(self.clock.now()),
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop handing out work. In-flight executions are unaffected.
    pub fn pause(&self) -> Result<()> {
        let changed = {
            let mut state = self.lock()?;
            !std::mem::replace(&mut state.paused, true)
        };
        if changed {
            tracing::info!("Job queue paused");
            self.events.publish(JobEvent::new(JobEventKind::QueuePaused));
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let changed = {
            let mut state = self.lock()?;
            std::mem::replace(&mut state.paused, false)
        };
        if changed {
            tracing::info!("Job queue resumed");
            self.events.publish(JobEvent::new(JobEventKind::QueueResumed));
        }
        Ok(())
    }

    pub fn is_paused(&self) -> Result<bool> {
        Ok(self.lock()?.paused)
    }

    /// Trim completed and failed history to the newest `max_history` entries
    /// each. Returns how many results were evicted.
    pub fn cleanup(&self, max_history: usize) -> Result<usize> {
        let mut state = self.lock()?;
        let evicted = trim_history(&mut state.completed, max_history)
            + trim_history(&mut state.failed, max_history);
        drop(state);

        if evicted > 0 {
            tracing::debug!("Evicted {} finished results from history", evicted);
        }
        Ok(evicted)
    }

    /// Number of pending executions, including ones waiting out a delay.
    pub fn size(&self) -> Result<usize> {
        Ok(self.lock()?.pending.len())
    }

    pub fn status(&self) -> Result<QueueStatus> {
        let state = self.lock()?;
        Ok(QueueStatus {
            pending: state.pending.len(),
            awaiting_retry: state.awaiting_retry.len(),
            processing: state.processing.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
            paused: state.paused,
        })
    }

    /// Latest snapshot of an execution, or `None` for unknown ids.
    pub fn get_job_status(&self, execution_id: ExecutionId) -> Result<Option<JobResult>> {
        let state = self.lock()?;

        if let Some(result) = state.completed.get(&execution_id) {
            return Ok(Some(result.clone()));
        }
        if let Some(result) = state.failed.get(&execution_id) {
            return Ok(Some(result.clone()));
        }

        let active = state
            .processing
            .get(&execution_id)
            .or_else(|| state.awaiting_retry.get(&execution_id))
            .or_else(|| {
                state
                    .pending
                    .iter()
                    .find(|e| e.execution_id == execution_id)
            });
        Ok(active.map(JobResult::from_execution))
    }
}

fn trim_history(history: &mut HashMap<ExecutionId, JobResult>, max_history: usize) -> usize {
    if history.len() <= max_history {
        return 0;
    }

    let mut by_age: Vec<_> = history
        .iter()
        .map(|(id, result)| (result.completed_at, *id))
        .collect();
    by_age.sort();

    let excess = history.len() - max_history;
    for (_, id) in by_age.into_iter().take(excess) {
        history.remove(&id);
    }
    excess
}
