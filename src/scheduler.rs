//! Cron-driven job scheduling.
//!
//! The scheduler never runs jobs. Each enabled schedule owns a timer task that
//! sleeps until the next cron instant, then derives a fresh job from the
//! schedule's template (new id, type [`JobType::Scheduled`]) and sends it down
//! a channel. The manager drains that channel into the queue.
//!
//! Cron expressions are validated when a schedule is created or updated. If a
//! next run can't be computed at runtime, the timer fires nothing and checks
//! again a minute later.

use crate::cron::CronSchedule;
use crate::events::{EventBus, JobEvent, JobEventKind};
use crate::job::{JobDefinition, JobType};
use crate::{JobmillError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ScheduleId = String;

/// Scheduler-owned record of one recurring job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSchedule {
    pub id: ScheduleId,
    pub template_id: String,
    pub job_name: String,
    pub cron_expression: String,
    pub timezone: String,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub created_at: DateTime<Utc>,
}

/// A job instance produced by a schedule trigger.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub schedule_id: ScheduleId,
    pub definition: JobDefinition,
}

/// Changes applied by [`JobScheduler::update_schedule`]. `None` keeps the
/// current value.
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    pub template: Option<JobDefinition>,
    pub enabled: Option<bool>,
}

struct ScheduleEntry {
    schedule: JobSchedule,
    template: JobDefinition,
    cron: CronSchedule,
    timer: Option<JoinHandle<()>>,
}

impl ScheduleEntry {
    fn abort_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn has_live_timer(&self) -> bool {
        self.timer.as_ref().is_some_and(|timer| !timer.is_finished())
    }
}

struct SchedulerShared {
    entries: Mutex<HashMap<ScheduleId, ScheduleEntry>>,
    sender: mpsc::UnboundedSender<ScheduledJob>,
    events: EventBus,
}

impl SchedulerShared {
    fn entries(&self) -> MutexGuard<'_, HashMap<ScheduleId, ScheduleEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct JobScheduler {
    shared: Arc<SchedulerShared>,
    running: AtomicBool,
    runtime: Mutex<Option<Handle>>,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("running", &self.is_running())
            .field("schedules", &self.shared.entries().len())
            .finish()
    }
}

impl JobScheduler {
    /// Create a scheduler and the receiving end of its trigger channel.
    pub fn new(events: EventBus) -> (Self, mpsc::UnboundedReceiver<ScheduledJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            shared: Arc::new(SchedulerShared {
                entries: Mutex::new(HashMap::new()),
                sender,
                events,
            }),
            running: AtomicBool::new(false),
            runtime: Mutex::new(None),
        };
        (scheduler, receiver)
    }

    /// Register a recurring job. Fails without registering anything if the
    /// expression or timezone is invalid.
    pub fn schedule(
        &self,
        template: JobDefinition,
        cron_expression: &str,
        timezone: Option<&str>,
    ) -> Result<ScheduleId> {
        let timezone = timezone.unwrap_or("UTC");
        let cron = CronSchedule::with_timezone(cron_expression, timezone)?;
        let now = Utc::now();
        let id = format!("schedule-{}", Uuid::new_v4().simple());
        let job_name = template.name.clone();

        let schedule = JobSchedule {
            id: id.clone(),
            template_id: template.id.clone(),
            job_name: template.name.clone(),
            cron_expression: cron_expression.to_string(),
            timezone: timezone.to_string(),
            enabled: true,
            last_run: None,
            next_run: cron.next_execution(now),
            run_count: 0,
            created_at: now,
        };

        let mut entries = self.shared.entries();
        entries.insert(
            id.clone(),
            ScheduleEntry {
                schedule,
                template,
                cron,
                timer: None,
            },
        );
        if let Some(entry) = entries.get_mut(&id) {
            self.arm(&id, entry);
        }
        drop(entries);

        info!(
            "Scheduled '{}' with cron '{}' ({}) as {}",
            job_name, cron_expression, timezone, id
        );
        Ok(id)
    }

    /// Remove a schedule and stop its timer.
    pub fn unschedule(&self, id: &str) -> Result<()> {
        let mut entry = self
            .shared
            .entries()
            .remove(id)
            .ok_or_else(|| not_found(id))?;
        entry.abort_timer();
        info!("Unscheduled {}", id);
        Ok(())
    }

    pub fn enable(&self, id: &str) -> Result<()> {
        let mut entries = self.shared.entries();
        let entry = entries.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.schedule.enabled = true;
        entry.schedule.next_run = entry.cron.next_execution(Utc::now());
        self.arm(id, entry);
        debug!("Enabled schedule {}", id);
        Ok(())
    }

    /// Stop triggering without deleting the schedule.
    pub fn disable(&self, id: &str) -> Result<()> {
        let mut entries = self.shared.entries();
        let entry = entries.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.schedule.enabled = false;
        entry.schedule.next_run = None;
        entry.abort_timer();
        debug!("Disabled schedule {}", id);
        Ok(())
    }

    pub fn update_schedule(&self, id: &str, update: ScheduleUpdate) -> Result<JobSchedule> {
        let mut entries = self.shared.entries();
        let entry = entries.get_mut(id).ok_or_else(|| not_found(id))?;

        if update.cron_expression.is_some() || update.timezone.is_some() {
            let expression = update
                .cron_expression
                .unwrap_or_else(|| entry.schedule.cron_expression.clone());
            let timezone = update
                .timezone
                .unwrap_or_else(|| entry.schedule.timezone.clone());
            entry.cron = CronSchedule::with_timezone(&expression, &timezone)?;
            entry.schedule.cron_expression = expression;
            entry.schedule.timezone = timezone;
        }
        if let Some(template) = update.template {
            entry.schedule.template_id = template.id.clone();
            entry.schedule.job_name = template.name.clone();
            entry.template = template;
        }
        if let Some(enabled) = update.enabled {
            entry.schedule.enabled = enabled;
        }

        entry.abort_timer();
        if entry.schedule.enabled {
            entry.schedule.next_run = entry.cron.next_execution(Utc::now());
            self.arm(id, entry);
        } else {
            entry.schedule.next_run = None;
        }

        info!("Updated schedule {}", id);
        Ok(entry.schedule.clone())
    }

    /// Start timers for every enabled schedule. Must be called from within a
    /// Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let handle = Handle::try_current().map_err(|e| JobmillError::Scheduler {
            message: format!("scheduler must start inside a Tokio runtime: {}", e),
        })?;
        *self.runtime.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        self.running.store(true, Ordering::SeqCst);

        let mut entries = self.shared.entries();
        let mut armed = 0;
        for (id, entry) in entries.iter_mut() {
            if entry.schedule.enabled {
                self.arm(id, entry);
                armed += 1;
            }
        }
        info!("Job scheduler started with {} active schedules", armed);
        Ok(())
    }

    /// Stop all timers. Schedules are kept and resume on the next `start`.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for entry in self.shared.entries().values_mut() {
            entry.abort_timer();
        }
        info!("Job scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn get_schedule(&self, id: &str) -> Option<JobSchedule> {
        self.shared.entries().get(id).map(|e| e.schedule.clone())
    }

    /// All schedules, oldest first.
    pub fn list_schedules(&self) -> Vec<JobSchedule> {
        let mut schedules: Vec<JobSchedule> = self
            .shared
            .entries()
            .values()
            .map(|e| e.schedule.clone())
            .collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        schedules
    }

    /// The next `count` trigger instants of a schedule.
    pub fn next_runs(&self, id: &str, count: usize) -> Result<Vec<DateTime<Utc>>> {
        let entries = self.shared.entries();
        let entry = entries.get(id).ok_or_else(|| not_found(id))?;
        Ok(entry.cron.upcoming(Utc::now(), count)?)
    }

    /// Spawn the entry's timer if the scheduler is running and it has none.
    fn arm(&self, id: &str, entry: &mut ScheduleEntry) {
        if !self.is_running() || !entry.schedule.enabled || entry.has_live_timer() {
            return;
        }
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(runtime) = runtime {
            let shared = Arc::clone(&self.shared);
            entry.timer = Some(runtime.spawn(run_timer(shared, id.to_string())));
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        for entry in self.shared.entries().values_mut() {
            entry.abort_timer();
        }
    }
}

fn not_found(id: &str) -> JobmillError {
    JobmillError::ScheduleNotFound { id: id.to_string() }
}

/// Derive a runnable job from a schedule's template.
fn instantiate(template: &JobDefinition) -> JobDefinition {
    JobDefinition {
        id: format!("{}-{}", template.id, Uuid::new_v4().simple()),
        job_type: JobType::Scheduled,
        cron_expression: None,
        timezone: None,
        created_at: Utc::now(),
        ..template.clone()
    }
}

/// How long a timer waits before recomputing when its expression yields no
/// upcoming instant.
const NO_NEXT_RUN_RECHECK: std::time::Duration = std::time::Duration::from_secs(60);

async fn run_timer(shared: Arc<SchedulerShared>, id: ScheduleId) {
    loop {
        let next = {
            let mut entries = shared.entries();
            let Some(entry) = entries.get_mut(&id) else {
                return;
            };
            if !entry.schedule.enabled {
                return;
            }

            let now = Utc::now();
            let from = entry.schedule.last_run.map_or(now, |last| last.max(now));
            let next = entry.cron.next_execution(from);
            entry.schedule.next_run = next;
            next
        };

        let Some(next) = next else {
            warn!(
                "Could not compute next run for schedule {}, checking again in one minute",
                id
            );
            tokio::time::sleep(NO_NEXT_RUN_RECHECK).await;
            continue;
        };

        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        let scheduled = {
            let mut entries = shared.entries();
            let Some(entry) = entries.get_mut(&id) else {
                return;
            };
            if !entry.schedule.enabled {
                return;
            }
            entry.schedule.last_run = Some(next);
            entry.schedule.run_count += 1;
            ScheduledJob {
                schedule_id: id.clone(),
                definition: instantiate(&entry.template),
            }
        };

        debug!(
            "Schedule {} fired, materialized job {}",
            id, scheduled.definition.id
        );
        shared.events.publish(JobEvent::for_job(
            scheduled.definition.id.clone(),
            scheduled.definition.name.clone(),
            JobEventKind::Scheduled {
                schedule_id: id.clone(),
            },
        ));

        if shared.sender.send(scheduled).is_err() {
            warn!("Scheduled job receiver dropped; stopping timer for {}", id);
            return;
        }
    }
}
