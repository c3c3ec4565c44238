use jobmill::config::EngineConfig;
use jobmill::events::{EventBus, EventFilter, JobEventKind};
use jobmill::job::{JobDefinition, JobType};
use jobmill::manager::JobManager;
use jobmill::registry::handler_fn;
use jobmill::scheduler::JobScheduler;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;

const EVERY_SECOND: &str = "*/1 * * * * *";

fn template() -> JobDefinition {
    JobDefinition::new("tick", json!({ "source": "cron" })).with_id("tick")
}

#[tokio::test]
async fn test_every_second_schedule_fires_with_distinct_ids() {
    let events = EventBus::default();
    let mut scheduled = events.subscribe(EventFilter::new().with_names(["job.scheduled"]));
    let (scheduler, mut jobs) = JobScheduler::new(events);

    let schedule_id = scheduler.schedule(template(), EVERY_SECOND, None).unwrap();
    scheduler.start().unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), scheduled.recv())
        .await
        .expect("no job.scheduled event within 2 seconds")
        .unwrap();
    match &first.kind {
        JobEventKind::Scheduled { schedule_id: id } => assert_eq!(id, &schedule_id),
        other => panic!("unexpected event {:?}", other),
    }

    let second = tokio::time::timeout(Duration::from_secs(2), scheduled.recv())
        .await
        .unwrap()
        .unwrap();
    assert_ne!(first.job_id, second.job_id);

    let mut ids = HashSet::new();
    for _ in 0..2 {
        let job = jobs.recv().await.unwrap();
        assert_eq!(job.schedule_id, schedule_id);
        assert_eq!(job.definition.job_type, JobType::Scheduled);
        assert!(job.definition.id.starts_with("tick-"));
        ids.insert(job.definition.id);
    }
    assert_eq!(ids.len(), 2);

    let schedule = scheduler.get_schedule(&schedule_id).unwrap();
    assert!(schedule.run_count >= 2);
    assert!(schedule.last_run.is_some());

    scheduler.stop();
}

#[tokio::test]
async fn test_disabled_schedule_stops_firing() {
    let (scheduler, mut jobs) = JobScheduler::new(EventBus::default());
    let schedule_id = scheduler.schedule(template(), EVERY_SECOND, None).unwrap();
    scheduler.start().unwrap();

    tokio::time::timeout(Duration::from_secs(2), jobs.recv())
        .await
        .unwrap()
        .unwrap();
    scheduler.disable(&schedule_id).unwrap();
    while jobs.try_recv().is_ok() {}

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(jobs.try_recv().is_err());

    scheduler.enable(&schedule_id).unwrap();
    tokio::time::timeout(Duration::from_secs(2), jobs.recv())
        .await
        .expect("re-enabled schedule did not fire")
        .unwrap();
}

#[tokio::test]
async fn test_stopped_scheduler_does_not_fire() {
    let (scheduler, mut jobs) = JobScheduler::new(EventBus::default());
    scheduler.schedule(template(), EVERY_SECOND, None).unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(jobs.try_recv().is_err());

    scheduler.start().unwrap();
    scheduler.stop();
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(jobs.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_schedule_without_future_instants_never_fires() {
    let (scheduler, mut jobs) = JobScheduler::new(EventBus::default());
    let schedule_id = scheduler
        .schedule(template(), "0 0 0 1 1 * 2020", None)
        .unwrap();
    assert!(scheduler.get_schedule(&schedule_id).unwrap().next_run.is_none());

    scheduler.start().unwrap();
    let fired = tokio::time::timeout(Duration::from_secs(180), jobs.recv()).await;
    assert!(fired.is_err(), "schedule with no upcoming instant produced a job");

    let schedule = scheduler.get_schedule(&schedule_id).unwrap();
    assert_eq!(schedule.run_count, 0);
    assert!(schedule.last_run.is_none());
    assert!(schedule.next_run.is_none());
    assert!(scheduler.next_runs(&schedule_id, 3).unwrap().is_empty());

    scheduler.stop();
}

#[tokio::test]
async fn test_invalid_expression_never_registers() {
    let (scheduler, _jobs) = JobScheduler::new(EventBus::default());
    assert!(scheduler.schedule(template(), "61 * * * * *", None).is_err());
    assert!(scheduler.schedule(template(), "* * * *", None).is_err());
    assert!(scheduler.list_schedules().is_empty());
}

#[tokio::test]
async fn test_manager_runs_scheduled_jobs() {
    let manager = JobManager::new(EngineConfig::default().with_poll_interval(Duration::from_millis(10)))
        .unwrap();
    manager
        .register_handler(handler_fn("tick", |payload, _ctx| async move { Ok(payload) }))
        .unwrap();
    let mut completed = manager.subscribe(EventFilter::new().with_names(["job.completed"]));

    manager.start().await.unwrap();
    manager.schedule_job(template(), EVERY_SECOND, Some("UTC")).unwrap();

    let event = tokio::time::timeout(Duration::from_secs(3), completed.recv())
        .await
        .expect("scheduled job did not complete")
        .unwrap();
    assert!(event.job_id.unwrap().starts_with("tick-"));
    assert_eq!(event.job_name.as_deref(), Some("tick"));

    manager.stop().await.unwrap();
}
