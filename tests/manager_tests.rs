use async_trait::async_trait;
use jobmill::config::EngineConfig;
use jobmill::error::JobError;
use jobmill::events::{EventFilter, JobEventKind};
use jobmill::job::{ExecutionId, JobDefinition, JobResult, JobStatus};
use jobmill::manager::JobManager;
use jobmill::registry::{JobContext, JobHandler, handler_fn};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_retry_delay(Duration::from_millis(20))
}

async fn wait_for_status(manager: &JobManager, id: ExecutionId, status: JobStatus) -> JobResult {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(result) = manager.get_job_status(id).unwrap() {
                if result.status == status {
                    return result;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("execution {} never reached {}", id, status))
}

#[tokio::test]
async fn test_happy_path() {
    let manager = JobManager::new(config()).unwrap();
    manager
        .register_handler(handler_fn("greet", |payload, _ctx| async move {
            Ok(json!({ "greeting": format!("hello {}", payload["name"].as_str().unwrap_or("?")) }))
        }))
        .unwrap();
    let mut completed = manager.subscribe(EventFilter::new().with_names(["job.completed"]));

    manager.start().await.unwrap();
    let id = manager
        .add_job(JobDefinition::new("greet", json!({ "name": "ada" })).with_priority(1))
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), completed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.execution_id, Some(id));

    let status = wait_for_status(&manager, id, JobStatus::Completed).await;
    assert!(status.success);
    assert_eq!(status.result, Some(json!({ "greeting": "hello ada" })));

    let metrics = manager.get_metrics();
    assert_eq!(metrics.completed_jobs, 1);
    assert_eq!(metrics.success_rate, 1.0);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_timeout_then_retry_exhaustion() {
    let manager = JobManager::new(
        config()
            .with_job_timeout(Duration::from_millis(50))
            .with_max_retries(2),
    )
    .unwrap();
    manager
        .register_handler(handler_fn("hang", |_payload, _ctx| async move {
            std::future::pending::<()>().await;
            Ok(json!(null))
        }))
        .unwrap();
    let mut retrying = manager.subscribe(EventFilter::new().with_names(["job.retrying"]));

    manager.start().await.unwrap();
    let id = manager.add_job(JobDefinition::new("hang", json!({}))).unwrap();

    let mut delays = Vec::new();
    for _ in 0..2 {
        let event = tokio::time::timeout(Duration::from_secs(5), retrying.recv())
            .await
            .unwrap()
            .unwrap();
        match event.kind {
            JobEventKind::Retrying { delay_ms, .. } => delays.push(delay_ms),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(delays, vec![20, 40]);

    let status = wait_for_status(&manager, id, JobStatus::Failed).await;
    assert_eq!(status.retry_count, 2);
    assert!(status.error.unwrap().contains("timed out"));
    assert_eq!(manager.get_metrics().failed_jobs, 1);

    manager.stop().await.unwrap();
}

struct PickyHandler {
    executions: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for PickyHandler {
    fn name(&self) -> &str {
        "picky"
    }

    fn validate(&self, payload: &serde_json::Value) -> Result<(), String> {
        if payload.get("count").is_some_and(|c| c.is_u64()) {
            Ok(())
        } else {
            Err("count must be a positive integer".to_string())
        }
    }

    async fn execute(
        &self,
        payload: &serde_json::Value,
        _ctx: JobContext,
    ) -> Result<serde_json::Value, JobError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(payload.clone())
    }
}

#[tokio::test]
async fn test_validation_rejection_skips_execute_and_retries() {
    let executions = Arc::new(AtomicUsize::new(0));
    let manager = JobManager::new(config().with_max_retries(3)).unwrap();
    manager
        .register_handler(PickyHandler {
            executions: executions.clone(),
        })
        .unwrap();

    manager.start().await.unwrap();
    let rejected = manager
        .add_job(JobDefinition::new("picky", json!({ "count": "lots" })))
        .unwrap();
    let accepted = manager
        .add_job(JobDefinition::new("picky", json!({ "count": 3 })))
        .unwrap();

    let status = wait_for_status(&manager, rejected, JobStatus::Failed).await;
    assert_eq!(status.retry_count, 0);
    assert!(status.error.unwrap().contains("validation"));

    wait_for_status(&manager, accepted, JobStatus::Completed).await;
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_in_flight_never_exceeds_concurrency() {
    let manager = JobManager::new(config().with_concurrency(2)).unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let observed_peak = Arc::new(AtomicUsize::new(0));
    {
        let running = running.clone();
        let observed_peak = observed_peak.clone();
        manager
            .register_handler(handler_fn("work", move |_payload, _ctx| {
                let running = running.clone();
                let observed_peak = observed_peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    observed_peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }))
            .unwrap();
    }

    manager.start().await.unwrap();
    let ids: Vec<_> = (0..8)
        .map(|_| manager.add_job(JobDefinition::new("work", json!({}))).unwrap())
        .collect();
    for id in ids {
        wait_for_status(&manager, id, JobStatus::Completed).await;
    }

    assert!(observed_peak.load(Ordering::SeqCst) <= 2);
    assert!(manager.peak_in_flight() <= 2);
    assert!(manager.peak_in_flight() >= 1);
    assert_eq!(manager.get_metrics().completed_jobs, 8);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_cancel_running_job_returns_false() {
    let manager = JobManager::new(config()).unwrap();
    manager
        .register_handler(handler_fn("slow", |_payload, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!("finished"))
        }))
        .unwrap();
    let mut started = manager.subscribe(EventFilter::new().with_names(["job.started"]));

    manager.start().await.unwrap();
    let id = manager.add_job(JobDefinition::new("slow", json!({}))).unwrap();
    tokio::time::timeout(Duration::from_secs(5), started.recv())
        .await
        .unwrap()
        .unwrap();

    assert!(!manager.cancel_job(id).unwrap());
    let status = wait_for_status(&manager, id, JobStatus::Completed).await;
    assert_eq!(status.result, Some(json!("finished")));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_cancel_pending_job_while_paused() {
    let manager = JobManager::new(config()).unwrap();
    manager
        .register_handler(handler_fn("noop", |_payload, _ctx| async move { Ok(json!(null)) }))
        .unwrap();

    manager.start().await.unwrap();
    manager.pause().unwrap();
    let id = manager.add_job(JobDefinition::new("noop", json!({}))).unwrap();
    assert!(manager.cancel_job(id).unwrap());

    manager.resume().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manager.get_job_status(id).unwrap().is_none());
    assert_eq!(manager.get_queue_status().unwrap().pending, 0);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_health_check_while_running() {
    let manager = JobManager::new(config()).unwrap();
    manager
        .register_handler(handler_fn("noop", |_payload, _ctx| async move { Ok(json!(null)) }))
        .unwrap();

    manager.start().await.unwrap();
    let health = manager.health_check();
    assert!(health.healthy, "unexpected issues: {:?}", health.issues);
    assert!(health.running);

    manager.stop().await.unwrap();
    let health = manager.health_check();
    assert!(!health.healthy);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_work() {
    let finished = Arc::new(AtomicUsize::new(0));
    let manager = JobManager::new(config()).unwrap();
    {
        let finished = finished.clone();
        manager
            .register_handler(handler_fn("drain", move |_payload, _ctx| {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }))
            .unwrap();
    }
    let mut started = manager.subscribe(EventFilter::new().with_names(["job.started"]));

    manager.start().await.unwrap();
    manager.add_job(JobDefinition::new("drain", json!({}))).unwrap();
    tokio::time::timeout(Duration::from_secs(5), started.recv())
        .await
        .unwrap()
        .unwrap();

    manager.stop().await.unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(manager.in_flight(), 0);
}

#[cfg(feature = "metrics")]
#[tokio::test]
async fn test_prometheus_export() {
    let manager = JobManager::new(config()).unwrap();
    manager
        .register_handler(handler_fn("noop", |_payload, _ctx| async move { Ok(json!(null)) }))
        .unwrap();

    manager.start().await.unwrap();
    let id = manager.add_job(JobDefinition::new("noop", json!({}))).unwrap();
    wait_for_status(&manager, id, JobStatus::Completed).await;
    manager.stop().await.unwrap();

    let text = manager.gather_metrics().unwrap();
    assert!(text.contains("jobmill_jobs_total"));
    assert!(text.contains("jobmill_queue_jobs"));
}
