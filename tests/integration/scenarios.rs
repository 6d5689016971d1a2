use crate::*;
use warren_services::kernels::builtin_handlers;
use warren_services::{JobError, TaskStatus};

/// Built-ins plus a `hold` job that sleeps for the given milliseconds.
fn handlers_with_hold() -> HandlerTable {
    let mut table = builtin_handlers();
    table.register("hold", |input: &str, _: u32| -> Result<String, JobError> {
        let ms: u64 = serde_json::from_str(input)?;
        std::thread::sleep(Duration::from_millis(ms));
        Ok(format!("{{\"held\":{ms}}}"))
    });
    table
}

async fn status(broker: &TestBroker, task_id: &str) -> Option<TaskStatus> {
    broker.scheduler.task(task_id).await.map(|t| t.status)
}

#[tokio::test]
async fn test_simple_math_round_trip() -> Result<()> {
    let broker = TestBroker::start().await?;
    let _worker = broker.worker("w1", 1, builtin_handlers()).await?;
    let client = broker.client("c1").await?;

    let id = client.submit("simpleMath", r#"{"a":2,"b":3}"#.into(), 1).await?;
    let result = next_result(&client).await?;
    assert_eq!(result.id, id);
    assert_eq!(result.data, r#"{"result":5}"#);

    let task = broker.scheduler.task(&id).await.context("task recorded")?;
    assert_eq!(
        task.history,
        vec![
            TaskStatus::Created,
            TaskStatus::Queued,
            TaskStatus::SentToWorker,
            TaskStatus::Ready
        ]
    );
    let worker = broker.scheduler.worker("w1").await.context("worker registered")?;
    assert_eq!(worker.used_cores, 0);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_second_task_waits_for_cores() -> Result<()> {
    let broker = TestBroker::start().await?;
    let _worker = broker.worker("w2", 2, handlers_with_hold()).await?;
    let client = broker.client("c2").await?;

    let first = client.submit("hold", "400".into(), 2).await?;
    let second = client.submit("hold", "10".into(), 2).await?;

    broker
        .wait_until("second task to be recorded", |s| {
            let id = second.clone();
            async move { s.task(&id).await.is_some() }
        })
        .await?;
    assert_eq!(status(&broker, &first).await, Some(TaskStatus::SentToWorker));
    assert_eq!(status(&broker, &second).await, Some(TaskStatus::Queued));
    assert_eq!(broker.scheduler.pending_len().await, 1);

    let r1 = next_result(&client).await?;
    let r2 = next_result(&client).await?;
    assert_eq!(r1.id, first);
    assert_eq!(r2.id, second);
    assert_eq!(r2.data, r#"{"held":10}"#);
    assert_eq!(broker.scheduler.pending_len().await, 0);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_work_spreads_to_freest_worker() -> Result<()> {
    let broker = TestBroker::start().await?;
    let _small = broker.worker("small", 1, handlers_with_hold()).await?;
    let _big = broker.worker("big", 4, handlers_with_hold()).await?;
    broker
        .wait_until("both workers", |s| async move { s.snapshot().await.workers.len() == 2 })
        .await?;
    let client = broker.client("c3").await?;

    let id = client.submit("hold", "200".into(), 1).await?;
    broker
        .wait_until("dispatch", |s| {
            let id = id.clone();
            async move { s.task(&id).await.is_some_and(|t| t.assigned_worker.is_some()) }
        })
        .await?;
    let task = broker.scheduler.task(&id).await.context("task recorded")?;
    assert_eq!(task.assigned_worker.as_deref(), Some("big"));

    next_result(&client).await?;
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_pending_work_goes_to_late_worker() -> Result<()> {
    let broker = TestBroker::start().await?;
    let client = broker.client("c4").await?;

    let id = client.submit("simpleMath", r#"{"a":40,"b":2}"#.into(), 1).await?;
    broker
        .wait_until("task to queue", |s| async move { s.pending_len().await == 1 })
        .await?;

    let _worker = broker.worker("late", 1, builtin_handlers()).await?;
    let result = next_result(&client).await?;
    assert_eq!(result.id, id);
    assert_eq!(result.data, r#"{"result":42}"#);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_worker_disconnect_fails_its_tasks() -> Result<()> {
    let broker = TestBroker::start().await?;
    let worker = broker.worker("doomed", 2, handlers_with_hold()).await?;
    let client = broker.client("c5").await?;

    let id = client.submit("hold", "2000".into(), 2).await?;
    broker
        .wait_until("dispatch", |s| {
            let id = id.clone();
            async move { s.task(&id).await.is_some_and(|t| t.status == TaskStatus::SentToWorker) }
        })
        .await?;

    worker.kill();

    let result = next_result(&client).await?;
    assert_eq!(result.id, id);
    let body: serde_json::Value = serde_json::from_str(&result.data)?;
    assert_eq!(body["error"], "worker disconnected");
    assert_eq!(status(&broker, &id).await, Some(TaskStatus::Failed));
    assert!(broker.scheduler.worker("doomed").await.is_none());

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_worker_shutdown_finishes_running_job() -> Result<()> {
    let broker = TestBroker::start().await?;
    let worker = broker.worker("leaving", 1, handlers_with_hold()).await?;
    let client = broker.client("c5b").await?;

    let id = client.submit("hold", "500".into(), 1).await?;
    broker
        .wait_until("dispatch", |s| {
            let id = id.clone();
            async move { s.task(&id).await.is_some_and(|t| t.status == TaskStatus::SentToWorker) }
        })
        .await?;

    worker.stop().await?;

    let result = next_result(&client).await?;
    assert_eq!(result.id, id);
    assert_eq!(result.data, r#"{"held":500}"#);
    assert_eq!(status(&broker, &id).await, Some(TaskStatus::Ready));
    broker
        .wait_until("worker removal", |s| async move { s.worker("leaving").await.is_none() })
        .await?;

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_unknown_job_reports_error_and_frees_cores() -> Result<()> {
    let broker = TestBroker::start().await?;
    let _worker = broker.worker("w6", 1, builtin_handlers()).await?;
    let client = broker.client("c6").await?;

    let id = client.submit("teleport", "{}".into(), 1).await?;
    let result = next_result(&client).await?;
    assert_eq!(result.id, id);
    assert!(result.data.contains("unknown job teleport"));

    // The core came back: a follow-up job still runs.
    client.submit("simpleMath", r#"{"a":1,"b":1}"#.into(), 1).await?;
    assert_eq!(next_result(&client).await?.data, r#"{"result":2}"#);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_results_route_to_owning_client() -> Result<()> {
    let broker = TestBroker::start().await?;
    let _worker = broker.worker("w7", 4, builtin_handlers()).await?;
    let alice = broker.client("alice").await?;
    let bob = broker.client("bob").await?;

    let a = alice.submit("simpleMath", r#"{"a":1,"b":2}"#.into(), 1).await?;
    let b = bob.submit("matrixMultiplication", "[[[1,2]],[[3],[4]]]".into(), 1).await?;

    let ra = next_result(&alice).await?;
    let rb = next_result(&bob).await?;
    assert_eq!((ra.id, ra.data.as_str()), (a, r#"{"result":3}"#));
    assert_eq!((rb.id, rb.data.as_str()), (b, "[[11]]"));

    alice.close().await;
    bob.close().await;
    Ok(())
}
