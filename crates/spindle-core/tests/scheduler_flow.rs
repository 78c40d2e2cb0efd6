use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use spindle_core::domain::{NewResult, NewTask, TaskId, TaskStatus};
use spindle_core::impls::{QueueExecutor, SqliteTaskStore, WorkContext, WorkHandler, WorkUnit};
use spindle_core::{Executor, SchedulerBuilder, SchedulerOptions, SpindleError, TaskStore};

const PAGE: &str = "catalog.page";

struct CrawlHandler;

#[async_trait]
impl WorkHandler for CrawlHandler {
    async fn handle(&self, unit: &WorkUnit, ctx: &WorkContext) -> Result<(), SpindleError> {
        if !unit.url.ends_with("/detail") {
            // the same detail link is discovered twice; the store keeps one
            ctx.enqueue_many(vec![
                NewTask::new(format!("{}/detail", unit.url), PAGE),
                NewTask::new(format!("{}/detail", unit.url), PAGE),
            ])
            .await?;
        }
        ctx.store_result(NewResult::json(
            unit.task_id,
            unit.url.clone(),
            unit.task_type.clone(),
            &serde_json::json!({ "url": unit.url }),
        )?)
        .await?;
        Ok(())
    }
}

struct AlwaysFails;

#[async_trait]
impl WorkHandler for AlwaysFails {
    async fn handle(&self, unit: &WorkUnit, _ctx: &WorkContext) -> Result<(), SpindleError> {
        Err(SpindleError::handler(format!("HTTP 500 for {}", unit.url)))
    }
}

async fn drive<H: WorkHandler>(
    store: Arc<SqliteTaskStore>,
    handler: H,
    options: SchedulerOptions,
) -> (Arc<spindle_core::Scheduler>, Arc<QueueExecutor<H>>) {
    let builder = SchedulerBuilder::new(store).options(options);
    let executor = Arc::new(
        QueueExecutor::new(PAGE, handler, builder.context())
            .with_concurrency(2)
            .with_idle_poll(Duration::from_millis(100)),
    );
    let scheduler = builder
        .register(PAGE, executor.clone())
        .expect_task_types(&[PAGE])
        .build()
        .unwrap();

    let runner = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.start().await })
    };
    scheduler.start().await;

    tokio::time::timeout(Duration::from_secs(10), runner)
        .await
        .expect("executor loop did not finish")
        .unwrap()
        .unwrap();
    scheduler.wait_idle().await;
    scheduler.stop().await;
    (scheduler, executor)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crawl_runs_to_completion_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteTaskStore::open(dir.path().join("flow.db")).await.unwrap());

    let seeds = (0..3)
        .map(|i| NewTask::new(format!("https://shop.test/c{i}"), PAGE).with_source("seed"))
        .collect();
    assert_eq!(store.add_multiple_tasks(seeds).await.unwrap(), 3);

    let (scheduler, _executor) = drive(
        store.clone(),
        CrawlHandler,
        SchedulerOptions::new().max_parallel(3).poll_interval_ms(20),
    )
    .await;

    let counts = store.counts_by_status().await.unwrap();
    assert_eq!(counts.completed, 6);
    assert_eq!(counts.total(), 6);

    let stats = scheduler.stats().await;
    assert_eq!(stats.total_processed, 6);
    assert_eq!(stats.total_errors, 0);
    assert!(
        store
            .result_for_url("https://shop.test/c2/detail")
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn breaker_halts_intake_and_stops_the_executor() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteTaskStore::open(dir.path().join("breaker.db")).await.unwrap());

    let seeds = (0..10)
        .map(|i| NewTask::new(format!("https://shop.test/down/{i}"), PAGE))
        .collect();
    store.add_multiple_tasks(seeds).await.unwrap();

    let (scheduler, executor) = drive(
        store.clone(),
        AlwaysFails,
        SchedulerOptions::new()
            .max_parallel(1)
            .poll_interval_ms(20)
            .error_rate_threshold(0.5)
            .min_processed_before_stop(4),
    )
    .await;

    assert!(!scheduler.is_running());
    assert!(executor.is_stopped());

    let stats = scheduler.stats().await;
    assert_eq!(stats.total_processed, 4);
    assert_eq!(stats.total_errors, 4);

    let counts = store.counts_by_status().await.unwrap();
    assert_eq!(counts.failed, 4);
    assert_eq!(counts.pending, 6);

    let record = store
        .failure_record("https://shop.test/down/0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.fail_count, 1);
    assert_eq!(record.latest_reason, "HTTP 500 for https://shop.test/down/0");

    let first = store.get_task(TaskId::new(1)).await.unwrap().unwrap();
    assert_eq!(first.status, TaskStatus::Failed);
}
