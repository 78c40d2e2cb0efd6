//! QueueExecutor - 内部キューを持つ汎用 Executor
//!
//! # フロー
//! 1. `run(task)` が完了ハンドルを作り、WorkUnit を内部キューに積んで待つ
//! 2. `start()` のループがキューから取り出し、最大 `concurrency` 件まで並行に
//!    `WorkHandler::handle` を実行
//! 3. handler の結果で CompletionBridge を resolve / reject
//!
//! `start()` returns once the internal queue is empty, nothing is in flight,
//! and the task store has no pending tasks (or the executor was stopped).
//! A `run` that arrives after the loop has finished is rejected with
//! `ExecutorError::Stopped` instead of being queued.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::app::ExecutorContext;
use crate::domain::{NewResult, NewTask, ResultRecord, Task, TaskId, TaskType};
use crate::error::{ExecutorError, SpindleError};
use crate::ports::{Executor, TaskStore};

const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(200);

/// One item on the internal queue, tagged with the task it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub task_id: TaskId,
    pub url: String,
    pub task_type: TaskType,
}

impl From<Task> for WorkUnit {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            url: task.url,
            task_type: task.task_type,
        }
    }
}

/// Store access handed to a [`WorkHandler`].
#[derive(Clone)]
pub struct WorkContext {
    store: Arc<dyn TaskStore>,
}

impl WorkContext {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Queue a follow-up task.
    pub async fn enqueue(&self, task: NewTask) -> Result<TaskId, SpindleError> {
        Ok(self.store.add_task(task).await?)
    }

    /// Queue follow-up tasks, skipping URLs the store already knows.
    pub async fn enqueue_many(&self, tasks: Vec<NewTask>) -> Result<usize, SpindleError> {
        Ok(self.store.add_multiple_tasks(tasks).await?)
    }

    pub async fn store_result(&self, result: NewResult) -> Result<ResultRecord, SpindleError> {
        Ok(self.store.store_result(result).await?)
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }
}

/// The actual work behind a [`QueueExecutor`].
///
/// # 使用例
/// ```ignore
/// struct PageHandler;
///
/// #[async_trait]
/// impl WorkHandler for PageHandler {
///     async fn handle(&self, unit: &WorkUnit, ctx: &WorkContext) -> Result<(), SpindleError> {
///         ctx.enqueue(NewTask::new(format!("{}/next", unit.url), "catalog.page")).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
    async fn handle(&self, unit: &WorkUnit, ctx: &WorkContext) -> Result<(), SpindleError>;
}

pub struct QueueExecutor<H: WorkHandler> {
    task_type: TaskType,
    handler: Arc<H>,
    ctx: ExecutorContext,
    concurrency: usize,
    idle_poll: Duration,
    queue: Mutex<VecDeque<WorkUnit>>,
    notify: Notify,
    stopped: AtomicBool,
    /// Set when `start()` exits. Flipped only while the queue lock is held.
    finished: AtomicBool,
    /// `run` calls that have not returned yet.
    accepted: AtomicUsize,
}

impl<H: WorkHandler> QueueExecutor<H> {
    pub fn new(task_type: impl Into<TaskType>, handler: H, ctx: ExecutorContext) -> Self {
        Self {
            task_type: task_type.into(),
            handler: Arc::new(handler),
            ctx,
            concurrency: 1,
            idle_poll: DEFAULT_IDLE_POLL,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            stopped: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            accepted: AtomicUsize::new(0),
        }
    }

    /// Maximum concurrent handler calls (at least 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// How often an idle loop re-checks the store for pending tasks.
    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }

    fn spawn_unit(&self, in_flight: &mut JoinSet<()>, unit: WorkUnit) {
        let handler = Arc::clone(&self.handler);
        let ctx = WorkContext::new(Arc::clone(self.ctx.store()));
        let completions = Arc::clone(self.ctx.completions());

        in_flight.spawn(async move {
            let task_id = unit.task_id;
            // ハンドルが既に決着済み（timeout 等）なら handler を走らせない
            if !completions.contains(task_id).await {
                debug!(%task_id, url = %unit.url, "completion already settled, dropping work unit");
                return;
            }

            // 別タスクで実行して handler の panic も reject に変換する
            let joined = tokio::spawn(async move { handler.handle(&unit, &ctx).await }).await;

            let outcome = match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(ExecutorError::failed(err.to_string())),
                Err(err) => Err(ExecutorError::failed(format!("handler panicked: {err}"))),
            };

            match outcome {
                Ok(()) => {
                    completions.resolve(task_id).await;
                }
                Err(err) => {
                    debug!(%task_id, error = %err, "work unit failed");
                    completions.reject(task_id, err).await;
                }
            }
        });
    }

    /// Idle: nothing queued, nothing running, no `run` waiting, and either
    /// stopped or no pending tasks left in the store.
    async fn drained(&self, in_flight: &JoinSet<()>) -> Result<bool, ExecutorError> {
        if !in_flight.is_empty()
            || self.accepted.load(Ordering::Acquire) > 0
            || !self.queue.lock().await.is_empty()
        {
            return Ok(false);
        }
        if self.is_stopped() {
            return Ok(true);
        }
        let pending = self
            .ctx
            .store()
            .has_pending_tasks()
            .await
            .map_err(|e| ExecutorError::failed(e.to_string()))?;
        Ok(!pending)
    }

    /// Mark the loop finished unless a `run` slipped in after `drained`.
    async fn finish(&self) -> bool {
        let queue = self.queue.lock().await;
        if !queue.is_empty() || self.accepted.load(Ordering::Acquire) > 0 {
            return false;
        }
        self.finished.store(true, Ordering::Release);
        true
    }

    fn not_accepting(&self) -> ExecutorError {
        ExecutorError::Stopped(format!("{} executor is not accepting work", self.task_type))
    }
}

#[async_trait]
impl<H: WorkHandler> Executor for QueueExecutor<H> {
    fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    async fn start(&self) -> Result<(), ExecutorError> {
        info!(task_type = %self.task_type, concurrency = self.concurrency, "executor loop started");
        self.finished.store(false, Ordering::Release);
        let mut in_flight = JoinSet::new();

        loop {
            while in_flight.len() < self.concurrency {
                let Some(unit) = self.queue.lock().await.pop_front() else {
                    break;
                };
                self.spawn_unit(&mut in_flight, unit);
            }

            if self.drained(&in_flight).await? && self.finish().await {
                break;
            }

            tokio::select! {
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.idle_poll) => {}
            }
        }

        info!(task_type = %self.task_type, "executor loop finished");
        Ok(())
    }

    async fn run(&self, task: Task) -> Result<(), ExecutorError> {
        if self.is_stopped() {
            return Err(self.not_accepting());
        }
        if task.task_type != self.task_type {
            return Err(ExecutorError::failed(format!(
                "task type mismatch: expected {}, got {}",
                self.task_type, task.task_type
            )));
        }

        {
            // finish() checks `accepted` under the same lock
            let _queue = self.queue.lock().await;
            if self.finished.load(Ordering::Acquire) {
                debug!(task_id = %task.id, "executor loop already finished");
                return Err(self.not_accepting());
            }
            self.accepted.fetch_add(1, Ordering::AcqRel);
        }
        let completion = self.ctx.completions().create(task.id).await;
        self.queue.lock().await.push_back(WorkUnit::from(task));
        self.notify.notify_one();

        let outcome = completion.wait().await;
        self.accepted.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_one();
        outcome
    }

    fn on_stop(&self, reason: &str) {
        warn!(task_type = %self.task_type, reason, "executor stopping");
        self.stopped.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{Scheduler, SchedulerBuilder, SchedulerOptions};
    use crate::domain::{FailureRecord, StatusCounts, TaskStatus};
    use crate::error::StoreError;
    use crate::impls::InMemoryTaskStore;
    use std::sync::Mutex as StdMutex;

    /// Records every URL it sees; fails URLs containing "broken"; follows
    /// `/next` links up to `max_depth`.
    struct PageHandler {
        seen: StdMutex<Vec<String>>,
        max_depth: usize,
    }

    impl PageHandler {
        fn new(max_depth: usize) -> Self {
            Self {
                seen: StdMutex::new(Vec::new()),
                max_depth,
            }
        }
    }

    #[async_trait]
    impl WorkHandler for PageHandler {
        async fn handle(&self, unit: &WorkUnit, ctx: &WorkContext) -> Result<(), SpindleError> {
            self.seen.lock().unwrap().push(unit.url.clone());
            if unit.url.contains("broken") {
                return Err(SpindleError::handler(format!("cannot parse {}", unit.url)));
            }

            let depth = unit.url.matches("/next").count();
            if depth < self.max_depth {
                ctx.enqueue(NewTask::new(format!("{}/next", unit.url), unit.task_type.clone()))
                    .await?;
            }

            let result = NewResult::json(
                unit.task_id,
                unit.url.clone(),
                unit.task_type.clone(),
                &serde_json::json!({ "depth": depth }),
            )?;
            ctx.store_result(result).await?;
            Ok(())
        }
    }

    async fn run_to_completion(
        store: Arc<InMemoryTaskStore>,
        handler: PageHandler,
        options: SchedulerOptions,
    ) -> (Arc<Scheduler>, Arc<QueueExecutor<PageHandler>>) {
        let builder = SchedulerBuilder::new(store).options(options);
        let executor = Arc::new(
            QueueExecutor::new("catalog.page", handler, builder.context())
                .with_concurrency(2)
                .with_idle_poll(Duration::from_millis(100)),
        );
        let scheduler = builder
            .register("catalog.page", executor.clone())
            .expect_task_types(&["catalog.page"])
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
    async fn processes_dispatched_tasks_until_drained() {
        let store = Arc::new(InMemoryTaskStore::new());
        for i in 0..3 {
            store
                .add_task(NewTask::new(format!("https://shop.test/p{i}"), "catalog.page"))
                .await
                .unwrap();
        }

        let (scheduler, executor) = run_to_completion(
            store.clone(),
            PageHandler::new(0),
            SchedulerOptions::new().max_parallel(5).poll_interval_ms(20),
        )
        .await;

        assert_eq!(store.counts_by_status().await.unwrap().completed, 3);
        assert_eq!(executor.handler().seen.lock().unwrap().len(), 3);
        assert!(store.result_for_url("https://shop.test/p1").await.unwrap().is_some());
        assert_eq!(scheduler.completions().pending_count().await, 0);
        assert_eq!(executor.queued().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn follow_up_tasks_are_picked_up() {
        let store = Arc::new(InMemoryTaskStore::new());
        store
            .add_task(NewTask::new("https://shop.test/root", "catalog.page"))
            .await
            .unwrap();

        let (scheduler, _executor) = run_to_completion(
            store.clone(),
            PageHandler::new(2),
            SchedulerOptions::new().max_parallel(2).poll_interval_ms(20),
        )
        .await;

        let counts = store.counts_by_status().await.unwrap();
        assert_eq!(counts.completed, 3);
        assert_eq!(counts.pending, 0);
        assert!(
            store
                .result_for_url("https://shop.test/root/next/next")
                .await
                .unwrap()
                .is_some()
        );
        assert_eq!(scheduler.stats().await.total_processed, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn handler_errors_fail_the_task() {
        let store = Arc::new(InMemoryTaskStore::new());
        let ok = store
            .add_task(NewTask::new("https://shop.test/fine", "catalog.page"))
            .await
            .unwrap();
        let broken = store
            .add_task(NewTask::new("https://shop.test/broken", "catalog.page"))
            .await
            .unwrap();

        let (scheduler, _executor) = run_to_completion(
            store.clone(),
            PageHandler::new(0),
            SchedulerOptions::new().max_parallel(2).poll_interval_ms(20),
        )
        .await;

        assert_eq!(store.get_task(ok).await.unwrap().unwrap().status, TaskStatus::Completed);
        assert_eq!(store.get_task(broken).await.unwrap().unwrap().status, TaskStatus::Failed);

        let record = store
            .failure_record("https://shop.test/broken")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.latest_reason, "cannot parse https://shop.test/broken");
        assert_eq!(scheduler.stats().await.total_errors, 1);
    }

    fn standalone_executor(store: Arc<InMemoryTaskStore>) -> QueueExecutor<PageHandler> {
        let builder = SchedulerBuilder::new(store);
        QueueExecutor::new("catalog.page", PageHandler::new(0), builder.context())
    }

    fn task(task_type: &str) -> Task {
        Task {
            id: TaskId::new(1),
            url: "https://shop.test/x".to_string(),
            task_type: TaskType::new(task_type),
            status: TaskStatus::InProgress,
            source: None,
            created_at: chrono::Utc::now(),
            failure_record_id: None,
        }
    }

    #[tokio::test]
    async fn stopped_executor_rejects_new_runs() {
        let executor = standalone_executor(Arc::new(InMemoryTaskStore::new()));
        executor.on_stop("error rate 0.50 over 10 tasks (threshold 0.3)");

        assert!(executor.is_stopped());
        assert!(matches!(
            executor.run(task("catalog.page")).await,
            Err(ExecutorError::Stopped(_))
        ));
        // stopped and empty: the loop exits right away
        executor.start().await.unwrap();
    }

    #[tokio::test]
    async fn mismatched_task_type_is_rejected() {
        let executor = standalone_executor(Arc::new(InMemoryTaskStore::new()));
        let err = executor.run(task("catalog.item")).await.unwrap_err();
        assert!(err.to_string().contains("task type mismatch"));
        assert_eq!(executor.queued().await, 0);
    }

    #[tokio::test]
    async fn start_returns_when_store_is_empty() {
        let executor = standalone_executor(Arc::new(InMemoryTaskStore::new()));
        tokio::time::timeout(Duration::from_secs(1), executor.start())
            .await
            .unwrap()
            .unwrap();
    }

    /// Sleeps after each successful claim, widening the gap between the claim
    /// and the executor's `run`.
    struct SlowClaimStore {
        inner: InMemoryTaskStore,
        delay: Duration,
    }

    #[async_trait]
    impl TaskStore for SlowClaimStore {
        async fn claim_next(&self) -> Result<Option<Task>, StoreError> {
            let claimed = self.inner.claim_next().await?;
            if claimed.is_some() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(claimed)
        }

        async fn mark_completed(&self, id: TaskId) -> Result<(), StoreError> {
            self.inner.mark_completed(id).await
        }

        async fn mark_failed(&self, id: TaskId, reason: &str) -> Result<FailureRecord, StoreError> {
            self.inner.mark_failed(id, reason).await
        }

        async fn release(&self, id: TaskId) -> Result<(), StoreError> {
            self.inner.release(id).await
        }

        async fn has_pending_tasks(&self) -> Result<bool, StoreError> {
            self.inner.has_pending_tasks().await
        }

        async fn add_task(&self, task: NewTask) -> Result<TaskId, StoreError> {
            self.inner.add_task(task).await
        }

        async fn add_multiple_tasks(&self, tasks: Vec<NewTask>) -> Result<usize, StoreError> {
            self.inner.add_multiple_tasks(tasks).await
        }

        async fn store_result(&self, result: NewResult) -> Result<ResultRecord, StoreError> {
            self.inner.store_result(result).await
        }

        async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
            self.inner.get_task(id).await
        }

        async fn failure_record(&self, url: &str) -> Result<Option<FailureRecord>, StoreError> {
            self.inner.failure_record(url).await
        }

        async fn result_for_url(&self, url: &str) -> Result<Option<ResultRecord>, StoreError> {
            self.inner.result_for_url(url).await
        }

        async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
            self.inner.counts_by_status().await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn run_after_the_loop_finished_is_rejected() {
        let store = Arc::new(SlowClaimStore {
            inner: InMemoryTaskStore::new(),
            delay: Duration::from_millis(300),
        });
        let id = store
            .add_task(NewTask::new("https://shop.test/slow", "catalog.page"))
            .await
            .unwrap();

        let builder = SchedulerBuilder::new(store.clone())
            .options(SchedulerOptions::new().max_parallel(1).poll_interval_ms(60_000));
        let executor = Arc::new(
            QueueExecutor::new("catalog.page", PageHandler::new(0), builder.context())
                .with_idle_poll(Duration::from_millis(50)),
        );
        let scheduler = builder
            .register("catalog.page", executor.clone())
            .build()
            .unwrap();

        let runner = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.start().await })
        };
        // the row is in_progress for 300ms before run() is called
        scheduler.start().await;

        tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .expect("executor loop did not finish")
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), scheduler.wait_idle())
            .await
            .expect("dispatched task was never settled");
        scheduler.stop().await;

        assert_eq!(store.get_task(id).await.unwrap().unwrap().status, TaskStatus::Failed);
        assert_eq!(executor.queued().await, 0);
        assert!(executor.handler().seen.lock().unwrap().is_empty());
        let record = store
            .failure_record("https://shop.test/slow")
            .await
            .unwrap()
            .unwrap();
        assert!(record.latest_reason.contains("not accepting work"));
    }

    #[tokio::test]
    async fn settled_work_units_are_dropped_unrun() {
        let store = Arc::new(InMemoryTaskStore::new());
        store
            .add_task(NewTask::new("https://shop.test/late", "catalog.page"))
            .await
            .unwrap();
        let claimed = store.claim_next().await.unwrap().unwrap();
        let id = claimed.id;

        let executor = Arc::new(standalone_executor(store.clone()));
        let waiting = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.run(claimed).await })
        };
        while executor.queued().await == 0 {
            tokio::task::yield_now().await;
        }

        // the handle is settled before the loop ever sees the unit
        let limit = Duration::from_millis(50);
        assert!(
            executor
                .ctx
                .completions()
                .reject(id, ExecutorError::TimedOut(limit))
                .await
        );
        assert_eq!(waiting.await.unwrap(), Err(ExecutorError::TimedOut(limit)));

        tokio::time::timeout(Duration::from_secs(1), executor.start())
            .await
            .unwrap()
            .unwrap();

        assert!(executor.handler().seen.lock().unwrap().is_empty());
        assert_eq!(executor.queued().await, 0);
        assert!(store.result_for_url("https://shop.test/late").await.unwrap().is_none());
    }
}
