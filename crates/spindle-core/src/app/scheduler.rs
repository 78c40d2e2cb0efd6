//! Scheduler - ポーリング・ディスパッチ・決着
//!
//! # フロー
//! 1. `tick()` で TaskStore から pending タスクを claim（max_parallel まで）
//! 2. ExecutorRegistry で task_type に対応する Executor を引く
//! 3. `Executor::run(task)` を spawn（fire-and-forget）
//! 4. 決着時に mark_completed / mark_failed、カウンタ更新、CircuitBreaker 判定
//!
//! There is no global instance: construct a `Scheduler` explicitly, share it
//! as `Arc<Scheduler>`, and hand executors an [`ExecutorContext`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::breaker::{CircuitBreaker, Trip};
use super::completion::CompletionBridge;
use super::config::{MissingExecutorPolicy, SchedulerConfig, SchedulerOptions};
use super::registry::ExecutorRegistry;
use crate::domain::{Task, TaskId, TaskType};
use crate::error::{ConfigError, ExecutorError};
use crate::ports::{Executor, TaskStore};

/// What an executor needs from the scheduler: the store (for follow-up tasks
/// and results) and the completion bridge.
#[derive(Clone)]
pub struct ExecutorContext {
    store: Arc<dyn TaskStore>,
    completions: Arc<CompletionBridge>,
}

impl ExecutorContext {
    pub fn new(store: Arc<dyn TaskStore>, completions: Arc<CompletionBridge>) -> Self {
        Self { store, completions }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn completions(&self) -> &Arc<CompletionBridge> {
        &self.completions
    }
}

/// Point-in-time view of the scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub active: usize,
    pub total_processed: u64,
    pub total_errors: u64,
    pub error_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    active: usize,
    total_processed: u64,
    total_errors: u64,
}

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    registry: ExecutorRegistry,
    completions: Arc<CompletionBridge>,
    config: RwLock<SchedulerConfig>,
    running: AtomicBool,
    ticking: AtomicBool,
    counters: Mutex<Counters>,
    idle: Notify,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// Held for the duration of one tick; a second tick that fails to acquire it
/// is dropped, not queued.
struct TickGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        config: SchedulerConfig,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Self::from_parts(
            store,
            Arc::new(CompletionBridge::new()),
            ExecutorRegistry::new(),
            config,
        ))
    }

    /// Assemble from pre-built parts. The caller has validated `config`.
    pub(crate) fn from_parts(
        store: Arc<dyn TaskStore>,
        completions: Arc<CompletionBridge>,
        registry: ExecutorRegistry,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            completions,
            config: RwLock::new(config),
            running: AtomicBool::new(false),
            ticking: AtomicBool::new(false),
            counters: Mutex::new(Counters::default()),
            idle: Notify::new(),
            shutdown: Mutex::new(None),
        })
    }

    /// Begin polling. Runs one tick immediately, then one per poll interval.
    /// Calling `start` on a running scheduler does nothing.
    pub async fn start(self: &Arc<Self>) {
        // running と stop sender は shutdown ロックの下で一緒に切り替える
        let stop_rx = {
            let mut shutdown = self.shutdown.lock().await;
            if self.running.swap(true, Ordering::AcqRel) {
                debug!("scheduler already running");
                return;
            }
            let (stop_tx, stop_rx) = oneshot::channel();
            // 古い ticker が残っていれば sender の drop で止まる
            *shutdown = Some(stop_tx);
            stop_rx
        };

        let period = self.config.read().await.poll_interval();
        info!(poll_interval_ms = period.as_millis() as u64, "scheduler started");

        self.tick().await;
        self.spawn_ticker(period, stop_rx);
    }

    /// Stop claiming new tasks. Dispatched tasks keep running and still settle.
    ///
    /// Returns whether the scheduler was running.
    pub async fn stop(&self) -> bool {
        let was_running = {
            let mut shutdown = self.shutdown.lock().await;
            let was_running = self.running.swap(false, Ordering::AcqRel);
            if let Some(stop_tx) = shutdown.take() {
                let _ = stop_tx.send(());
            }
            was_running
        };
        if was_running {
            info!("scheduler stopped");
        }
        was_running
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim and dispatch until the store is empty or `max_parallel` tasks are
    /// active. Overlapping calls return immediately.
    ///
    /// Tasks released for lack of an executor are held until the tick ends,
    /// so they never shadow the tasks queued behind them.
    pub async fn tick(self: &Arc<Self>) {
        let Some(_guard) = TickGuard::acquire(&self.ticking) else {
            debug!("tick already in progress, skipping");
            return;
        };

        let mut parked = Vec::new();
        while self.is_running() {
            let config = self.config.read().await.clone();
            if self.counters.lock().await.active >= config.max_parallel {
                break;
            }

            let task = match self.store.claim_next().await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(err) => {
                    error!(error = %err, "claim failed, ending tick");
                    break;
                }
            };

            match self.registry.get(task.task_type.as_str()).await {
                Some(executor) => {
                    self.dispatch(executor, task, config.completion_timeout())
                        .await
                }
                None => {
                    self.handle_missing_executor(task, config.missing_executor, &mut parked)
                        .await
                }
            }
        }

        self.release_parked(parked).await;
    }

    /// Merge `options` into the live configuration.
    ///
    /// max_parallel and breaker settings apply from the next tick or
    /// settlement; a new poll interval applies from the next `start`.
    pub async fn configure(&self, options: &SchedulerOptions) -> Result<(), ConfigError> {
        let mut config = self.config.write().await;
        let mut merged = config.clone();
        merged.merge(options);
        merged.validate()?;
        *config = merged;
        debug!(config = ?*config, "scheduler reconfigured");
        Ok(())
    }

    pub async fn config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    pub async fn register(
        &self,
        task_type: impl Into<TaskType>,
        executor: Arc<dyn Executor>,
    ) -> Option<Arc<dyn Executor>> {
        self.registry.register(task_type, executor).await
    }

    pub async fn executor(&self, task_type: &str) -> Option<Arc<dyn Executor>> {
        self.registry.get(task_type).await
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub fn completions(&self) -> &Arc<CompletionBridge> {
        &self.completions
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn context(&self) -> ExecutorContext {
        ExecutorContext::new(Arc::clone(&self.store), Arc::clone(&self.completions))
    }

    pub async fn stats(&self) -> SchedulerStats {
        let counters = self.counters.lock().await;
        let error_rate = if counters.total_processed == 0 {
            0.0
        } else {
            counters.total_errors as f64 / counters.total_processed as f64
        };
        SchedulerStats {
            running: self.is_running(),
            active: counters.active,
            total_processed: counters.total_processed,
            total_errors: counters.total_errors,
            error_rate,
        }
    }

    /// Resolve once no dispatched task is still active.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // 先に登録してからカウンタを見る（取りこぼし防止）
            notified.as_mut().enable();

            if self.counters.lock().await.active == 0 {
                return;
            }
            notified.await;
        }
    }

    fn spawn_ticker(self: &Arc<Self>, period: Duration, mut stop_rx: oneshot::Receiver<()>) {
        let scheduler: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately and start() has already ticked
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        let Some(scheduler) = scheduler.upgrade() else {
                            break;
                        };
                        // tick は途中で中断しない（claim 済みタスクを宙に浮かせない）
                        scheduler.tick().await;
                    }
                }
            }
            debug!("ticker exited");
        });
    }

    async fn dispatch(
        self: &Arc<Self>,
        executor: Arc<dyn Executor>,
        task: Task,
        timeout: Option<Duration>,
    ) {
        self.counters.lock().await.active += 1;
        debug!(
            task_id = %task.id,
            task_type = %task.task_type,
            url = %task.url,
            "dispatching task"
        );

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let task_id = task.id;
            let outcome = scheduler.execute(executor, task, timeout).await;
            scheduler.settle(task_id, outcome).await;
        });
    }

    async fn execute(
        &self,
        executor: Arc<dyn Executor>,
        task: Task,
        timeout: Option<Duration>,
    ) -> Result<(), ExecutorError> {
        let task_id = task.id;
        // 別タスクで走らせて panic を失敗として扱う
        let run = tokio::spawn(async move { executor.run(task).await });

        let joined = match timeout {
            None => run.await,
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(%task_id, timeout_ms = limit.as_millis() as u64, "completion timed out");
                    // late resolve/reject from the executor becomes a no-op
                    self.completions
                        .reject(task_id, ExecutorError::TimedOut(limit))
                        .await;
                    return Err(ExecutorError::TimedOut(limit));
                }
            },
        };

        joined.unwrap_or_else(|err| Err(ExecutorError::failed(format!("executor panicked: {err}"))))
    }

    async fn settle(&self, task_id: TaskId, outcome: Result<(), ExecutorError>) {
        match &outcome {
            Ok(()) => match self.store.mark_completed(task_id).await {
                Ok(()) => debug!(%task_id, "task completed"),
                Err(err) => error!(%task_id, error = %err, "failed to mark task completed"),
            },
            Err(reason) => {
                warn!(%task_id, error = %reason, "task failed");
                if let Err(err) = self.store.mark_failed(task_id, &reason.to_string()).await {
                    error!(%task_id, error = %err, "failed to mark task failed");
                }
            }
        }

        self.record(outcome.is_err()).await;

        {
            let mut counters = self.counters.lock().await;
            counters.active = counters.active.saturating_sub(1);
        }
        self.idle.notify_waiters();
    }

    /// Count one settled task and let the breaker decide.
    async fn record(&self, failed: bool) {
        let (processed, errors) = {
            let mut counters = self.counters.lock().await;
            counters.total_processed += 1;
            if failed {
                counters.total_errors += 1;
            }
            (counters.total_processed, counters.total_errors)
        };

        let breaker = CircuitBreaker::from_config(&*self.config.read().await);
        if let Some(breaker) = breaker
            && let Some(trip) = breaker.evaluate(processed, errors)
        {
            self.trip(trip).await;
        }
    }

    async fn trip(&self, trip: Trip) {
        let reason = trip.to_string();
        warn!(
            rate = trip.rate,
            processed = trip.processed,
            errors = trip.errors,
            threshold = trip.threshold,
            "circuit breaker tripped, stopping scheduler"
        );

        // 既に止まっていれば二重に通知しない
        if self.stop().await {
            for executor in self.registry.all().await {
                executor.on_stop(&reason);
            }
        }
    }

    async fn handle_missing_executor(
        &self,
        task: Task,
        policy: MissingExecutorPolicy,
        parked: &mut Vec<TaskId>,
    ) {
        error!(
            task_id = %task.id,
            task_type = %task.task_type,
            url = %task.url,
            %policy,
            "no executor registered for task type"
        );

        match policy {
            MissingExecutorPolicy::Fail => {
                let reason = ExecutorError::NotRegistered(task.task_type.to_string());
                if let Err(err) = self.store.mark_failed(task.id, &reason.to_string()).await {
                    error!(task_id = %task.id, error = %err, "failed to mark task failed");
                }
                self.record(true).await;
            }
            // released once the tick has claimed everything else
            MissingExecutorPolicy::Release => parked.push(task.id),
            MissingExecutorPolicy::Leave => {}
        }
    }

    async fn release_parked(&self, parked: Vec<TaskId>) {
        if parked.is_empty() {
            return;
        }
        debug!(count = parked.len(), "releasing tasks without an executor");
        for task_id in parked {
            if let Err(err) = self.store.release(task_id).await {
                error!(%task_id, error = %err, "failed to release task");
            }
        }
    }
}
