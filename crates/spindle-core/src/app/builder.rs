//! SchedulerBuilder - スケジューラの構築とワイヤリング
//!
//! # ポイント
//! - Builder パターン
//! - 起動時検証（Fail-fast 設計）：期待する task_type が揃っていなければ build() で失敗

use std::collections::BTreeSet;
use std::sync::Arc;

use super::completion::CompletionBridge;
use super::config::{SchedulerConfig, SchedulerOptions};
use super::registry::ExecutorRegistry;
use super::scheduler::{ExecutorContext, Scheduler};
use crate::domain::TaskType;
use crate::error::ConfigError;
use crate::ports::{Executor, TaskStore};

/// Builds a [`Scheduler`].
///
/// # 使用例
/// ```ignore
/// let builder = SchedulerBuilder::new(store).options(SchedulerOptions::new().max_parallel(4));
/// let executor = Arc::new(QueueExecutor::new("catalog.page", handler, builder.context()));
/// let scheduler = builder
///     .register("catalog.page", executor)
///     .expect_task_types(&["catalog.page"])
///     .build()?;
/// ```
///
/// The completion bridge is created here, before the scheduler, so executors
/// can be given their [`ExecutorContext`] before they are registered.
pub struct SchedulerBuilder {
    store: Arc<dyn TaskStore>,
    completions: Arc<CompletionBridge>,
    config: SchedulerConfig,
    options: SchedulerOptions,
    executors: Vec<(TaskType, Arc<dyn Executor>)>,
    expected: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SchedulerBuilder {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            completions: Arc::new(CompletionBridge::new()),
            config: SchedulerConfig::default(),
            options: SchedulerOptions::default(),
            executors: Vec::new(),
            expected: None,
        }
    }

    /// Replace the base configuration (defaults otherwise).
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides merged on top of the base configuration at `build`.
    pub fn options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn context(&self) -> ExecutorContext {
        ExecutorContext::new(Arc::clone(&self.store), Arc::clone(&self.completions))
    }

    /// Register an executor. A later registration for the same type wins.
    pub fn register(mut self, task_type: impl Into<TaskType>, executor: Arc<dyn Executor>) -> Self {
        self.executors.push((task_type.into(), executor));
        self
    }

    /// Task types that must have an executor by the time `build` runs.
    pub fn expect_task_types(mut self, task_types: &[&str]) -> Self {
        self.expected = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// # 検証
    /// - 設定値（merge 後）の validate
    /// - expect_task_types() で指定した型が全て登録済みか
    pub fn build(self) -> Result<Arc<Scheduler>, BuildError> {
        let mut config = self.config;
        config.merge(&self.options);
        config.validate()?;

        if let Some(expected) = &self.expected {
            let registered: BTreeSet<&str> =
                self.executors.iter().map(|(t, _)| t.as_str()).collect();
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| !registered.contains(t.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing));
            }
        }

        Ok(Scheduler::from_parts(
            self.store,
            self.completions,
            ExecutorRegistry::from_entries(self.executors),
            config,
        ))
    }
}
