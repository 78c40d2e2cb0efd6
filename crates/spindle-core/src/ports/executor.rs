//! Executor port - one implementation per task type.

use async_trait::async_trait;

use crate::domain::{Task, TaskType};
use crate::error::ExecutorError;

/// Performs the work for one task type.
///
/// Contract:
/// - `run` hands the task to the executor's own pipeline and resolves once
///   that specific task has finished. The executor settles the task's
///   completion handle exactly once, from wherever in its pipeline the work
///   actually concludes.
/// - `start` drives the internal pipeline and returns only when the internal
///   queue is drained *and* the task store has no pending tasks left, so it
///   does not exit while the scheduler may still be claiming work for it.
/// - `on_stop` is called when the scheduler halts (circuit breaker trip). It
///   should stop accepting new work; in-flight work may finish.
#[async_trait]
pub trait Executor: Send + Sync {
    fn task_type(&self) -> &TaskType;

    async fn start(&self) -> Result<(), ExecutorError>;

    async fn run(&self, task: Task) -> Result<(), ExecutorError>;

    fn on_stop(&self, reason: &str) {
        tracing::info!(task_type = %self.task_type(), reason, "on_stop called");
    }
}
