//! TaskStore port - the persistent queue the scheduler claims from.
//!
//! The scheduler only needs the claim and status-update operations; the
//! ingestion and result-sink operations are here because executors reach the
//! store through the same handle when they enqueue follow-up work.

use async_trait::async_trait;

use crate::domain::{
    FailureRecord, NewResult, NewTask, ResultRecord, StatusCounts, Task, TaskId,
};
use crate::error::StoreError;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Atomically take the oldest pending task and move it to in_progress.
    ///
    /// Implementations must make this a single conditional update so two
    /// concurrent callers can never both receive the same task. Losing the
    /// race is not an error: the loser just gets `None`.
    async fn claim_next(&self) -> Result<Option<Task>, StoreError>;

    /// in_progress -> completed.
    async fn mark_completed(&self, id: TaskId) -> Result<(), StoreError>;

    /// in_progress -> failed, upserting the failure record for the task's URL
    /// and linking the task to it.
    async fn mark_failed(&self, id: TaskId, reason: &str) -> Result<FailureRecord, StoreError>;

    /// Hand a claimed but undispatched task back to the queue
    /// (in_progress -> pending).
    async fn release(&self, id: TaskId) -> Result<(), StoreError>;

    async fn has_pending_tasks(&self) -> Result<bool, StoreError>;

    async fn add_task(&self, task: NewTask) -> Result<TaskId, StoreError>;

    /// Bulk insert. Rows whose URL already exists (in the store or earlier in
    /// the same batch) are skipped. Returns the number of rows inserted.
    async fn add_multiple_tasks(&self, tasks: Vec<NewTask>) -> Result<usize, StoreError>;

    /// Upsert keyed by URL.
    async fn store_result(&self, result: NewResult) -> Result<ResultRecord, StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    async fn failure_record(&self, url: &str) -> Result<Option<FailureRecord>, StoreError>;

    async fn result_for_url(&self, url: &str) -> Result<Option<ResultRecord>, StoreError>;

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError>;
}
