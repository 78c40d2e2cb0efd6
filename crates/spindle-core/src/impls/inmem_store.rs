//! InMemoryTaskStore - 開発用・テスト用の TaskStore
//!
//! Every operation runs inside one critical section on the store mutex,
//! which is what makes `claim_next` atomic here.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{
    FailureRecord, FailureRecordId, NewResult, NewTask, ResultRecord, ResultRecordId,
    StatusCounts, Task, TaskId, TaskStatus,
};
use crate::error::StoreError;
use crate::ports::{Clock, SystemClock, TaskStore};

#[derive(Default)]
struct InMemoryState {
    tasks: BTreeMap<TaskId, Task>,
    failures: HashMap<String, FailureRecord>,
    results: HashMap<String, ResultRecord>,
    next_task_id: i64,
    next_failure_id: i64,
    next_result_id: i64,
}

impl InMemoryState {
    fn allocate_task_id(&mut self) -> TaskId {
        self.next_task_id += 1;
        TaskId::new(self.next_task_id)
    }

    fn allocate_failure_id(&mut self) -> FailureRecordId {
        self.next_failure_id += 1;
        FailureRecordId::new(self.next_failure_id)
    }

    fn allocate_result_id(&mut self) -> ResultRecordId {
        self.next_result_id += 1;
        ResultRecordId::new(self.next_result_id)
    }

    fn insert(&mut self, new: NewTask, clock: &dyn Clock) -> TaskId {
        let id = self.allocate_task_id();
        self.tasks.insert(
            id,
            Task {
                id,
                url: new.url,
                task_type: new.task_type,
                status: TaskStatus::Pending,
                source: new.source,
                created_at: clock.now(),
                failure_record_id: None,
            },
        );
        id
    }

    /// Look up a task that must currently be in `from`.
    fn task_in(&mut self, id: TaskId, from: TaskStatus, to: TaskStatus) -> Result<&mut Task, StoreError> {
        let task = self.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if task.status != from {
            return Err(StoreError::InvalidTransition {
                id,
                from: task.status,
                to,
            });
        }
        Ok(task)
    }
}

pub struct InMemoryTaskStore {
    state: Mutex<InMemoryState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(InMemoryState::default()),
            clock,
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn claim_next(&self) -> Result<Option<Task>, StoreError> {
        let mut state = self.state.lock().await;

        // 最古の pending（created_at, id の順）
        let next = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .min_by_key(|t| (t.created_at, t.id))
            .map(|t| t.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let task = state.task_in(id, TaskStatus::Pending, TaskStatus::InProgress)?;
        task.status = TaskStatus::InProgress;
        Ok(Some(task.clone()))
    }

    async fn mark_completed(&self, id: TaskId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let task = state.task_in(id, TaskStatus::InProgress, TaskStatus::Completed)?;
        task.status = TaskStatus::Completed;
        Ok(())
    }

    async fn mark_failed(&self, id: TaskId, reason: &str) -> Result<FailureRecord, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let task = state.task_in(id, TaskStatus::InProgress, TaskStatus::Failed)?;
        let url = task.url.clone();
        let task_type = task.task_type.clone();

        let record = match state.failures.get_mut(&url) {
            Some(record) => {
                record.latest_reason = reason.to_string();
                record.task_type = task_type;
                record.fail_count += 1;
                record.clone()
            }
            None => {
                let record = FailureRecord {
                    id: state.allocate_failure_id(),
                    url: url.clone(),
                    task_type,
                    latest_reason: reason.to_string(),
                    fail_count: 1,
                };
                state.failures.insert(url, record.clone());
                record
            }
        };

        if let Some(task) = state.tasks.get_mut(&id) {
            task.status = TaskStatus::Failed;
            task.failure_record_id = Some(record.id);
        }
        Ok(record)
    }

    async fn release(&self, id: TaskId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let task = state.task_in(id, TaskStatus::InProgress, TaskStatus::Pending)?;
        task.status = TaskStatus::Pending;
        Ok(())
    }

    async fn has_pending_tasks(&self) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .any(|t| t.status == TaskStatus::Pending))
    }

    async fn add_task(&self, task: NewTask) -> Result<TaskId, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.insert(task, self.clock.as_ref()))
    }

    async fn add_multiple_tasks(&self, tasks: Vec<NewTask>) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let mut seen: HashSet<String> = state.tasks.values().map(|t| t.url.clone()).collect();

        let mut inserted = 0;
        for task in tasks {
            if !seen.insert(task.url.clone()) {
                continue;
            }
            state.insert(task, self.clock.as_ref());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn store_result(&self, result: NewResult) -> Result<ResultRecord, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let id = match state.results.get(&result.url) {
            Some(existing) => existing.id,
            None => state.allocate_result_id(),
        };

        let record = ResultRecord {
            id,
            url: result.url,
            task_type: result.task_type,
            payload: result.payload,
            payload_kind: result.payload_kind,
            task_id: result.task_id,
        };
        state.results.insert(record.url.clone(), record.clone());
        Ok(record)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.state.lock().await.tasks.get(&id).cloned())
    }

    async fn failure_record(&self, url: &str) -> Result<Option<FailureRecord>, StoreError> {
        Ok(self.state.lock().await.failures.get(url).cloned())
    }

    async fn result_for_url(&self, url: &str) -> Result<Option<ResultRecord>, StoreError> {
        Ok(self.state.lock().await.results.get(url).cloned())
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for task in state.tasks.values() {
            counts.add(task.status, 1);
        }
        Ok(counts)
    }
}
