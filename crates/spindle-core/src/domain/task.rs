use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use super::{FailureRecordId, TaskId, TaskStatus};

/// Name that selects which executor handles a task, e.g. `catalog.page`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for TaskType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A unit of work as persisted by the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub url: String,
    pub task_type: TaskType,
    pub status: TaskStatus,

    /// Free-form provenance (seed file, parent task, ...).
    pub source: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Set when the task fails; points at the per-URL failure record.
    pub failure_record_id: Option<FailureRecordId>,
}

/// Ingestion input for `TaskStore::add_task` / `add_multiple_tasks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub url: String,
    pub task_type: TaskType,
    pub source: Option<String>,
}

impl NewTask {
    pub fn new(url: impl Into<String>, task_type: impl Into<TaskType>) -> Self {
        Self {
            url: url.into(),
            task_type: task_type.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}
