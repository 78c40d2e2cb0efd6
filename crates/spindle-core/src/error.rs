use std::time::Duration;

use thiserror::Error;

use crate::domain::{TaskId, TaskStatus};

/// Errors raised by a `TaskStore` implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Why a dispatched task did not complete successfully.
///
/// This is also the value carried through a completion handle, so it must be
/// cheap to clone and must not borrow anything.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("{0}")]
    Failed(String),

    #[error("executor stopped: {0}")]
    Stopped(String),

    #[error("no executor registered for task type '{0}'")]
    NotRegistered(String),

    #[error("completion timed out after {0:?}")]
    TimedOut(Duration),

    #[error("completion handle superseded by a newer dispatch")]
    Superseded,

    #[error("completion handle dropped before it was settled")]
    Dropped,
}

impl ExecutorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Crate-level error. Work handlers return this so they can `?` store calls
/// and their own failures alike.
#[derive(Debug, Error)]
pub enum SpindleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Handler(String),
}

impl SpindleError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}
