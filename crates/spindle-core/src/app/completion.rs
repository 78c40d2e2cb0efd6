//! CompletionBridge - task_id ごとの one-shot 完了シグナル
//!
//! The scheduler awaits `Executor::run`; the executor finishes the work
//! somewhere deep in its own pipeline. The bridge connects the two: `run`
//! creates a handle and waits on it, the pipeline resolves or rejects it by
//! task id when the work concludes.
//!
//! Settling removes the handle under the same lock that finds it, so a handle
//! is consumed exactly once. Settling an id with no live handle (never
//! created, already settled, timed out) is a silent no-op.

use std::collections::HashMap;

use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use crate::domain::TaskId;
use crate::error::ExecutorError;

type Outcome = Result<(), ExecutorError>;

#[derive(Default)]
pub struct CompletionBridge {
    handles: Mutex<HashMap<TaskId, oneshot::Sender<Outcome>>>,
}

/// The waiting side of a completion handle.
#[derive(Debug)]
pub struct Completion {
    task_id: TaskId,
    rx: oneshot::Receiver<Outcome>,
}

impl Completion {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Wait for the handle to be settled.
    pub async fn wait(self) -> Outcome {
        self.rx.await.unwrap_or(Err(ExecutorError::Dropped))
    }
}

impl CompletionBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending handle for `task_id`.
    ///
    /// The scheduler never has two runs in flight for one task, so a live
    /// handle here means a caller broke that contract. The old waiter is
    /// rejected with `Superseded` rather than left hanging.
    pub async fn create(&self, task_id: TaskId) -> Completion {
        let (tx, rx) = oneshot::channel();
        let previous = self.handles.lock().await.insert(task_id, tx);
        if let Some(previous) = previous {
            warn!(%task_id, "completion handle already pending, superseding it");
            let _ = previous.send(Err(ExecutorError::Superseded));
        }
        Completion { task_id, rx }
    }

    /// Settle successfully. Returns whether a live handle was found.
    pub async fn resolve(&self, task_id: TaskId) -> bool {
        self.settle(task_id, Ok(())).await
    }

    /// Settle with an error. Returns whether a live handle was found.
    pub async fn reject(&self, task_id: TaskId, error: ExecutorError) -> bool {
        self.settle(task_id, Err(error)).await
    }

    pub async fn contains(&self, task_id: TaskId) -> bool {
        self.handles.lock().await.contains_key(&task_id)
    }

    pub async fn pending_count(&self) -> usize {
        self.handles.lock().await.len()
    }

    async fn settle(&self, task_id: TaskId, outcome: Outcome) -> bool {
        let Some(tx) = self.handles.lock().await.remove(&task_id) else {
            debug!(%task_id, "no pending completion handle, ignoring");
            return false;
        };
        // the waiter may have gone away (timeout); nothing to do then
        let _ = tx.send(outcome);
        true
    }
}
