//! ExecutorRegistry - task_type から Executor へのマッピング
//!
//! Unlike a build-once handler table, executors can be registered while the
//! scheduler is running, so the map sits behind an async `RwLock`.
//! Registering a type twice is last-write-wins: the old executor is replaced
//! and a warning is logged.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::TaskType;
use crate::ports::Executor;

#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<TaskType, Arc<dyn Executor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry up front. Later entries win on duplicate types.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (TaskType, Arc<dyn Executor>)>,
    {
        let mut executors = HashMap::new();
        for (task_type, executor) in entries {
            if executors.insert(task_type.clone(), executor).is_some() {
                warn!(%task_type, "executor already registered, overwriting");
            }
        }
        Self {
            executors: RwLock::new(executors),
        }
    }

    /// Register `executor` for `task_type`, returning the executor it replaced.
    pub async fn register(
        &self,
        task_type: impl Into<TaskType>,
        executor: Arc<dyn Executor>,
    ) -> Option<Arc<dyn Executor>> {
        let task_type = task_type.into();
        let previous = self
            .executors
            .write()
            .await
            .insert(task_type.clone(), executor);

        if previous.is_some() {
            warn!(%task_type, "executor already registered, overwriting");
        } else {
            info!(%task_type, "executor registered");
        }
        previous
    }

    pub async fn get(&self, task_type: &str) -> Option<Arc<dyn Executor>> {
        self.executors.read().await.get(task_type).cloned()
    }

    /// Registered types, sorted.
    pub async fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.executors.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    /// Snapshot of every registered executor (used for the on_stop broadcast).
    pub async fn all(&self) -> Vec<Arc<dyn Executor>> {
        self.executors.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.executors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executors.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Task;
    use crate::error::ExecutorError;
    use async_trait::async_trait;

    struct NamedExecutor {
        task_type: TaskType,
        name: &'static str,
    }

    impl NamedExecutor {
        fn new(task_type: &str, name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                task_type: TaskType::new(task_type),
                name,
            })
        }
    }

    #[async_trait]
    impl Executor for NamedExecutor {
        fn task_type(&self) -> &TaskType {
            &self.task_type
        }

        async fn start(&self) -> Result<(), ExecutorError> {
            Ok(())
        }

        async fn run(&self, _task: Task) -> Result<(), ExecutorError> {
            Err(ExecutorError::failed(self.name))
        }
    }

    async fn name_of(registry: &ExecutorRegistry, task_type: &str) -> Option<String> {
        let executor = registry.get(task_type).await?;
        let dummy = Task {
            id: crate::domain::TaskId::new(1),
            url: "https://example.test".to_string(),
            task_type: TaskType::new(task_type),
            status: crate::domain::TaskStatus::InProgress,
            source: None,
            created_at: chrono::Utc::now(),
            failure_record_id: None,
        };
        match executor.run(dummy).await {
            Err(ExecutorError::Failed(name)) => Some(name),
            _ => None,
        }
    }

    #[tokio::test]
    async fn register_and_get() {
        let registry = ExecutorRegistry::new();
        let previous = registry
            .register("catalog.page", NamedExecutor::new("catalog.page", "first"))
            .await;

        assert!(previous.is_none());
        assert!(registry.get("catalog.page").await.is_some());
        assert!(registry.get("catalog.item").await.is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn duplicate_registration_overwrites() {
        let registry = ExecutorRegistry::new();
        registry
            .register("catalog.page", NamedExecutor::new("catalog.page", "first"))
            .await;
        let previous = registry
            .register("catalog.page", NamedExecutor::new("catalog.page", "second"))
            .await;

        assert!(previous.is_some());
        assert_eq!(registry.len().await, 1);
        assert_eq!(name_of(&registry, "catalog.page").await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn from_entries_is_last_write_wins() {
        let registry = ExecutorRegistry::from_entries([
            (TaskType::new("a"), NamedExecutor::new("a", "first") as Arc<dyn Executor>),
            (TaskType::new("b"), NamedExecutor::new("b", "only") as Arc<dyn Executor>),
            (TaskType::new("a"), NamedExecutor::new("a", "second") as Arc<dyn Executor>),
        ]);

        assert_eq!(
            registry.registered_types().await,
            vec![TaskType::new("a"), TaskType::new("b")]
        );
        assert_eq!(name_of(&registry, "a").await.as_deref(), Some("second"));
        assert_eq!(registry.all().await.len(), 2);
    }
}
