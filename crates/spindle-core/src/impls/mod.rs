//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: 開発用・テスト用の TaskStore
//! - **SqliteTaskStore**: SQLite (sqlx) による永続 TaskStore
//! - **QueueExecutor**: 内部キュー + WorkHandler による汎用 Executor

pub mod inmem_store;
pub mod queue_executor;
pub mod sqlite_store;

pub use self::inmem_store::InMemoryTaskStore;
pub use self::queue_executor::{QueueExecutor, WorkContext, WorkHandler, WorkUnit};
pub use self::sqlite_store::SqliteTaskStore;
