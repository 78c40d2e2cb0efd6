//! spindle-core
//!
//! Bounded-concurrency task scheduling over a persistent queue.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, state, failure, result）
//! - **ports**: 抽象化レイヤー（TaskStore, Executor, Clock）
//! - **app**: アプリケーションロジック（scheduler, registry, completion bridge, circuit breaker, builder, config）
//! - **impls**: 実装（InMemoryTaskStore, SqliteTaskStore, QueueExecutor）
//! - **error**: 層ごとのエラー型

pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;

pub use crate::app::{
    CompletionBridge, ExecutorContext, MissingExecutorPolicy, Scheduler, SchedulerBuilder,
    SchedulerConfig, SchedulerOptions, SchedulerStats,
};
pub use crate::error::{ConfigError, ExecutorError, SpindleError, StoreError};
pub use crate::ports::{Executor, TaskStore};
