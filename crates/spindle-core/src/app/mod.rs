//! App - アプリケーション層
//!
//! ports を組み合わせてスケジューリングを実装します。
//!
//! # 主要コンポーネント
//! - **Scheduler**: ポーリング・claim・dispatch・決着
//! - **ExecutorRegistry**: task_type → Executor
//! - **CompletionBridge**: task_id ごとの完了シグナル
//! - **CircuitBreaker**: エラー率による自動停止
//! - **SchedulerBuilder**: 構築とワイヤリング（Fail-fast 検証）
//! - **SchedulerConfig**: 設定（serde / 環境変数）

pub mod breaker;
pub mod builder;
pub mod completion;
pub mod config;
pub mod registry;
pub mod scheduler;

// 主要な型を再エクスポート
pub use self::breaker::{CircuitBreaker, Trip};
pub use self::builder::{BuildError, SchedulerBuilder};
pub use self::completion::{Completion, CompletionBridge};
pub use self::config::{MissingExecutorPolicy, SchedulerConfig, SchedulerOptions};
pub use self::registry::ExecutorRegistry;
pub use self::scheduler::{ExecutorContext, Scheduler, SchedulerStats};
