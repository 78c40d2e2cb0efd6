//! Ports - 抽象化レイヤー
//!
//! Traits the scheduler consumes. Implementations live in `impls`.

pub mod clock;
pub mod executor;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::Executor;
pub use self::task_store::TaskStore;
