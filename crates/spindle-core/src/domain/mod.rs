//! Domain model: tasks, their lifecycle, failure records and results.

pub mod failure;
pub mod ids;
pub mod result;
pub mod state;
pub mod task;

pub use self::failure::FailureRecord;
pub use self::ids::{FailureRecordId, ResultRecordId, TaskId};
pub use self::result::{NewResult, PayloadKind, ResultRecord};
pub use self::state::{StatusCounts, TaskStatus, UnknownStatus};
pub use self::task::{NewTask, Task, TaskType};
