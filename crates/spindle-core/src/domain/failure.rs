use serde::{Deserialize, Serialize};

use super::{FailureRecordId, TaskType};

/// Failures deduplicated by URL.
///
/// The first failure for a URL creates the record with `fail_count == 1`;
/// each later failure for the same URL overwrites `latest_reason` and bumps
/// the count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: FailureRecordId,
    pub url: String,
    pub task_type: TaskType,
    pub latest_reason: String,
    pub fail_count: u32,
}
