use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{ResultRecordId, TaskId, TaskType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Json,
    Text,
    Html,
}

impl PayloadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadKind::Json => "json",
            PayloadKind::Text => "text",
            PayloadKind::Html => "html",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(PayloadKind::Json),
            "text" => Ok(PayloadKind::Text),
            "html" => Ok(PayloadKind::Html),
            other => Err(format!("unknown payload kind {other:?}")),
        }
    }
}

/// Input for `TaskStore::store_result` (upsert keyed by URL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewResult {
    pub url: String,
    pub task_type: TaskType,
    pub payload: String,
    pub payload_kind: PayloadKind,
    pub task_id: TaskId,
}

impl NewResult {
    /// Result whose payload is a serialized JSON document.
    pub fn json<T: Serialize>(
        task_id: TaskId,
        url: impl Into<String>,
        task_type: impl Into<TaskType>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            url: url.into(),
            task_type: task_type.into(),
            payload: serde_json::to_string(value)?,
            payload_kind: PayloadKind::Json,
            task_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: ResultRecordId,
    pub url: String,
    pub task_type: TaskType,
    pub payload: String,
    pub payload_kind: PayloadKind,
    pub task_id: TaskId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_result_serializes_payload() {
        let result = NewResult::json(
            TaskId::new(1),
            "https://example.test/a",
            "catalog.page",
            &serde_json::json!({ "title": "A" }),
        )
        .unwrap();

        assert_eq!(result.payload_kind, PayloadKind::Json);
        assert_eq!(result.payload, r#"{"title":"A"}"#);
    }

    #[test]
    fn payload_kind_round_trips_through_str() {
        for kind in [PayloadKind::Json, PayloadKind::Text, PayloadKind::Html] {
            assert_eq!(kind.as_str().parse::<PayloadKind>(), Ok(kind));
        }
    }
}
