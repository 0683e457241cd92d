use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Opaque caller-supplied metadata attached to a task.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Created and waiting in the queue.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Generation succeeded; `result` is set.
    Completed,
    /// Generation or dispatch failed; `error` is set.
    Failed,
}

impl TaskStatus {
    /// Returns the wire representation used in stored records.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    /// Returns whether no further transition can leave this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Returns whether `self -> to` is an allowed edge.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "PROCESSING" => Ok(TaskStatus::Processing),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// Fields written alongside a status transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionFields {
    pub result: Option<String>,
    pub error: Option<String>,
}

impl TransitionFields {
    /// No extra fields (used for claiming a task).
    pub fn none() -> Self {
        Self::default()
    }

    /// Sets the generated result.
    pub fn result(text: impl Into<String>) -> Self {
        Self {
            result: Some(text.into()),
            error: None,
        }
    }

    /// Sets the failure description.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
        }
    }

    /// Field/value pairs as stored in the record.
    pub fn pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = Vec::with_capacity(2);
        if let Some(ref result) = self.result {
            pairs.push(("result", result.as_str()));
        }
        if let Some(ref error) = self.error {
            pairs.push(("error", error.as_str()));
        }
        pairs
    }
}

/// A text-generation task and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub prompt: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Creates a new PENDING task stamped with the current time.
    pub fn new(id: Uuid, prompt: impl Into<String>, metadata: Metadata) -> Self {
        let now = Utc::now();
        Self {
            id,
            prompt: prompt.into(),
            metadata,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a transition in place. The caller has already verified the
    /// expected status.
    pub fn apply(&mut self, to: TaskStatus, fields: TransitionFields, at: DateTime<Utc>) {
        self.status = to;
        self.updated_at = at;
        if fields.result.is_some() {
            self.result = fields.result;
        }
        if fields.error.is_some() {
            self.error = fields.error;
        }
    }

    /// Time between creation and the last transition.
    pub fn processing_time(&self) -> chrono::Duration {
        self.updated_at - self.created_at
    }

    /// Returns the client-facing view of this task.
    pub fn view(&self) -> TaskView {
        TaskView {
            task_id: self.id,
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }

    /// Flattens the task into hash fields for the Redis store.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, StoreError> {
        let mut fields = vec![
            ("id", self.id.to_string()),
            ("prompt", self.prompt.clone()),
            ("metadata", serde_json::to_string(&self.metadata)?),
            ("status", self.status.to_string()),
            ("created_at", self.created_at.to_rfc3339()),
            ("updated_at", self.updated_at.to_rfc3339()),
        ];
        if let Some(ref result) = self.result {
            fields.push(("result", result.clone()));
        }
        if let Some(ref error) = self.error {
            fields.push(("error", error.clone()));
        }
        Ok(fields)
    }

    /// Rebuilds a task from the hash fields written by [`Task::to_fields`].
    pub fn from_fields(id: Uuid, mut fields: HashMap<String, String>) -> Result<Self, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt { id, reason };

        let mut take = |name: &str| {
            fields
                .remove(name)
                .ok_or_else(|| corrupt(format!("missing field '{}'", name)))
        };

        let prompt = take("prompt")?;
        let metadata: Metadata = serde_json::from_str(&take("metadata")?)?;
        let status = take("status")?.parse::<TaskStatus>().map_err(corrupt)?;
        let created_at = parse_timestamp(&take("created_at")?).map_err(corrupt)?;
        let updated_at = parse_timestamp(&take("updated_at")?).map_err(corrupt)?;

        Ok(Self {
            id,
            prompt,
            metadata,
            status,
            result: fields.remove("result"),
            error: fields.remove("error"),
            created_at,
            updated_at,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{}': {}", value, e))
}

/// Status view returned by the task query interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: Uuid,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("request_number".to_string(), serde_json::json!(1));
        metadata.insert("source".to_string(), serde_json::json!("api_test"));
        metadata
    }

    #[test]
    fn test_allowed_transitions() {
        use TaskStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn test_status_display_and_parse() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<TaskStatus>(), Ok(status));
        }
        assert!("DONE".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&TaskStatus::Processing).expect("serialize");
        assert_eq!(json, "\"PROCESSING\"");
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = Task::new(Uuid::new_v4(), "Write a haiku", Metadata::new());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.created_at, task.updated_at);
        assert!(task.result.is_none());
        assert!(task.error.is_none());
    }

    #[test]
    fn test_apply_sets_result_and_timestamp() {
        let mut task = Task::new(Uuid::new_v4(), "ping", Metadata::new());
        let later = task.created_at + chrono::Duration::seconds(3);

        task.apply(TaskStatus::Processing, TransitionFields::none(), later);
        task.apply(TaskStatus::Completed, TransitionFields::result("pong"), later);

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("pong"));
        assert_eq!(task.processing_time(), chrono::Duration::seconds(3));
    }

    #[test]
    fn test_fields_preserve_empty_metadata_and_optional_fields() {
        let mut task = Task::new(Uuid::new_v4(), "prompt", Metadata::new());
        task.apply(
            TaskStatus::Failed,
            TransitionFields::error("boom"),
            Utc::now(),
        );

        let fields: HashMap<String, String> = task
            .to_fields()
            .expect("fields")
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(fields.get("metadata").map(String::as_str), Some("{}"));
        assert!(!fields.contains_key("result"));

        let rebuilt = Task::from_fields(task.id, fields).expect("rebuild");
        assert_eq!(rebuilt.error.as_deref(), Some("boom"));
        assert!(rebuilt.metadata.is_empty());
        assert_eq!(rebuilt.status, TaskStatus::Failed);
    }

    #[test]
    fn test_from_fields_keeps_metadata() {
        let task = Task::new(Uuid::new_v4(), "prompt", sample_metadata());
        let fields = task
            .to_fields()
            .expect("fields")
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let rebuilt = Task::from_fields(task.id, fields).expect("rebuild");
        assert_eq!(rebuilt.metadata, sample_metadata());
    }

    #[test]
    fn test_from_fields_reports_missing_status() {
        let mut fields = HashMap::new();
        fields.insert("prompt".to_string(), "p".to_string());
        fields.insert("metadata".to_string(), "{}".to_string());

        let err = Task::from_fields(Uuid::nil(), fields).expect_err("should be corrupt");
        assert!(err.to_string().contains("status"));
    }

    #[test]
    fn test_transition_field_pairs() {
        assert!(TransitionFields::none().pairs().is_empty());
        assert_eq!(
            TransitionFields::result("pong").pairs(),
            vec![("result", "pong")]
        );
        assert_eq!(
            TransitionFields::error("bad").pairs(),
            vec![("error", "bad")]
        );
    }

    #[test]
    fn test_view_omits_absent_fields() {
        let task = Task::new(Uuid::new_v4(), "prompt", Metadata::new());
        let json = serde_json::to_value(task.view()).expect("serialize");
        assert_eq!(json["status"], "PENDING");
        assert!(json.get("result").is_none());
        assert!(json.get("error").is_none());
    }
}
