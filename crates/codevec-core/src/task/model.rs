//! Task domain models.

use std::fmt;

use codevec_redis::QueuedTask;
use serde::{Deserialize, Serialize};

use crate::error::{CodevecError, CodevecResult};

/// Name under which question-answering tasks are queued.
pub const PROCESS_TASK: &str = "process_task";

/// Arguments of a question-answering task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub query: String,
    pub session_id: String,
}

/// A unit of work handed to exactly one worker. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    kind: String,
    payload: TaskPayload,
}

impl Task {
    /// Build a question-answering task, rejecting blank fields.
    pub fn new(query: &str, session_id: &str) -> CodevecResult<Self> {
        if query.trim().is_empty() {
            return Err(CodevecError::validation("query must not be empty"));
        }
        if session_id.trim().is_empty() {
            return Err(CodevecError::validation("session_id must not be empty"));
        }
        Ok(Self {
            kind: PROCESS_TASK.to_string(),
            payload: TaskPayload {
                query: query.to_string(),
                session_id: session_id.to_string(),
            },
        })
    }

    /// Rebuild a task from a queue row.
    pub fn from_queued(row: &QueuedTask) -> CodevecResult<Self> {
        if row.name != PROCESS_TASK {
            return Err(CodevecError::validation(format!(
                "unknown task name '{}'",
                row.name
            )));
        }
        let payload: TaskPayload = serde_json::from_value(row.kwargs.clone())?;
        Self::new(&payload.query, &payload.session_id)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn query(&self) -> &str {
        &self.payload.query
    }

    pub fn session_id(&self) -> &str {
        &self.payload.session_id
    }

    /// Keyword arguments as stored on the queue.
    pub fn kwargs(&self) -> CodevecResult<serde_json::Value> {
        Ok(serde_json::to_value(&self.payload)?)
    }
}

/// Opaque correlation id returned by `enqueue`. Results never come back
/// through it; they arrive on the session channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_blank_fields() {
        assert!(matches!(Task::new("", "s1"), Err(CodevecError::Validation(_))));
        assert!(matches!(Task::new("why?", "   "), Err(CodevecError::Validation(_))));
        assert!(Task::new("why?", "s1").is_ok());
    }

    #[test]
    fn test_kwargs_shape() {
        let task = Task::new("why?", "s1").unwrap();
        assert_eq!(task.kind(), PROCESS_TASK);
        assert_eq!(
            task.kwargs().unwrap(),
            serde_json::json!({"query": "why?", "session_id": "s1"})
        );
    }

    #[test]
    fn test_from_queued_row() {
        let kwargs = serde_json::json!({"query": "why?", "session_id": "s1"});
        let row = QueuedTask::new(PROCESS_TASK, kwargs);
        let task = Task::from_queued(&row).unwrap();
        assert_eq!(task.query(), "why?");
        assert_eq!(task.session_id(), "s1");
    }

    #[test]
    fn test_from_queued_rejects_foreign_rows() {
        let row = QueuedTask::new("reindex", serde_json::json!({"query": "q", "session_id": "s"}));
        assert!(Task::from_queued(&row).is_err());

        let row = QueuedTask::new(PROCESS_TASK, serde_json::json!({"question": "q"}));
        assert!(matches!(Task::from_queued(&row), Err(CodevecError::Json(_))));
    }
}
