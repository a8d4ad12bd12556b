//! Tasks and their status documents.
//!
//! A task travels to workers as a `TaskEnvelope`. Its progress travels back
//! as a `TaskStatus`, which is also what callers see from `publish_task` and
//! `get_status`.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::{InMemoryStatusStore, StoreError, TaskStatusStore};

/// Content type used when the caller does not give one.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Lifecycle of a task: `NEW -> PENDING -> {COMPLETED, TIMEOUT, FAILED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    New,
    Pending,
    Completed,
    Timeout,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Timeout | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::New => 0,
            Self::Pending => 1,
            Self::Completed | Self::Timeout | Self::Failed => 2,
        }
    }
}

/// Status document for a task.
///
/// `output` is cumulative: every status report carries all lines produced so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: String,
    pub current_state: TaskState,
    #[serde(default)]
    pub output: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

impl TaskStatus {
    /// A fresh status in `NEW`.
    pub fn new(task_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            current_state: TaskState::New,
            output: Vec::new(),
            creation_time: Some(now),
            last_update_time: Some(now),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.current_state.is_terminal()
    }

    /// Move to `state` if that is a forward step.
    ///
    /// Terminal states are final; earlier states are never re-entered.
    pub fn transition(&mut self, state: TaskState) -> bool {
        if self.current_state.is_terminal() || state.rank() < self.current_state.rank() {
            return false;
        }
        self.current_state = state;
        self.touch();
        true
    }

    pub fn add_output(&mut self, line: impl Into<String>) {
        self.output.push(line.into());
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_update_time = Some(Utc::now());
    }

    /// Fold a later report for the same task into this one.
    ///
    /// The update is ignored if this status is already terminal or if the
    /// update is older than what is held. Returns `true` if anything changed.
    pub fn merge(&mut self, update: &TaskStatus) -> bool {
        if self.current_state.is_terminal() {
            return false;
        }
        if let (Some(held), Some(incoming)) = (self.last_update_time, update.last_update_time) {
            if incoming < held {
                return false;
            }
        }

        let mut changed = false;
        if update.output != self.output && update.output.len() >= self.output.len() {
            self.output = update.output.clone();
            changed = true;
        }
        if update.current_state.rank() >= self.current_state.rank()
            && update.current_state != self.current_state
        {
            self.current_state = update.current_state;
            changed = true;
        }
        if changed {
            self.last_update_time = update.last_update_time.or_else(|| Some(Utc::now()));
        }
        changed
    }

    /// Queue name encoded in the task id (`{queue}:{uuid}`).
    pub fn queue(&self) -> Option<&str> {
        self.task_id.rsplit_once(':').map(|(queue, _)| queue)
    }
}

/// Wire envelope published to a task queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    pub task_id: String,
    pub content_type: String,
    #[serde(default)]
    pub priority: i32,
    pub content: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// What a caller hands to `publish_task`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub content: String,
    pub content_type: String,
    pub priority: i32,
    pub correlation_id: Option<String>,
}

impl TaskRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            priority: 0,
            correlation_id: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub(crate) fn into_envelope(self, task_id: &str) -> TaskEnvelope {
        TaskEnvelope {
            task_id: task_id.to_string(),
            content_type: self.content_type,
            priority: self.priority,
            content: self.content,
            correlation_id: self.correlation_id,
        }
    }
}

/// A task as seen by the worker handling it.
///
/// Handlers append output and move the state forward; the status is reported
/// back to the publisher when the handler returns.
#[derive(Debug, Clone)]
pub struct Task {
    queue: String,
    envelope: TaskEnvelope,
    status: TaskStatus,
}

impl Task {
    /// Wrap an envelope received from `queue`. The task starts in `PENDING`.
    pub fn received(queue: &str, envelope: TaskEnvelope) -> Self {
        let mut status = TaskStatus::new(envelope.task_id.clone());
        status.transition(TaskState::Pending);
        Self {
            queue: queue.to_string(),
            envelope,
            status,
        }
    }

    pub fn id(&self) -> &str {
        &self.envelope.task_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn content(&self) -> &str {
        &self.envelope.content
    }

    pub fn content_type(&self) -> &str {
        &self.envelope.content_type
    }

    pub fn priority(&self) -> i32 {
        self.envelope.priority
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.envelope.correlation_id.as_deref()
    }

    pub fn add_output(&mut self, line: impl Into<String>) {
        self.status.add_output(line);
    }

    pub fn complete(&mut self) {
        self.status.transition(TaskState::Completed);
    }

    pub fn fail(&mut self) {
        self.status.transition(TaskState::Failed);
    }

    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    /// Whether there is anything worth reporting to the publisher.
    pub fn has_progress(&self) -> bool {
        self.status.is_finished() || !self.status.output.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_state_wire_names() {
        let json = serde_json::to_string(&TaskState::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");
        let state: TaskState = serde_json::from_str("\"PENDING\"").unwrap();
        assert_eq!(state, TaskState::Pending);
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let mut status = TaskStatus::new("q:1");
        assert!(status.transition(TaskState::Pending));
        assert!(!status.transition(TaskState::New));
        assert!(status.transition(TaskState::Completed));
        assert!(!status.transition(TaskState::Failed));
        assert_eq!(status.current_state, TaskState::Completed);
    }

    #[test]
    fn test_status_document_shape() {
        let json = r#"{"taskId":"q:1","currentState":"COMPLETED","output":["Response"]}"#;
        let status: TaskStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.output, vec!["Response"]);
        assert!(status.creation_time.is_none());
        assert_eq!(status.queue(), Some("q"));
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = TaskRequest::new("Hello World")
            .with_priority(3)
            .into_envelope("work:abc");
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["taskId"], "work:abc");
        assert_eq!(value["contentType"], DEFAULT_CONTENT_TYPE);
        assert_eq!(value["priority"], 3);
        assert_eq!(value["content"], "Hello World");
        assert!(value["correlationId"].is_null());
    }

    #[test]
    fn test_merge_takes_newer_update() {
        let mut held = TaskStatus::new("q:1");
        held.transition(TaskState::Pending);

        let mut update = held.clone();
        update.output.push("Response".into());
        update.current_state = TaskState::Completed;
        update.last_update_time = held.last_update_time.map(|t| t + Duration::milliseconds(5));

        assert!(held.merge(&update));
        assert_eq!(held.current_state, TaskState::Completed);
        assert_eq!(held.output, vec!["Response"]);
    }

    #[test]
    fn test_merge_ignores_older_update() {
        let mut held = TaskStatus::new("q:1");
        held.transition(TaskState::Pending);

        let mut stale = held.clone();
        stale.output.push("old".into());
        stale.last_update_time = held.last_update_time.map(|t| t - Duration::seconds(1));

        assert!(!held.merge(&stale));
        assert!(held.output.is_empty());
    }

    #[test]
    fn test_merge_never_regresses_terminal() {
        let mut held = TaskStatus::new("q:1");
        held.transition(TaskState::Completed);

        let mut late = TaskStatus::new("q:1");
        late.transition(TaskState::Pending);
        late.last_update_time = held.last_update_time.map(|t| t + Duration::seconds(1));

        assert!(!held.merge(&late));
        assert_eq!(held.current_state, TaskState::Completed);
    }

    #[test]
    fn test_worker_task_reports_progress() {
        let envelope = TaskRequest::new("job").into_envelope("work:1");
        let mut task = Task::received("work", envelope);
        assert_eq!(task.status().current_state, TaskState::Pending);
        assert!(!task.has_progress());

        task.add_output("halfway");
        assert!(task.has_progress());
        task.complete();
        assert!(task.status().is_finished());
        assert_eq!(task.id(), "work:1");
    }
}
