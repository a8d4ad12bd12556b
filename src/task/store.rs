//! Status persistence.
//!
//! The dispatcher writes a task's status here once the publishing call stops
//! waiting, and cross-process completions land here directly.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::TaskStatus;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Status store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt status record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage for task status documents, keyed by task id.
#[async_trait]
pub trait TaskStatusStore: Send + Sync {
    async fn read(&self, task_id: &str) -> Result<Option<TaskStatus>>;

    async fn write(&self, task_id: &str, status: &TaskStatus) -> Result<()>;

    /// Every stored status.
    async fn list(&self) -> Result<Vec<TaskStatus>>;
}

/// Process-local status store.
#[derive(Default)]
pub struct InMemoryStatusStore {
    records: RwLock<HashMap<String, TaskStatus>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStatusStore for InMemoryStatusStore {
    async fn read(&self, task_id: &str) -> Result<Option<TaskStatus>> {
        Ok(self.records.read().await.get(task_id).cloned())
    }

    async fn write(&self, task_id: &str, status: &TaskStatus) -> Result<()> {
        self.records
            .write()
            .await
            .insert(task_id.to_string(), status.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TaskStatus>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;

    #[tokio::test]
    async fn test_write_then_read() {
        let store = InMemoryStatusStore::new();
        let mut status = TaskStatus::new("q:1");
        status.transition(TaskState::Completed);

        store.write("q:1", &status).await.unwrap();

        assert_eq!(store.read("q:1").await.unwrap(), Some(status));
        assert!(store.read("q:2").await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
