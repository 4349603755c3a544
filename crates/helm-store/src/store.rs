use crate::types::{ChatMessage, SessionId, Task, TaskId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource not found: {resource} ({id})")]
    NotFound { resource: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Chat and task history consumed by the plan engine and the HTTP API.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Fails with `Conflict` when a task with the same id already exists.
    async fn create_task(&self, task: Task) -> StoreResult<Task>;

    /// Replaces the stored task. Tasks that reached a terminal status are immutable.
    async fn update_task(&self, task: Task) -> StoreResult<Task>;

    async fn find_task(&self, task_id: &TaskId) -> StoreResult<Option<Task>>;

    /// Tasks of one session in creation order.
    async fn list_tasks(&self, session_id: &SessionId) -> StoreResult<Vec<Task>>;

    async fn append_message(&self, message: ChatMessage) -> StoreResult<ChatMessage>;

    async fn list_messages(&self, session_id: &SessionId) -> StoreResult<Vec<ChatMessage>>;
}
