use crate::store::{HistoryStore, StoreError, StoreResult};
use crate::types::{ChatMessage, SessionId, Task, TaskId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default)]
struct MemoryState {
    tasks: HashMap<TaskId, Task>,
    session_tasks: BTreeMap<SessionId, Vec<TaskId>>,
    messages: BTreeMap<SessionId, Vec<ChatMessage>>,
}

/// Process-local history. Lost on restart.
#[derive(Clone, Debug, Default)]
pub struct MemoryHistoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, MemoryState>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory history mutex poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn create_task(&self, task: Task) -> StoreResult<Task> {
        if task.id.trim().is_empty() {
            return Err(StoreError::InvalidInput("task id cannot be empty".to_string()));
        }
        let mut state = self.lock()?;
        if state.tasks.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!("task '{}' already exists", task.id)));
        }
        state
            .session_tasks
            .entry(task.session_id.clone())
            .or_default()
            .push(task.id.clone());
        state.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn update_task(&self, task: Task) -> StoreResult<Task> {
        let mut state = self.lock()?;
        let Some(existing) = state.tasks.get_mut(&task.id) else {
            return Err(StoreError::NotFound {
                resource: "task",
                id: task.id,
            });
        };
        if existing.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "task '{}' is already {}",
                existing.id,
                existing.status.as_str()
            )));
        }
        *existing = task.clone();
        Ok(task)
    }

    async fn find_task(&self, task_id: &TaskId) -> StoreResult<Option<Task>> {
        Ok(self.lock()?.tasks.get(task_id).cloned())
    }

    async fn list_tasks(&self, session_id: &SessionId) -> StoreResult<Vec<Task>> {
        let state = self.lock()?;
        let ids = state.session_tasks.get(session_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect())
    }

    async fn append_message(&self, message: ChatMessage) -> StoreResult<ChatMessage> {
        let mut state = self.lock()?;
        state
            .messages
            .entry(message.session_id.clone())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, session_id: &SessionId) -> StoreResult<Vec<ChatMessage>> {
        Ok(self
            .lock()?
            .messages
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}
