use crate::PlanError;
use helm_link::{LinkMessage, LinkMessageKind, TaskState, TransportLink};
use helm_store::{HistoryStore, StoreError, TaskStatus};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Mirrors agent lifecycle events onto stored task records.
///
/// Only tasks whose stored id matches the event's id are touched; results are
/// written by the engine once the step settles.
#[derive(Clone)]
pub struct TaskTracker {
    store: Arc<dyn HistoryStore>,
}

impl TaskTracker {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Returns true when a stored task changed.
    pub async fn handle_message(&self, message: &LinkMessage) -> Result<bool, PlanError> {
        let LinkMessage::AgentEvent { task_id, event } = message else {
            return Ok(false);
        };
        let Some(mut task) = self.store.find_task(task_id).await? else {
            debug!(task_id = %task_id, "agent event for unknown task");
            return Ok(false);
        };
        if task.status.is_terminal() {
            return Ok(false);
        }

        match &event.state {
            TaskState::TaskStart if task.status == TaskStatus::Pending => task.mark_running(),
            TaskState::TaskFail => task.fail(
                TaskStatus::Failed,
                non_empty(event.data.details_text(), "Task failed"),
            ),
            TaskState::TaskCancel => task.fail(
                TaskStatus::Cancelled,
                non_empty(event.data.details_text(), "Task cancelled"),
            ),
            _ => return Ok(false),
        }

        match self.store.update_task(task).await {
            Ok(_) => Ok(true),
            Err(StoreError::Conflict(_)) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    pub fn attach(&self, link: &TransportLink) -> JoinHandle<()> {
        let mut subscription = link.subscribe_kinds(&[LinkMessageKind::AgentEvent]);
        let tracker = self.clone();
        tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                if let Err(error) = tracker.handle_message(&message).await {
                    warn!(error = %error, "failed to record agent event");
                }
            }
        })
    }
}

fn non_empty(text: String, fallback: &str) -> String {
    if text.trim().is_empty() {
        fallback.to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_link::{Actor, AgentEvent, AgentEventData};
    use helm_store::{MemoryHistoryStore, Task, ToolKind};
    use serde_json::json;

    fn agent_event(task_id: &str, state: &str, details: &str) -> LinkMessage {
        LinkMessage::AgentEvent {
            task_id: task_id.to_string(),
            event: AgentEvent {
                actor: Actor::System,
                state: TaskState::parse(state),
                timestamp: 0,
                data: AgentEventData {
                    step: 0,
                    max_steps: 0,
                    details: json!(details),
                },
            },
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tracker_marks_start_and_cancel() {
        let store = Arc::new(MemoryHistoryStore::new());
        store
            .create_task(Task::new("t-1", "s-1", "open site", ToolKind::Browser))
            .await
            .expect("task should create");
        let tracker = TaskTracker::new(store.clone());

        assert!(tracker
            .handle_message(&agent_event("t-1", "task.start", ""))
            .await
            .expect("start should apply"));
        let task = store
            .find_task(&"t-1".to_string())
            .await
            .expect("find")
            .expect("task exists");
        assert_eq!(task.status, TaskStatus::Running);

        assert!(tracker
            .handle_message(&agent_event("t-1", "task.cancel", "operator stopped it"))
            .await
            .expect("cancel should apply"));
        let task = store
            .find_task(&"t-1".to_string())
            .await
            .expect("find")
            .expect("task exists");
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.error.as_deref(), Some("operator stopped it"));

        assert!(!tracker
            .handle_message(&agent_event("t-1", "task.fail", "late"))
            .await
            .expect("terminal task is left alone"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tracker_ignores_unknown_tasks_and_progress_states() {
        let store = Arc::new(MemoryHistoryStore::new());
        store
            .create_task(Task::new("t-1", "s-1", "open site", ToolKind::Browser))
            .await
            .expect("task should create");
        let tracker = TaskTracker::new(store);

        assert!(!tracker
            .handle_message(&agent_event("t-unknown", "task.fail", "x"))
            .await
            .expect("unknown task is ignored"));
        assert!(!tracker
            .handle_message(&agent_event("t-1", "step.ok", "clicked"))
            .await
            .expect("progress is ignored"));
    }
}
