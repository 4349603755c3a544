//! Resolves dispatched tasks exactly once from asynchronous link traffic.
//!
//! Completion may arrive through the agent's event stream (`task.ok`,
//! `task.fail`, `task.cancel`) or through terminal `task_result` /
//! `task_error` messages. Both paths race; the first one to reach a registered
//! handler settles it and removes it from the pending table.

use crate::dispatch::TaskDispatcher;
use crate::link::TransportLink;
use crate::protocol::{
    Actor, AgentEvent, DispatchRequest, LinkMessage, LinkMessageKind, TaskState, value_text,
};
use crate::LinkError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { message: String },
    Failed { error: String },
    Cancelled { reason: String },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }

    pub fn text(&self) -> &str {
        match self {
            TaskOutcome::Completed { message } => message,
            TaskOutcome::Failed { error } => error,
            TaskOutcome::Cancelled { reason } => reason,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchedTask {
    pub task_id: String,
    pub status: String,
}

struct PendingCompletion {
    serial: u64,
    sender: oneshot::Sender<TaskOutcome>,
    last_detail: Option<String>,
}

type PendingTable = Arc<Mutex<HashMap<String, PendingCompletion>>>;

#[derive(Clone)]
pub struct CompletionSynchronizer {
    dispatcher: Arc<dyn TaskDispatcher>,
    pending: PendingTable,
    next_serial: Arc<AtomicU64>,
}

impl CompletionSynchronizer {
    pub fn new(dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        Self {
            dispatcher,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_serial: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn dispatch(&self, prompt: &str) -> Result<DispatchedTask, LinkError> {
        self.dispatch_with_id(prompt, None).await
    }

    /// Dispatches with a caller-chosen id. The peer may still assign its own.
    pub async fn dispatch_with_id(
        &self,
        prompt: &str,
        task_id: Option<String>,
    ) -> Result<DispatchedTask, LinkError> {
        let response = self
            .dispatcher
            .dispatch(DispatchRequest {
                task: prompt.to_string(),
                task_id: task_id.clone(),
            })
            .await?;
        let task_id = response
            .task_id
            .filter(|id| !id.trim().is_empty())
            .or(task_id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let status = response.status.unwrap_or_else(|| "dispatched".to_string());
        info!(task_id = %task_id, status = %status, "task dispatched");
        Ok(DispatchedTask { task_id, status })
    }

    /// Registers the single completion handler for `task_id`.
    ///
    /// Registration happens immediately, so events arriving before the
    /// returned waiter is polled are not lost.
    pub fn await_completion(
        &self,
        task_id: &str,
        deadline: Option<Duration>,
    ) -> Result<CompletionWaiter, LinkError> {
        let (sender, receiver) = oneshot::channel();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.lock_pending()?;
        if pending.contains_key(task_id) {
            return Err(LinkError::AlreadyAwaiting(task_id.to_string()));
        }
        pending.insert(
            task_id.to_string(),
            PendingCompletion {
                serial,
                sender,
                last_detail: None,
            },
        );
        Ok(CompletionWaiter {
            task_id: task_id.to_string(),
            serial,
            receiver,
            deadline,
            pending: self.pending.clone(),
        })
    }

    /// Moves a pending handler to the id the peer actually assigned.
    pub fn rekey(&self, from: &str, to: &str) -> Result<(), LinkError> {
        if from == to {
            return Ok(());
        }
        let mut pending = self.lock_pending()?;
        if pending.contains_key(to) {
            return Err(LinkError::AlreadyAwaiting(to.to_string()));
        }
        let entry = pending.remove(from).ok_or_else(|| {
            LinkError::State(format!("no pending completion registered for task '{from}'"))
        })?;
        pending.insert(to.to_string(), entry);
        Ok(())
    }

    pub fn is_pending(&self, task_id: &str) -> bool {
        self.lock_pending()
            .map(|pending| pending.contains_key(task_id))
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().map(|pending| pending.len()).unwrap_or(0)
    }

    /// Feeds one inbound message. Returns true if it settled a completion.
    pub fn handle_message(&self, message: &LinkMessage) -> bool {
        match message {
            LinkMessage::AgentEvent { task_id, event } => self.handle_agent_event(task_id, event),
            LinkMessage::TaskResult { task_id, result } => {
                let text = value_text(result);
                let message = if text.is_empty() {
                    "Task completed".to_string()
                } else {
                    text
                };
                self.settle(task_id, TaskOutcome::Completed { message })
            }
            LinkMessage::TaskError { task_id, error } => {
                let text = value_text(error);
                let error = if text.is_empty() {
                    "Task failed".to_string()
                } else {
                    text
                };
                self.settle(task_id, TaskOutcome::Failed { error })
            }
            _ => false,
        }
    }

    /// Spawns the loop that feeds link traffic into [`Self::handle_message`].
    pub fn attach(&self, link: &TransportLink) -> JoinHandle<()> {
        let mut subscription = link.subscribe_kinds(&[
            LinkMessageKind::AgentEvent,
            LinkMessageKind::TaskResult,
            LinkMessageKind::TaskError,
        ]);
        let synchronizer = self.clone();
        tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                synchronizer.handle_message(&message);
            }
            debug!("link feed closed; completion loop exiting");
        })
    }

    fn handle_agent_event(&self, task_id: &str, event: &AgentEvent) -> bool {
        let outcome = {
            let Ok(mut pending) = self.lock_pending() else {
                return false;
            };
            let Some(entry) = pending.get_mut(task_id) else {
                if event.state.is_terminal() {
                    debug!(
                        task_id,
                        state = %event.state,
                        "dropping completion event for unregistered task"
                    );
                }
                return false;
            };

            let details = event.data.details_text();
            if matches!(event.actor, Actor::Validator | Actor::Planner)
                && !details.trim().is_empty()
            {
                entry.last_detail = Some(details.clone());
            }

            match &event.state {
                TaskState::TaskOk => match entry.last_detail.clone() {
                    Some(message) => TaskOutcome::Completed { message },
                    None => {
                        debug!(
                            task_id,
                            "task.ok without a meaningful detail; waiting for task_result"
                        );
                        return false;
                    }
                },
                TaskState::TaskFail => TaskOutcome::Failed {
                    error: non_empty_or(details, "Task failed"),
                },
                TaskState::TaskCancel => TaskOutcome::Cancelled {
                    reason: non_empty_or(details, "Task cancelled"),
                },
                _ => return false,
            }
        };
        self.settle(task_id, outcome)
    }

    fn settle(&self, task_id: &str, outcome: TaskOutcome) -> bool {
        let entry = match self.lock_pending() {
            Ok(mut pending) => pending.remove(task_id),
            Err(_) => None,
        };
        let Some(entry) = entry else {
            debug!(task_id, "dropping completion for unregistered task");
            return false;
        };
        info!(task_id, success = outcome.is_success(), "task settled");
        if entry.sender.send(outcome).is_err() {
            debug!(task_id, "completion waiter already gone");
        }
        true
    }

    fn lock_pending(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, PendingCompletion>>, LinkError> {
        self.pending
            .lock()
            .map_err(|_| LinkError::State("pending completion table poisoned".to_string()))
    }
}

/// Single-fire handle returned by [`CompletionSynchronizer::await_completion`].
///
/// Dropping it unregisters the handler.
pub struct CompletionWaiter {
    task_id: String,
    serial: u64,
    receiver: oneshot::Receiver<TaskOutcome>,
    deadline: Option<Duration>,
    pending: PendingTable,
}

impl CompletionWaiter {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn wait(mut self) -> Result<TaskOutcome, LinkError> {
        let received = match self.deadline {
            Some(deadline) => {
                match tokio::time::timeout(deadline, &mut self.receiver).await {
                    Ok(received) => received,
                    Err(_) => {
                        // Settlement may have landed while the timer fired.
                        if let Ok(outcome) = self.receiver.try_recv() {
                            return Ok(outcome);
                        }
                        warn!(task_id = %self.task_id, "completion deadline exceeded");
                        return Err(LinkError::CompletionTimeout {
                            task_id: self.task_id.clone(),
                            timeout_ms: deadline.as_millis() as u64,
                        });
                    }
                }
            }
            None => (&mut self.receiver).await,
        };
        received.map_err(|_| LinkError::CompletionAbandoned(self.task_id.clone()))
    }
}

impl Drop for CompletionWaiter {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.retain(|_, entry| entry.serial != self.serial);
        }
    }
}

fn non_empty_or(text: String, fallback: &str) -> String {
    if text.trim().is_empty() {
        fallback.to_string()
    } else {
        text
    }
}
