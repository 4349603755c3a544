//! Wire messages exchanged with the remote execution agent.
//!
//! Every frame is a JSON object tagged by `type`. Inbound frames are parsed into
//! [`LinkMessage`] as soon as they arrive; the dotted `state` tag of agent
//! events is classified into [`TaskState`] at the same boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkMessage {
    Hello {
        role: String,
    },
    Ping,
    Pong,
    /// Peer announces it is ready to accept tasks.
    Ready {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
    },
    AgentEvent {
        #[serde(rename = "taskId")]
        task_id: String,
        event: AgentEvent,
    },
    TaskResult {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(default)]
        result: Value,
    },
    TaskError {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(default)]
        error: Value,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkMessageKind {
    Hello,
    Ping,
    Pong,
    Ready,
    AgentEvent,
    TaskResult,
    TaskError,
}

impl LinkMessage {
    pub fn kind(&self) -> LinkMessageKind {
        match self {
            LinkMessage::Hello { .. } => LinkMessageKind::Hello,
            LinkMessage::Ping => LinkMessageKind::Ping,
            LinkMessage::Pong => LinkMessageKind::Pong,
            LinkMessage::Ready { .. } => LinkMessageKind::Ready,
            LinkMessage::AgentEvent { .. } => LinkMessageKind::AgentEvent,
            LinkMessage::TaskResult { .. } => LinkMessageKind::TaskResult,
            LinkMessage::TaskError { .. } => LinkMessageKind::TaskError,
        }
    }

    /// Task id referenced by task-scoped messages.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            LinkMessage::AgentEvent { task_id, .. }
            | LinkMessage::TaskResult { task_id, .. }
            | LinkMessage::TaskError { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Planner,
    Navigator,
    Validator,
    System,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub actor: Actor,
    pub state: TaskState,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub data: AgentEventData,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEventData {
    #[serde(default)]
    pub step: u32,
    #[serde(default)]
    pub max_steps: u32,
    #[serde(default)]
    pub details: Value,
}

impl AgentEventData {
    /// Details rendered as text; empty when absent.
    pub fn details_text(&self) -> String {
        value_text(&self.details)
    }
}

/// Lifecycle tag of an agent event.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskState {
    TaskStart,
    TaskOk,
    TaskFail,
    TaskCancel,
    StepStart,
    StepOk,
    StepFail,
    ActStart,
    ActOk,
    ActFail,
    Other(String),
}

impl TaskState {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "task.start" => TaskState::TaskStart,
            "task.ok" => TaskState::TaskOk,
            "task.fail" => TaskState::TaskFail,
            "task.cancel" => TaskState::TaskCancel,
            "step.start" => TaskState::StepStart,
            "step.ok" => TaskState::StepOk,
            "step.fail" => TaskState::StepFail,
            "act.start" => TaskState::ActStart,
            "act.ok" => TaskState::ActOk,
            "act.fail" => TaskState::ActFail,
            other => TaskState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskState::TaskStart => "task.start",
            TaskState::TaskOk => "task.ok",
            TaskState::TaskFail => "task.fail",
            TaskState::TaskCancel => "task.cancel",
            TaskState::StepStart => "step.start",
            TaskState::StepOk => "step.ok",
            TaskState::StepFail => "step.fail",
            TaskState::ActStart => "act.start",
            TaskState::ActOk => "act.ok",
            TaskState::ActFail => "act.fail",
            TaskState::Other(tag) => tag,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::TaskOk | TaskState::TaskFail | TaskState::TaskCancel
        )
    }
}

impl From<String> for TaskState {
    fn from(value: String) -> Self {
        TaskState::parse(&value)
    }
}

impl From<TaskState> for String {
    fn from(value: TaskState) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request body of the out-of-band dispatch call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub task: String,
    #[serde(rename = "taskId", default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchResponse {
    #[serde(rename = "taskId", default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
