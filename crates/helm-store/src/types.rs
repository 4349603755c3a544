use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

pub type TaskId = String;
pub type SessionId = String;

/// Which executor a plan step is routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Browser,
    Shell,
    Data,
}

impl ToolKind {
    pub const ALL: [ToolKind; 3] = [ToolKind::Browser, ToolKind::Shell, ToolKind::Data];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Browser => "browser",
            ToolKind::Shell => "shell",
            ToolKind::Data => "data",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "browser" => Ok(ToolKind::Browser),
            "shell" => Ok(ToolKind::Shell),
            "data" => Ok(ToolKind::Data),
            other => Err(format!("unknown tool kind '{other}'")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Error => "error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub session_id: SessionId,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enriched_prompt: Option<String>,
    #[serde(rename = "type")]
    pub kind: ToolKind,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
}

impl Task {
    pub fn new(
        id: impl Into<TaskId>,
        session_id: impl Into<SessionId>,
        prompt: impl Into<String>,
        kind: ToolKind,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            prompt: prompt.into(),
            enriched_prompt: None,
            kind,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            start_time: now_millis(),
            end_time: None,
        }
    }

    pub fn with_enriched_prompt(mut self, enriched: impl Into<String>) -> Self {
        self.enriched_prompt = Some(enriched.into());
        self
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
    }

    pub fn complete(&mut self, result: Value) {
        self.finish(TaskStatus::Completed);
        self.result = Some(result);
    }

    pub fn fail(&mut self, status: TaskStatus, error: impl Into<String>) {
        self.finish(status);
        self.error = Some(error.into());
    }

    fn finish(&mut self, status: TaskStatus) {
        self.status = status;
        self.end_time = Some(now_millis());
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub session_id: SessionId,
    pub role: ChatRole,
    pub content: String,
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn new(
        session_id: impl Into<SessionId>,
        role: ChatRole,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            timestamp: now_millis(),
        }
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_serializes_type_and_camel_case_fields() {
        let task = Task::new("t-1", "s-1", "open the dashboard", ToolKind::Browser);
        let value = serde_json::to_value(&task).expect("task should serialize");
        assert_eq!(value["type"], json!("browser"));
        assert_eq!(value["sessionId"], json!("s-1"));
        assert_eq!(value["status"], json!("pending"));
        assert!(value.get("endTime").is_none());
    }

    #[test]
    fn task_fail_sets_terminal_status_and_end_time() {
        let mut task = Task::new("t-1", "s-1", "ls", ToolKind::Shell);
        task.mark_running();
        assert!(!task.status.is_terminal());
        task.fail(TaskStatus::Error, "spawn failed");
        assert!(task.status.is_terminal());
        assert_eq!(task.error.as_deref(), Some("spawn failed"));
        assert!(task.end_time.is_some());
    }

    #[test]
    fn tool_kind_parses_case_insensitively() {
        assert_eq!("Browser".parse::<ToolKind>(), Ok(ToolKind::Browser));
        assert_eq!(" shell ".parse::<ToolKind>(), Ok(ToolKind::Shell));
        assert!("robot".parse::<ToolKind>().is_err());
    }
}
