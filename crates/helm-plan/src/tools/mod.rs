mod browser;
mod data;
mod shell;

pub use browser::BrowserTool;
pub use data::DataTool;
pub use shell::{ShellTool, extract_shell_command};

use crate::PlanError;
use crate::context::ContextValues;
use async_trait::async_trait;
use helm_store::ToolKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a tool needs to run one plan step.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolInvocation {
    pub session_id: String,
    pub task_id: String,
    /// Step text after enrichment.
    pub prompt: String,
    pub context: ContextValues,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    /// Id the executing peer assigned, when it differs from the invocation's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_task_id: Option<String>,
}

impl ToolOutput {
    pub fn success(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
            remote_task_id: None,
        }
    }

    pub fn failure(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: false,
            message: message.into(),
            data,
            remote_task_id: None,
        }
    }
}

#[async_trait]
pub trait StepTool: Send + Sync {
    fn kind(&self) -> ToolKind;

    async fn execute(&self, invocation: &ToolInvocation) -> Result<ToolOutput, PlanError>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<ToolKind, Arc<dyn StepTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any tool previously registered for the same kind.
    pub fn register(&mut self, tool: Arc<dyn StepTool>) {
        self.tools.insert(tool.kind(), tool);
    }

    pub fn with_tool(mut self, tool: Arc<dyn StepTool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, kind: ToolKind) -> Option<Arc<dyn StepTool>> {
        self.tools.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ToolKind> {
        ToolKind::ALL
            .into_iter()
            .filter(|kind| self.tools.contains_key(kind))
            .collect()
    }

    pub async fn dispatch(
        &self,
        kind: ToolKind,
        invocation: &ToolInvocation,
    ) -> Result<ToolOutput, PlanError> {
        let tool = self.get(kind).ok_or(PlanError::UnknownTool(kind))?;
        tool.execute(invocation).await
    }
}
