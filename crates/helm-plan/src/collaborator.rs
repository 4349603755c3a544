use crate::PlanError;
use crate::context::ContextValues;
use crate::engine::StepResult;
use crate::parse::PlanStep;
use crate::tools::ToolOutput;
use async_trait::async_trait;
use helm_store::ToolKind;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSelection {
    pub tool: ToolKind,
    #[serde(default)]
    pub rationale: String,
}

/// Language-model calls the engine relies on.
#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Plan text; steps are extracted by [`crate::parse_plan`].
    async fn generate_plan(&self, request: &str) -> Result<String, PlanError>;

    async fn select_tool(
        &self,
        step: &PlanStep,
        context: &ContextValues,
    ) -> Result<ToolSelection, PlanError>;

    /// Rewrites the step so it carries the facts it depends on.
    async fn enrich_step(
        &self,
        step: &PlanStep,
        context: &ContextValues,
    ) -> Result<String, PlanError>;

    async fn extract_facts(
        &self,
        step: &PlanStep,
        output: &ToolOutput,
    ) -> Result<ContextValues, PlanError>;

    async fn synthesize_response(
        &self,
        request: &str,
        results: &[StepResult],
        context: &ContextValues,
    ) -> Result<String, PlanError>;
}
