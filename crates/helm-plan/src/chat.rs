use crate::PlanError;
use crate::collaborator::{Collaborator, ToolSelection};
use crate::context::ContextValues;
use crate::engine::StepResult;
use crate::parse::PlanStep;
use crate::tools::ToolOutput;
use async_trait::async_trait;
use helm_store::ToolKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const PLAN_PROMPT: &str = "You plan work for an operator who controls a remote machine. \
Break the request into short steps, one per line, each formatted as `[ ] [tool] step`. \
Tools: browser (web browsing on the remote machine), shell (a command in backticks), \
data (reasoning over facts collected by earlier steps). Output only the steps.";

const SELECT_PROMPT: &str = "Pick the tool for this step. Reply with JSON \
{\"tool\": \"browser\" | \"shell\" | \"data\", \"rationale\": \"...\"}.";

const ENRICH_PROMPT: &str = "Rewrite the step so it is self-contained, inlining any of the \
known facts it depends on. Reply with the rewritten step only.";

const FACTS_PROMPT: &str = "Extract the reusable facts from this step output as a flat JSON \
object of snake_case keys to values. Reply with JSON only; use {} when there is nothing.";

const SYNTHESIZE_PROMPT: &str = "Answer the operator's request using the step results and \
collected facts. Be concise and mention steps that failed.";

#[derive(Clone, Debug, PartialEq)]
pub struct ChatCompletionsConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for ChatCompletionsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            timeout: Duration::from_secs(120),
        }
    }
}

/// [`Collaborator`] backed by an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone, Debug)]
pub struct ChatCompletionsCollaborator {
    client: reqwest::Client,
    config: ChatCompletionsConfig,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<CompletionMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct CompletionMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionContent,
}

#[derive(Deserialize)]
struct CompletionContent {
    #[serde(default)]
    content: Option<String>,
}

impl ChatCompletionsCollaborator {
    pub fn new(config: ChatCompletionsConfig) -> Result<Self, PlanError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|error| PlanError::Collaborator(format!("failed to build client: {error}")))?;
        Ok(Self { client, config })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, PlanError> {
        let body = CompletionRequest {
            model: &self.config.model,
            messages: vec![
                CompletionMessage {
                    role: "system",
                    content: system,
                },
                CompletionMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.0,
        };
        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = self.config.api_key.as_deref() {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|error| PlanError::Collaborator(format!("request failed: {error}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlanError::Collaborator(format!(
                "model endpoint returned {status}: {body}"
            )));
        }
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|error| PlanError::Collaborator(format!("invalid completion body: {error}")))?;
        let content = parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| PlanError::Collaborator("model returned no content".to_string()))?;
        debug!(chars = content.len(), "completion received");
        Ok(content)
    }
}

#[async_trait]
impl Collaborator for ChatCompletionsCollaborator {
    async fn generate_plan(&self, request: &str) -> Result<String, PlanError> {
        self.complete(PLAN_PROMPT, request).await
    }

    async fn select_tool(
        &self,
        step: &PlanStep,
        context: &ContextValues,
    ) -> Result<ToolSelection, PlanError> {
        let user = format!(
            "Step: {}\nKnown facts: {}",
            step.text,
            render_context(context)
        );
        let reply = self.complete(SELECT_PROMPT, &user).await?;
        parse_tool_selection(&reply)
    }

    async fn enrich_step(
        &self,
        step: &PlanStep,
        context: &ContextValues,
    ) -> Result<String, PlanError> {
        let user = format!(
            "Step: {}\nKnown facts: {}",
            step.text,
            render_context(context)
        );
        Ok(strip_code_fence(&self.complete(ENRICH_PROMPT, &user).await?).to_string())
    }

    async fn extract_facts(
        &self,
        step: &PlanStep,
        output: &ToolOutput,
    ) -> Result<ContextValues, PlanError> {
        let user = format!("Step: {}\nOutput:\n{}", step.text, output.message);
        let reply = self.complete(FACTS_PROMPT, &user).await?;
        parse_facts(&reply)
    }

    async fn synthesize_response(
        &self,
        request: &str,
        results: &[StepResult],
        context: &ContextValues,
    ) -> Result<String, PlanError> {
        let steps = results
            .iter()
            .map(|result| {
                format!(
                    "- [{}] {}: {}",
                    if result.success { "ok" } else { "failed" },
                    result.step.text,
                    result.message
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let user = format!(
            "Request: {request}\nStep results:\n{steps}\nCollected facts: {}",
            render_context(context)
        );
        self.complete(SYNTHESIZE_PROMPT, &user).await
    }
}

fn render_context(context: &ContextValues) -> String {
    if context.is_empty() {
        return "{}".to_string();
    }
    serde_json::to_string(context).unwrap_or_else(|_| "{}".to_string())
}

/// Inner text of a fenced ```` ``` ```` block, or the trimmed input.
fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// First JSON object embedded in a model reply.
fn extract_json_object(reply: &str) -> Option<Value> {
    let body = strip_code_fence(reply);
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if value.is_object() {
            return Some(value);
        }
    }
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&body[start..=end])
        .ok()
        .filter(Value::is_object)
}

fn parse_tool_selection(reply: &str) -> Result<ToolSelection, PlanError> {
    if let Some(value) = extract_json_object(reply) {
        if let Ok(selection) = serde_json::from_value::<ToolSelection>(value) {
            return Ok(selection);
        }
    }
    // Bare word replies such as "shell" or "Tool: browser".
    let lowered = reply.to_ascii_lowercase();
    ToolKind::ALL
        .into_iter()
        .find(|kind| lowered.contains(kind.as_str()))
        .map(|tool| ToolSelection {
            tool,
            rationale: reply.trim().to_string(),
        })
        .ok_or_else(|| PlanError::Collaborator(format!("unrecognized tool selection: {reply}")))
}

fn parse_facts(reply: &str) -> Result<ContextValues, PlanError> {
    match extract_json_object(reply) {
        Some(Value::Object(map)) => Ok(map
            .into_iter()
            .filter(|(key, _)| !key.trim().is_empty())
            .collect()),
        _ => Err(PlanError::Collaborator(format!(
            "fact extraction did not return a JSON object: {reply}"
        ))),
    }
}
