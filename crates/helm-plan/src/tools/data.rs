use super::{StepTool, ToolInvocation, ToolOutput};
use crate::PlanError;
use crate::context::ContextValues;
use async_trait::async_trait;
use helm_store::ToolKind;
use serde_json::Value;

/// Answers a step from facts already collected in the session.
///
/// Entries whose key is mentioned in the step are selected; when none is
/// mentioned the whole context is returned.
#[derive(Clone, Debug, Default)]
pub struct DataTool;

#[async_trait]
impl StepTool for DataTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Data
    }

    async fn execute(&self, invocation: &ToolInvocation) -> Result<ToolOutput, PlanError> {
        if invocation.context.is_empty() {
            return Ok(ToolOutput::failure(
                "no collected facts available",
                Value::Null,
            ));
        }

        let mut selected = select_mentioned(&invocation.prompt, &invocation.context);
        if selected.is_empty() {
            selected = invocation.context.clone();
        }
        let message = selected
            .iter()
            .map(|(key, value)| format!("{key}: {}", render_value(value)))
            .collect::<Vec<_>>()
            .join("\n");
        let data = serde_json::to_value(&selected)
            .map_err(|error| PlanError::Tool(format!("failed to encode facts: {error}")))?;
        Ok(ToolOutput::success(message, data))
    }
}

fn select_mentioned(prompt: &str, context: &ContextValues) -> ContextValues {
    let prompt = prompt.to_ascii_lowercase();
    context
        .iter()
        .filter(|(key, _)| {
            let key = key.to_ascii_lowercase();
            let spaced = key.replace(['.', '_', '-'], " ");
            prompt.contains(&key) || prompt.contains(&spaced)
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invocation(prompt: &str, context: ContextValues) -> ToolInvocation {
        ToolInvocation {
            session_id: "s-1".to_string(),
            task_id: "t-1".to_string(),
            prompt: prompt.to_string(),
            context,
        }
    }

    fn facts() -> ContextValues {
        ContextValues::from([
            ("flight_price".to_string(), json!(412)),
            ("hotel".to_string(), json!("Casa Azul")),
        ])
    }

    #[tokio::test(flavor = "current_thread")]
    async fn data_tool_selects_mentioned_keys() {
        let output = DataTool
            .execute(&invocation("Compare the flight price with the budget", facts()))
            .await
            .expect("data step should run");
        assert!(output.success);
        assert_eq!(output.message, "flight_price: 412");
        assert_eq!(output.data, json!({ "flight_price": 412 }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn data_tool_falls_back_to_all_facts() {
        let output = DataTool
            .execute(&invocation("Summarize the trip", facts()))
            .await
            .expect("data step should run");
        assert_eq!(output.message, "flight_price: 412\nhotel: Casa Azul");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn data_tool_without_facts_fails_the_step() {
        let output = DataTool
            .execute(&invocation("Summarize", ContextValues::new()))
            .await
            .expect("data step should run");
        assert!(!output.success);
    }
}
