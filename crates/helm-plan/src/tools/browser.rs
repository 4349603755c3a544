use super::{StepTool, ToolInvocation, ToolOutput};
use crate::PlanError;
use async_trait::async_trait;
use helm_link::{CompletionSynchronizer, LinkError, TaskOutcome, TransportLink};
use helm_store::ToolKind;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// Hands a step to the remote browser agent and waits for its completion.
#[derive(Clone)]
pub struct BrowserTool {
    synchronizer: CompletionSynchronizer,
    link: Option<TransportLink>,
    completion_timeout: Option<Duration>,
}

impl BrowserTool {
    pub fn new(synchronizer: CompletionSynchronizer) -> Self {
        Self {
            synchronizer,
            link: None,
            completion_timeout: None,
        }
    }

    /// Steps fail fast while this link is down instead of waiting on a peer
    /// that cannot report back.
    pub fn with_link(mut self, link: TransportLink) -> Self {
        self.link = Some(link);
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.completion_timeout = timeout;
        self
    }
}

#[async_trait]
impl StepTool for BrowserTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Browser
    }

    async fn execute(&self, invocation: &ToolInvocation) -> Result<ToolOutput, PlanError> {
        if let Some(link) = self.link.as_ref() {
            if !link.is_connected() {
                return Err(LinkError::NotConnected.into());
            }
        }

        // Registered before dispatch so early events for this id are not dropped.
        let waiter = self
            .synchronizer
            .await_completion(&invocation.task_id, self.completion_timeout)?;
        let dispatched = self
            .synchronizer
            .dispatch_with_id(&invocation.prompt, Some(invocation.task_id.clone()))
            .await?;

        let remote_task_id = if dispatched.task_id != invocation.task_id {
            debug!(
                task_id = %invocation.task_id,
                remote_task_id = %dispatched.task_id,
                "peer assigned a different task id"
            );
            self.synchronizer
                .rekey(&invocation.task_id, &dispatched.task_id)?;
            Some(dispatched.task_id.clone())
        } else {
            None
        };

        let outcome = waiter.wait().await?;
        info!(
            task_id = %dispatched.task_id,
            success = outcome.is_success(),
            "browser step settled"
        );
        let data = json!({
            "taskId": dispatched.task_id,
            "status": dispatched.status,
        });
        let mut output = match outcome {
            TaskOutcome::Completed { message } => ToolOutput::success(message, data),
            TaskOutcome::Failed { error } => ToolOutput::failure(error, data),
            TaskOutcome::Cancelled { reason } => {
                ToolOutput::failure(format!("cancelled: {reason}"), data)
            }
        };
        output.remote_task_id = remote_task_id;
        Ok(output)
    }
}
