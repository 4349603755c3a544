//! Turns one operator request into a sequentially executed plan.
//!
//! Per session the engine moves `Idle → Planning → Executing → Synthesizing →
//! Idle`. A second request for a busy session is rejected; different sessions
//! run independently. Step failures are recorded and, unless
//! [`EngineConfig::stop_on_failure`] is set, execution continues with the next
//! step.

use crate::PlanError;
use crate::collaborator::Collaborator;
use crate::context::ContextStore;
use crate::events::{EngineEventKind, EngineEventSink, PlanEvent, StepEvent, engine_event};
use crate::parse::{PlanStep, parse_plan};
use crate::tools::{ToolInvocation, ToolRegistry};
use helm_store::{ChatMessage, ChatRole, HistoryStore, StoreError, Task, TaskStatus, ToolKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineConfig {
    pub stop_on_failure: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Planning,
    Executing { step: usize, total: usize },
    Synthesizing,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step: PlanStep,
    pub tool: Option<ToolKind>,
    pub task_id: Option<String>,
    pub success: bool,
    pub message: String,
    pub facts_stored: usize,
}

impl StepResult {
    fn pending(step: &PlanStep) -> Self {
        Self {
            step: step.clone(),
            tool: None,
            task_id: None,
            success: false,
            message: String::new(),
            facts_stored: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    PlanningFailed,
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRunResult {
    pub session_id: String,
    pub status: RunStatus,
    pub steps: Vec<StepResult>,
    pub response: String,
}

pub struct PlanEngine {
    collaborator: Arc<dyn Collaborator>,
    tools: ToolRegistry,
    store: Arc<dyn HistoryStore>,
    context: ContextStore,
    config: EngineConfig,
    events: EngineEventSink,
    sessions: Arc<Mutex<HashMap<String, EngineState>>>,
    sequence: AtomicU64,
}

impl PlanEngine {
    pub fn new(
        collaborator: Arc<dyn Collaborator>,
        tools: ToolRegistry,
        store: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            collaborator,
            tools,
            store,
            context: ContextStore::new(),
            config: EngineConfig::default(),
            events: EngineEventSink::default(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            sequence: AtomicU64::new(1),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_context(mut self, context: ContextStore) -> Self {
        self.context = context;
        self
    }

    pub fn with_events(mut self, events: EngineEventSink) -> Self {
        self.events = events;
        self
    }

    pub fn context(&self) -> &ContextStore {
        &self.context
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    pub fn state(&self, session_id: &str) -> EngineState {
        self.sessions
            .lock()
            .ok()
            .and_then(|sessions| sessions.get(session_id).cloned())
            .unwrap_or(EngineState::Idle)
    }

    pub async fn handle_request(
        &self,
        session_id: &str,
        request: &str,
    ) -> Result<PlanRunResult, PlanError> {
        let guard = SessionGuard::acquire(&self.sessions, session_id)?;
        self.context.clear(session_id)?;
        self.store
            .append_message(ChatMessage::new(session_id, ChatRole::User, request))
            .await?;
        info!(session_id, "plan requested");
        self.emit(
            session_id,
            EngineEventKind::Plan(PlanEvent::Started {
                request: request.to_string(),
            }),
        );

        let steps = match self.collaborator.generate_plan(request).await {
            Ok(plan) => parse_plan(&plan),
            Err(error) => {
                return self
                    .planning_failed(session_id, format!("Planning failed: {error}"))
                    .await;
            }
        };
        if steps.is_empty() {
            let reason = "Planning failed: the plan contained no steps".to_string();
            return self.planning_failed(session_id, reason).await;
        }
        let total = steps.len();
        self.emit(
            session_id,
            EngineEventKind::Plan(PlanEvent::Parsed { step_count: total }),
        );

        let mut results = Vec::with_capacity(total);
        let mut aborted = false;
        for step in &steps {
            guard.set(EngineState::Executing {
                step: step.index + 1,
                total,
            });
            let result = self.run_step(session_id, step, total).await;
            let failed = !result.success;
            if failed {
                let notice = format!("Step {} failed: {}", step.index + 1, result.message);
                self.append_system_message(session_id, &notice).await;
            }
            results.push(result);
            if failed && self.config.stop_on_failure {
                warn!(session_id, step = step.index + 1, "stopping plan after failed step");
                aborted = true;
                break;
            }
        }

        guard.set(EngineState::Synthesizing);
        let context = self.context.snapshot(session_id)?;
        let response = match self
            .collaborator
            .synthesize_response(request, &results, &context)
            .await
        {
            Ok(response) => response,
            Err(error) => {
                warn!(session_id, error = %error, "synthesis failed; using step summary");
                fallback_summary(request, &results)
            }
        };
        self.store
            .append_message(ChatMessage::new(session_id, ChatRole::Assistant, &response))
            .await?;

        let failure_count = results.iter().filter(|result| !result.success).count();
        let status = if aborted {
            self.emit(
                session_id,
                EngineEventKind::Plan(PlanEvent::Failed {
                    reason: format!("aborted after {} of {} steps", results.len(), total),
                }),
            );
            RunStatus::Aborted
        } else {
            self.emit(
                session_id,
                EngineEventKind::Plan(PlanEvent::Completed {
                    step_count: results.len(),
                    failure_count,
                }),
            );
            RunStatus::Completed
        };
        info!(session_id, steps = results.len(), failure_count, "plan finished");
        drop(guard);

        Ok(PlanRunResult {
            session_id: session_id.to_string(),
            status,
            steps: results,
            response,
        })
    }

    async fn planning_failed(
        &self,
        session_id: &str,
        message: String,
    ) -> Result<PlanRunResult, PlanError> {
        warn!(session_id, reason = %message, "planning failed");
        self.append_system_message(session_id, &message).await;
        self.emit(
            session_id,
            EngineEventKind::Plan(PlanEvent::Failed {
                reason: message.clone(),
            }),
        );
        Ok(PlanRunResult {
            session_id: session_id.to_string(),
            status: RunStatus::PlanningFailed,
            steps: Vec::new(),
            response: message,
        })
    }

    async fn run_step(&self, session_id: &str, step: &PlanStep, total: usize) -> StepResult {
        let mut result = StepResult::pending(step);
        if let Err(error) = self.execute_step(session_id, step, total, &mut result).await {
            warn!(session_id, step = step.index + 1, error = %error, "step failed");
            result.success = false;
            result.message = error.to_string();
        }
        self.emit(
            session_id,
            EngineEventKind::Step(StepEvent::Completed {
                index: step.index,
                total,
                task_id: result.task_id.clone(),
                success: result.success,
                message: result.message.clone(),
            }),
        );
        result
    }

    async fn execute_step(
        &self,
        session_id: &str,
        step: &PlanStep,
        total: usize,
        result: &mut StepResult,
    ) -> Result<(), PlanError> {
        let context = self.context.snapshot(session_id)?;
        let prompt = if context.is_empty() {
            step.text.clone()
        } else {
            let enriched = self.collaborator.enrich_step(step, &context).await?;
            if enriched.trim().is_empty() {
                step.text.clone()
            } else {
                enriched
            }
        };
        let tool = match step.tool_hint {
            Some(tool) => tool,
            None => self.collaborator.select_tool(step, &context).await?.tool,
        };
        result.tool = Some(tool);

        let mut task = Task::new(
            uuid::Uuid::new_v4().to_string(),
            session_id,
            step.text.clone(),
            tool,
        );
        if prompt != step.text {
            task = task.with_enriched_prompt(prompt.clone());
        }
        task.mark_running();
        let mut task = self.store.create_task(task).await?;
        result.task_id = Some(task.id.clone());
        self.emit(
            session_id,
            EngineEventKind::Step(StepEvent::Started {
                index: step.index,
                total,
                tool,
                text: step.text.clone(),
            }),
        );

        let invocation = ToolInvocation {
            session_id: session_id.to_string(),
            task_id: task.id.clone(),
            prompt,
            context,
        };
        let outcome = self.tools.dispatch(tool, &invocation).await;
        match &outcome {
            Ok(output) if output.success => task.complete(json!({
                "message": output.message,
                "data": output.data,
            })),
            Ok(output) => task.fail(TaskStatus::Failed, output.message.clone()),
            Err(error) => task.fail(TaskStatus::Error, error.to_string()),
        }
        self.finish_task(task).await?;

        let output = outcome?;
        result.message = output.message.clone();
        if !output.success {
            return Ok(());
        }
        let facts = self.collaborator.extract_facts(step, &output).await?;
        self.context.store_many(session_id, &facts)?;
        result.facts_stored = facts.len();
        result.success = true;
        Ok(())
    }

    async fn finish_task(&self, task: Task) -> Result<(), PlanError> {
        match self.store.update_task(task).await {
            Ok(_) => Ok(()),
            // Link events already moved the task to a terminal status.
            Err(StoreError::Conflict(reason)) => {
                debug!(reason = %reason, "task already settled");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn append_system_message(&self, session_id: &str, content: &str) {
        if let Err(error) = self
            .store
            .append_message(ChatMessage::new(session_id, ChatRole::System, content))
            .await
        {
            warn!(session_id, error = %error, "failed to store system message");
        }
    }

    fn emit(&self, session_id: &str, kind: EngineEventKind) {
        if !self.events.is_enabled() {
            return;
        }
        let sequence_no = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.events.emit(engine_event(sequence_no, session_id, kind));
    }
}

/// Marks a session busy for the lifetime of one request.
struct SessionGuard {
    sessions: Arc<Mutex<HashMap<String, EngineState>>>,
    session_id: String,
}

impl SessionGuard {
    fn acquire(
        sessions: &Arc<Mutex<HashMap<String, EngineState>>>,
        session_id: &str,
    ) -> Result<Self, PlanError> {
        let mut active = sessions
            .lock()
            .map_err(|_| PlanError::Context("session table poisoned".to_string()))?;
        if active.contains_key(session_id) {
            return Err(PlanError::SessionBusy(session_id.to_string()));
        }
        active.insert(session_id.to_string(), EngineState::Planning);
        Ok(Self {
            sessions: Arc::clone(sessions),
            session_id: session_id.to_string(),
        })
    }

    fn set(&self, state: EngineState) {
        if let Ok(mut active) = self.sessions.lock() {
            active.insert(self.session_id.clone(), state);
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.sessions.lock() {
            active.remove(&self.session_id);
        }
    }
}

pub fn fallback_summary(request: &str, results: &[StepResult]) -> String {
    let succeeded = results.iter().filter(|result| result.success).count();
    let mut summary = format!(
        "Completed {succeeded} of {} steps for: {request}",
        results.len()
    );
    for result in results {
        let marker = if result.success { "ok" } else { "failed" };
        summary.push_str(&format!(
            "\n- [{marker}] {}: {}",
            result.step.text, result.message
        ));
    }
    summary
}
