//! Plan execution for operator requests.
//!
//! A [`PlanEngine`] asks its [`Collaborator`] for a plan, runs the parsed steps
//! one at a time through the [`ToolRegistry`], and folds extracted facts into
//! the session's [`ContextStore`] so later steps and the final answer can use
//! them.

pub mod chat;
pub mod collaborator;
pub mod context;
pub mod engine;
pub mod errors;
pub mod events;
pub mod parse;
pub mod tools;
pub mod tracker;

pub use chat::{ChatCompletionsCollaborator, ChatCompletionsConfig};
pub use collaborator::{Collaborator, ToolSelection};
pub use context::{ContextStore, ContextValues, validate_context_key};
pub use engine::{
    EngineConfig, EngineState, PlanEngine, PlanRunResult, RunStatus, StepResult,
    fallback_summary,
};
pub use errors::PlanError;
pub use events::{
    EngineEvent, EngineEventKind, EngineEventObserver, EngineEventReceiver, EngineEventSender,
    EngineEventSink, PlanEvent, SharedEngineEventObserver, StepEvent, engine_event_channel,
};
pub use parse::{PlanStep, parse_plan, parse_plan_line};
pub use tools::{
    BrowserTool, DataTool, ShellTool, StepTool, ToolInvocation, ToolOutput, ToolRegistry,
    extract_shell_command,
};
pub use tracker::TaskTracker;
