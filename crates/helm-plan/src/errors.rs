use helm_link::LinkError;
use helm_store::{StoreError, ToolKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("session '{0}' is already running a plan")]
    SessionBusy(String),
    #[error("collaborator error: {0}")]
    Collaborator(String),
    #[error("tool error: {0}")]
    Tool(String),
    #[error("no tool registered for '{0}'")]
    UnknownTool(ToolKind),
    #[error("context error: {0}")]
    Context(String),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
