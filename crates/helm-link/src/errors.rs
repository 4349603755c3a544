use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,
    #[error("dispatch failed: {0}")]
    Dispatch(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("a completion handler is already registered for task '{0}'")]
    AlreadyAwaiting(String),
    #[error("task '{task_id}' did not complete within {timeout_ms}ms")]
    CompletionTimeout { task_id: String, timeout_ms: u64 },
    #[error("completion handler for task '{0}' was dropped before settlement")]
    CompletionAbandoned(String),
    #[error("synchronizer state error: {0}")]
    State(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for LinkError {
    fn from(error: reqwest::Error) -> Self {
        LinkError::Dispatch(error.to_string())
    }
}
