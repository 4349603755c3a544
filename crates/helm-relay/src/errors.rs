use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("upstream i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("rfb protocol error: {0}")]
    Protocol(String),
    #[error("rfb authentication failed: {0}")]
    AuthFailed(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("upstream connection timed out after {0} ms")]
    ConnectTimeout(u64),
    #[error("relay state error: {0}")]
    State(String),
}

impl RelayError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}
