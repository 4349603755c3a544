use crate::LinkError;
use crate::protocol::{DispatchRequest, DispatchResponse};
use async_trait::async_trait;
use std::time::Duration;

/// Out-of-band request that hands a prompt to the remote agent.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse, LinkError>;
}

/// Posts `{task, taskId?}` to `{base_url}/api/task`.
#[derive(Clone, Debug)]
pub struct HttpTaskDispatcher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTaskDispatcher {
    pub fn new(base_url: &str) -> Result<Self, LinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/api/task", base_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TaskDispatcher for HttpTaskDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse, LinkError> {
        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LinkError::Dispatch(format!(
                "peer rejected task with {status}: {body}"
            )));
        }
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(DispatchResponse::default());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}
