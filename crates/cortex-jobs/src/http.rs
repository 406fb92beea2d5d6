//! HTTP implementation of [`JobTransport`] against the indexing endpoints.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use cortex_core::defaults::INDEXING_PATH;
use cortex_core::http::check_response;
use cortex_core::{
    ApiConfig, CancelJobResponse, Error, JobId, JobStatusResponse, JobTransport, Result,
    StartJobRequest, StartJobResponse,
};

/// Client for `/api/indexing`.
pub struct HttpJobClient {
    client: Client,
    config: ApiConfig,
}

impl HttpJobClient {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let client = config.request_client()?;
        Ok(Self { client, config })
    }

    /// Create from environment variables (see [`ApiConfig::from_env`]).
    pub fn from_env() -> Result<Self> {
        Self::new(ApiConfig::from_env())
    }

    /// Indexing URL with `segments` appended, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let base = self.config.url(INDEXING_PATH);
        let mut url =
            Url::parse(&base).map_err(|e| Error::Config(format!("Invalid API URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("API URL cannot have a path: {base}")))?
            .extend(segments);
        Ok(url)
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let body = response
        .text()
        .await
        .map_err(|e| Error::Transport(format!("Failed to read response: {e}")))?;
    serde_json::from_str(&body).map_err(|e| Error::Serialization(format!("Unexpected response: {e}")))
}

#[async_trait]
impl JobTransport for HttpJobClient {
    async fn start(&self, request: &StartJobRequest) -> Result<StartJobResponse> {
        let url = self.endpoint(&["start"])?;
        debug!(%url, target = %request.target, "Submitting indexing job");

        let response = self
            .config
            .authorize(self.client.post(url).json(request))
            .send()
            .await
            .map_err(Error::from)?;
        read_json(check_response(response).await?).await
    }

    async fn status(&self, job_id: &JobId) -> Result<JobStatusResponse> {
        let url = self.endpoint(&["status", job_id.as_str()])?;

        let response = self
            .config
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(Error::from)?;
        read_json(check_response(response).await?).await
    }

    async fn cancel(&self, job_id: &JobId) -> Result<CancelJobResponse> {
        let url = self.endpoint(&[job_id.as_str()])?;
        debug!(%url, job_id = %job_id, "Cancelling indexing job");

        let response = self
            .config
            .authorize(self.client.delete(url))
            .send()
            .await
            .map_err(Error::from)?;
        let response = check_response(response).await?;

        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("Failed to read response: {e}")))?;
        if body.trim().is_empty() {
            return Ok(CancelJobResponse { message: None });
        }
        Ok(serde_json::from_str(&body).unwrap_or(CancelJobResponse {
            message: Some(body.trim().to_string()),
        }))
    }
}
