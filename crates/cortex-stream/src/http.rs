//! HTTP implementation of [`ChatTransport`].

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Client;
use tracing::debug;

use cortex_core::defaults::CHAT_STREAM_PATH;
use cortex_core::http::check_response;
use cortex_core::{ApiConfig, ByteStream, ChatRequest, ChatTransport, Error, Result};

/// Opens chat replies with `POST /api/chat/stream`.
pub struct HttpChatTransport {
    client: Client,
    config: ApiConfig,
}

impl HttpChatTransport {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let client = config.streaming_client()?;
        Ok(Self { client, config })
    }

    /// Create from environment variables (see [`ApiConfig::from_env`]).
    pub fn from_env() -> Result<Self> {
        Self::new(ApiConfig::from_env())
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn open(&self, conversation_id: &str, message: &str) -> Result<ByteStream> {
        let url = self.config.url(CHAT_STREAM_PATH);
        let body = ChatRequest {
            conversation_id: conversation_id.to_string(),
            message: message.to_string(),
        };

        debug!(%url, conversation = conversation_id, "Opening chat stream");
        let request = self
            .client
            .post(&url)
            .header(ACCEPT, "text/event-stream")
            .json(&body);
        let response = self
            .config
            .authorize(request)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Chat request failed: {e}")))?;

        let response = check_response(response).await?;

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Transport(format!("Stream read failed: {e}"))));
        Ok(Box::pin(bytes))
    }
}
