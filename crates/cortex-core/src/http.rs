//! HTTP client configuration and response classification shared by the
//! chat and job transports.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::debug;

use crate::defaults;
use crate::error::{Error, Result};

/// Connection settings for the backend API.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL, without trailing slash.
    pub base_url: String,
    /// Bearer token (optional for local backends).
    pub api_token: Option<String>,
    /// Timeout for non-streaming requests in seconds.
    pub timeout_seconds: u64,
    /// Connect timeout in seconds.
    pub connect_timeout_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::API_URL.to_string(),
            api_token: None,
            timeout_seconds: defaults::REQUEST_TIMEOUT_SECS,
            connect_timeout_seconds: defaults::STREAM_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl ApiConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `CORTEX_API_URL` | `http://127.0.0.1:5127` | Backend base URL |
    /// | `CORTEX_API_TOKEN` | (none) | Bearer token |
    /// | `CORTEX_TIMEOUT_SECS` | `30` | Request timeout |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("CORTEX_API_URL").unwrap_or(defaults.base_url),
            api_token: std::env::var("CORTEX_API_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            timeout_seconds: std::env::var("CORTEX_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timeout_seconds),
            connect_timeout_seconds: defaults.connect_timeout_seconds,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Absolute URL for an endpoint path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Client for request/response calls (overall timeout applies).
    pub fn request_client(&self) -> Result<Client> {
        Client::builder()
            .timeout(Duration::from_secs(self.timeout_seconds))
            .connect_timeout(Duration::from_secs(self.connect_timeout_seconds))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))
    }

    /// Client for streamed bodies (connect timeout only).
    pub fn streaming_client(&self) -> Result<Client> {
        Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_seconds))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))
    }

    /// Attach authentication if configured.
    pub fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match self.api_token {
            Some(ref token) => req.bearer_auth(token),
            None => req,
        }
    }
}

/// Map a non-success status to the error taxonomy.
pub fn classify_status(status: u16, retry_after: Option<Duration>, message: String) -> Error {
    if status == StatusCode::TOO_MANY_REQUESTS.as_u16() {
        Error::RateLimited {
            retry_after,
            message,
        }
    } else {
        Error::Server { status, message }
    }
}

/// Parse a `Retry-After` header value (delay-seconds or HTTP-date).
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Pass a success response through; turn anything else into an error without
/// treating its body as a stream.
pub async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, Utc::now()));
    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown error").to_string());

    debug!(http_status = status.as_u16(), %message, "Request rejected");
    Err(classify_status(status.as_u16(), retry_after, message))
}

/// Pull a human-readable message out of an error body (`{"message": ..}`,
/// `{"error": ..}`, `{"error": {"message": ..}}` or plain text).
fn error_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
        return Some(trimmed.to_string());
    };
    let text = value
        .get("message")
        .or_else(|| value.get("error").and_then(|e| e.get("message")))
        .or_else(|| value.get("error"))
        .or_else(|| value.get("detail"))
        .or_else(|| value.get("title"))
        .and_then(|v| v.as_str())
        .map(String::from);
    text.or_else(|| Some(trimmed.to_string()))
}
