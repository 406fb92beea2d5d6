//! Collaborator interfaces consumed by the cortex core.
//!
//! The concrete HTTP implementations live next to the code that uses them
//! (`cortex-stream`, `cortex-jobs`); tests substitute scripted fakes.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::Result;
use crate::models::{CancelJobResponse, JobId, JobStatusResponse, StartJobRequest, StartJobResponse};

/// Progressively readable response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Transport that opens a streamed chat reply.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Issue the request and return its body as a byte stream.
    ///
    /// Implementations must fail with [`crate::Error::Server`] or
    /// [`crate::Error::RateLimited`] on a non-success status without handing
    /// the body out as a stream.
    async fn open(&self, conversation_id: &str, message: &str) -> Result<ByteStream>;
}

/// Transport for indexing job submission, status and cancellation.
#[async_trait]
pub trait JobTransport: Send + Sync {
    /// Submit a job for one target.
    async fn start(&self, request: &StartJobRequest) -> Result<StartJobResponse>;

    /// Fetch the current status of a job.
    async fn status(&self, job_id: &JobId) -> Result<JobStatusResponse>;

    /// Ask the server to cancel a job.
    async fn cancel(&self, job_id: &JobId) -> Result<CancelJobResponse>;
}

/// Synchronous key-value persistence scoped to one client installation.
///
/// The key space is shared with other writers, so readers must tolerate
/// values they did not write.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Option<String>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Returns whether a value was present.
    fn remove(&self, key: &str) -> Result<bool>;

    /// All keys currently stored.
    fn keys(&self) -> Vec<String>;

    /// Keys beginning with `prefix`.
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect()
    }
}
