//! # cortex-core
//!
//! Core types, traits, and abstractions for the cortex client.
//!
//! This crate provides the error taxonomy, domain models, collaborator traits
//! (chat transport, job transport, key-value store) and the shared defaults
//! that the streaming and job-tracking crates depend on.

pub mod defaults;
pub mod error;
pub mod events;
pub mod http;
pub mod logging;
pub mod models;
pub mod store;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{EventBus, JobEvent, QuiesceReason};
pub use http::ApiConfig;
pub use models::*;
pub use store::{JsonFileStore, MemoryStore};
pub use traits::*;
