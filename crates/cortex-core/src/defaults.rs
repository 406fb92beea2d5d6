//! Centralized default constants for cortex.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic numbers.

// =============================================================================
// API
// =============================================================================

/// Default backend base URL.
pub const API_URL: &str = "http://127.0.0.1:5127";

/// Timeout for non-streaming requests (job start/status/cancel) in seconds.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Connect timeout for streaming requests in seconds. Streaming bodies have
/// no overall timeout since a reply can take minutes.
pub const STREAM_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Chat streaming endpoint path.
pub const CHAT_STREAM_PATH: &str = "/api/chat/stream";

/// Indexing endpoints base path.
pub const INDEXING_PATH: &str = "/api/indexing";

// =============================================================================
// JOB TRACKING
// =============================================================================

/// Status poll interval while a job is pending or running, in milliseconds.
pub const JOB_POLL_INTERVAL_MS: u64 = 1_000;

/// Hard ceiling on how long a single job is polled before it is force-quiesced
/// (30 minutes).
pub const JOB_MAX_TRACKING_SECS: u64 = 30 * 60;

/// Maximum age of a ledger entry before it is pruned without asking the
/// server (24 hours).
pub const LEDGER_MAX_AGE_SECS: u64 = 24 * 60 * 60;

/// Key prefix for ledger entries in the shared key-value store.
pub const LEDGER_KEY_PREFIX: &str = "cortex.job.";

/// Default embedding provider sent with indexing requests.
pub const INDEX_PROVIDER: &str = "openai";

/// Targets expanded by an "index everywhere" request when none are configured.
pub const INDEX_TARGETS: &[&str] = &["postgresql", "pinecone"];

/// Owner recorded on ledger entries when no user is configured.
pub const DEFAULT_USER: &str = "local";

// =============================================================================
// EVENTS
// =============================================================================

/// Default event bus broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Default state file name for the JSON file store.
pub const STATE_FILE: &str = "cortex-state.json";
