//! Tracing subscriber setup shared by cortex binaries.
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! binary's job. Field names used across crates:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `job_id` | Server-assigned job id |
//! | `target` | Target resource a job runs against |
//! | `user` | Owning user of a job |
//! | `conversation` | Conversation id of a streaming session |
//! | `status` / `progress` | Job status and percentage |
//! | `http_status` | HTTP status of a rejected request |
//! | `duration_ms` | Wall-clock duration |
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded client state, requires attention |
//! | WARN  | Recoverable issue (failed poll, failed server cancel) |
//! | INFO  | Lifecycle events: job submitted/quiesced, stream finished |
//! | DEBUG | Decision points: guard refusals, phase transitions |
//! | TRACE | Per-frame and per-poll data |

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "cortex=info,cortex_core=info,cortex_stream=info,cortex_jobs=info";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parse a format name; anything other than `json` is text.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Force ANSI colors on or off. `None` lets the formatter decide.
    pub ansi: Option<bool>,
}

impl LoggingConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `CORTEX_LOG_FORMAT` | `text` | `text` or `json` |
    /// | `CORTEX_LOG_ANSI` | (auto) | `true`/`false` |
    pub fn from_env() -> Self {
        let format = std::env::var("CORTEX_LOG_FORMAT")
            .map(|v| LogFormat::parse(&v))
            .unwrap_or_default();
        let ansi = std::env::var("CORTEX_LOG_ANSI")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        Self { format, ansi }
    }
}

/// Install the global subscriber, writing to stderr. Later calls are ignored.
pub fn init(config: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Text => {
            let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if let Some(ansi) = config.ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).try_init()
        }
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
