//! # cortex-stream
//!
//! Streamed chat replies for cortex.
//!
//! - [`decoder`]: incremental line-framed decoding of a response body
//! - [`session`]: one chat turn end-to-end, with live state and cancellation
//! - [`http`]: the HTTP [`cortex_core::ChatTransport`]

pub mod decoder;
pub mod http;
pub mod session;

pub use decoder::{decode_stream, EventStream, StreamDecoder};
pub use http::HttpChatTransport;
pub use session::{
    SessionSnapshot, StreamCallbacks, StreamingSession, TerminalError, TerminalErrorKind,
};
