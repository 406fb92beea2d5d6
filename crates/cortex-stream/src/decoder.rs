//! Line-framed stream decoding for streamed chat replies.
//!
//! Frames are delimited by `\n` (an optional trailing `\r` is dropped).
//! Chunk boundaries carry no meaning: partial lines, including partial UTF-8
//! sequences, are buffered until their newline arrives.
//!
//! | Line | Event |
//! |------|-------|
//! | `data:<payload>` where payload is `[DONE]` | `End` |
//! | `data:<payload>` where payload is a JSON object with `"type": "end"`/`"done"` | `End` |
//! | `data:<payload>` where payload is any other JSON object | (control frame, dropped) |
//! | `data:<payload>` otherwise | `Token { text: payload }` |
//! | `event: end` / `event: done` | `End` |
//! | anything else | (dropped) |
//!
//! The payload is taken verbatim after `data:`; leading whitespace belongs to
//! the token. The decoder never produces `StreamEvent::Error`: failures are
//! judged from transport signals by the session.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::{Stream, StreamExt};
use tracing::{debug, trace};

use cortex_core::{ByteStream, Result, StreamEvent};

const DATA_PREFIX: &str = "data:";
const EVENT_PREFIX: &str = "event:";
const DONE_SENTINEL: &str = "[DONE]";

/// Stream of decoded events. Transport errors pass through as `Err`.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Incremental line decoder. One instance per response body.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    /// Start of the unscanned region of `buffer`.
    scan_from: usize,
    anomalies: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the events of every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut line_start = 0;
        let mut cursor = self.scan_from;
        while let Some(offset) = self.buffer[cursor..].iter().position(|b| *b == b'\n') {
            let end = cursor + offset;
            let line = self.buffer[line_start..end].to_vec();
            if let Some(event) = self.decode_line(&line) {
                events.push(event);
            }
            line_start = end + 1;
            cursor = line_start;
        }

        self.buffer.drain(..line_start);
        self.scan_from = self.buffer.len();
        events
    }

    /// Flush a trailing line that never got its newline (end of body).
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let line = std::mem::take(&mut self.buffer);
        self.scan_from = 0;
        if line.is_empty() {
            return Vec::new();
        }
        self.decode_line(&line).into_iter().collect()
    }

    /// Bytes held back waiting for a newline.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Lines that could not be decoded cleanly (invalid UTF-8, dropped frames).
    pub fn anomalies(&self) -> usize {
        self.anomalies
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<StreamEvent> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = match std::str::from_utf8(raw) {
            Ok(line) => std::borrow::Cow::Borrowed(line),
            Err(e) => {
                self.anomalies += 1;
                debug!(error = %e, "Invalid UTF-8 in stream line, decoding lossily");
                String::from_utf8_lossy(raw)
            }
        };

        if line.is_empty() || line.starts_with(':') {
            return None;
        }

        if let Some(payload) = line.strip_prefix(DATA_PREFIX) {
            return self.decode_data(payload);
        }

        if let Some(name) = line.strip_prefix(EVENT_PREFIX) {
            return match name.trim() {
                "end" | "done" => Some(StreamEvent::End),
                other => {
                    trace!(event = other, "Ignoring event line");
                    None
                }
            };
        }

        self.anomalies += 1;
        trace!(len = line.len(), "Dropping unrecognized stream line");
        None
    }

    fn decode_data(&mut self, payload: &str) -> Option<StreamEvent> {
        let trimmed = payload.trim();
        if trimmed == DONE_SENTINEL {
            return Some(StreamEvent::End);
        }

        if trimmed.starts_with('{') {
            if let Ok(serde_json::Value::Object(control)) =
                serde_json::from_str::<serde_json::Value>(trimmed)
            {
                let kind = control.get("type").and_then(|t| t.as_str());
                return match kind {
                    Some("end") | Some("done") => Some(StreamEvent::End),
                    _ => {
                        self.anomalies += 1;
                        trace!(?kind, "Dropping control frame");
                        None
                    }
                };
            }
        }

        if payload.is_empty() {
            self.anomalies += 1;
            trace!("Dropping empty data line");
            return None;
        }
        Some(StreamEvent::token(payload))
    }
}

/// Lazily decode a response body into events.
///
/// Each call starts from a fresh decoder. A transport error is yielded once
/// and ends the stream; a clean end of body flushes any unterminated line.
pub fn decode_stream(bytes: ByteStream) -> EventStream {
    struct State {
        bytes: ByteStream,
        decoder: StreamDecoder,
        pending: VecDeque<StreamEvent>,
        done: bool,
    }

    let state = State {
        bytes,
        decoder: StreamDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    let stream = futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok(event), st));
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => st.pending.extend(st.decoder.push(&chunk)),
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(e), st));
                }
                None => {
                    st.done = true;
                    st.pending.extend(st.decoder.finish());
                }
            }
        }
    });

    Box::pin(stream)
}
