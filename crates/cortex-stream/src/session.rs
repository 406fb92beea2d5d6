//! Streaming session: drives one decoder end-to-end for a chat turn.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use cortex_core::http::classify_status;
use cortex_core::{ChatTransport, Error, Result, StreamEvent};

use crate::decoder::decode_stream;

type TokenCallback = Box<dyn Fn(&str) + Send + Sync>;
type EndCallback = Box<dyn Fn(&str) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&Error) + Send + Sync>;

/// Callbacks invoked while a turn streams. All are optional.
#[derive(Default)]
pub struct StreamCallbacks {
    on_token: Option<TokenCallback>,
    on_end: Option<EndCallback>,
    on_error: Option<ErrorCallback>,
}

impl StreamCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per token, in arrival order, after it was appended.
    pub fn on_token<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_token = Some(Box::new(callback));
        self
    }

    /// Called once with the full content when the end marker arrives.
    pub fn on_end<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_end = Some(Box::new(callback));
        self
    }

    /// Called once on a fatal error (not on cancellation).
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    fn token(&self, text: &str) {
        if let Some(ref callback) = self.on_token {
            callback(text);
        }
    }

    fn end(&self, content: &str) {
        if let Some(ref callback) = self.on_end {
            callback(content);
        }
    }

    fn error(&self, err: &Error) {
        if let Some(ref callback) = self.on_error {
            callback(err);
        }
    }
}

/// Category of a session's terminal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalErrorKind {
    Transport,
    Server,
    RateLimited,
    Other,
}

/// Cloneable projection of the error that ended a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalError {
    pub kind: TerminalErrorKind,
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl From<&Error> for TerminalError {
    fn from(err: &Error) -> Self {
        let kind = match err {
            Error::Transport(_) => TerminalErrorKind::Transport,
            Error::Server { .. } => TerminalErrorKind::Server,
            Error::RateLimited { .. } => TerminalErrorKind::RateLimited,
            _ => TerminalErrorKind::Other,
        };
        Self {
            kind,
            status: err.status_code(),
            retry_after: err.retry_after(),
            message: err.to_string(),
        }
    }
}

/// Live state of a session, published on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Conversation the current (or last) turn belongs to.
    pub target: Option<String>,
    /// False iff the session is idle or reached End, Error or cancellation.
    pub is_streaming: bool,
    /// Append-only while streaming.
    pub content: String,
    pub error: Option<TerminalError>,
}

/// One streaming chat session.
///
/// `begin` calls are serialized: a second call waits for the first to finish
/// and then starts from a clean state. `cancel` and `reset` may be called
/// from any task.
pub struct StreamingSession {
    transport: Arc<dyn ChatTransport>,
    state: watch::Sender<SessionSnapshot>,
    run_lock: tokio::sync::Mutex<()>,
    in_flight: Mutex<Option<CancellationToken>>,
    /// Bumped by every `begin` and `reset`; writes from older turns are discarded.
    generation: AtomicU64,
}

impl StreamingSession {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        Self {
            transport,
            state,
            run_lock: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Stream one turn and resolve with the reply (surrounding whitespace trimmed).
    #[instrument(skip(self, message, callbacks), fields(conversation = %target))]
    pub async fn begin(
        &self,
        target: &str,
        message: &str,
        callbacks: StreamCallbacks,
    ) -> Result<String> {
        let _turn = self.run_lock.lock().await;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        *self.lock_in_flight() = Some(cancel.clone());

        self.state.send_replace(SessionSnapshot {
            target: Some(target.to_string()),
            is_streaming: true,
            content: String::new(),
            error: None,
        });

        let mut guard = TurnGuard {
            session: self,
            generation,
            cancel: cancel.clone(),
            armed: true,
        };

        let started = Instant::now();
        let result = self
            .drive(generation, target, message, &callbacks, &cancel)
            .await;
        guard.armed = false;

        // Turns are serialized, so a parked token is ours. If it is gone a
        // `cancel` already claimed this turn.
        let owned = self.lock_in_flight().take().is_some() && !cancel.is_cancelled();
        let result = settle(result, owned);

        match result {
            Ok(content) => {
                callbacks.end(&content);
                self.update(generation, |s| s.is_streaming = false);
                info!(
                    response_len = content.len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Stream finished"
                );
                Ok(content.trim().to_string())
            }
            Err(Error::Cancelled) => {
                self.update(generation, |s| s.is_streaming = false);
                debug!("Stream cancelled");
                Err(Error::Cancelled)
            }
            Err(e) => {
                let terminal = TerminalError::from(&e);
                self.update(generation, |s| {
                    s.is_streaming = false;
                    s.error = Some(terminal);
                });
                warn!(error = %e, http_status = ?e.status_code(), "Stream failed");
                callbacks.error(&e);
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        generation: u64,
        target: &str,
        message: &str,
        callbacks: &StreamCallbacks,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            body = self.transport.open(target, message) => body?,
        };

        let mut events = decode_stream(body);
        let mut content = String::new();
        let mut token_count: usize = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = events.next() => next,
            };

            match next {
                Some(Ok(StreamEvent::Token { text })) => {
                    content.push_str(&text);
                    token_count += 1;
                    self.update(generation, |s| s.content.push_str(&text));
                    callbacks.token(&text);
                }
                Some(Ok(StreamEvent::End)) => {
                    debug!(token_count, "End marker received");
                    return Ok(content);
                }
                None => {
                    debug!(token_count, "Body ended without end marker");
                    return Ok(content);
                }
                Some(Ok(StreamEvent::Error { code, message })) => {
                    return Err(match code {
                        Some(status) => classify_status(status, None, message),
                        None => Error::Transport(message),
                    });
                }
                Some(Err(e)) => return Err(e),
            }
        }
    }

    /// Abort the in-flight turn, if any. Returns whether one was running.
    ///
    /// The transport is dropped promptly, `on_end` is never invoked, and
    /// `begin` resolves with [`Error::Cancelled`].
    pub fn cancel(&self) -> bool {
        match self.lock_in_flight().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Consumer teardown: cancel and clear all state.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel();
        self.state.send_replace(SessionSnapshot::default());
    }

    /// Subscribe to live state.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.state.borrow().is_streaming
    }

    pub fn content(&self) -> String {
        self.state.borrow().content.clone()
    }

    pub fn error(&self) -> Option<TerminalError> {
        self.state.borrow().error.clone()
    }

    fn update(&self, generation: u64, f: impl FnOnce(&mut SessionSnapshot)) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.state.send_modify(f);
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A completed body still ends the turn as cancelled once a `cancel` has
/// claimed it, so `on_end` never follows a successful `cancel`.
fn settle(result: Result<String>, owned: bool) -> Result<String> {
    match result {
        Ok(_) if !owned => Err(Error::Cancelled),
        other => other,
    }
}

/// Ends a turn whose `begin` future was dropped before it finished.
struct TurnGuard<'a> {
    session: &'a StreamingSession,
    generation: u64,
    cancel: CancellationToken,
    armed: bool,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancel.cancel();
        self.session.lock_in_flight().take();
        self.session
            .update(self.generation, |s| s.is_streaming = false);
        debug!("Stream abandoned by caller");
    }
}
