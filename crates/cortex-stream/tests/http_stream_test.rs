//! Integration tests for the HTTP chat transport against a mock backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cortex_core::{ApiConfig, Error};
use cortex_stream::{HttpChatTransport, StreamCallbacks, StreamingSession, TerminalErrorKind};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn session_for(server: &MockServer) -> StreamingSession {
    let config = ApiConfig::default()
        .with_base_url(server.uri())
        .with_api_token("test-token");
    let transport = HttpChatTransport::new(config).expect("Failed to create transport");
    StreamingSession::new(Arc::new(transport))
}

#[tokio::test]
async fn test_streamed_reply_is_decoded() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat/stream"))
        .and(header("Authorization", "Bearer test-token"))
        .and(body_json(serde_json::json!({
            "conversationId": "conv-42",
            "message": "hello?"
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/event-stream")
                .set_body_string(
                    ": ping\n\ndata: Hello\ndata: {\"type\":\"sources\",\"ids\":[1]}\ndata: World\ndata: [DONE]\n",
                ),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let session = session_for(&mock_server);
    let tokens = Arc::new(Mutex::new(Vec::new()));
    let seen = tokens.clone();

    let reply = session
        .begin(
            "conv-42",
            "hello?",
            StreamCallbacks::new().on_token(move |t| seen.lock().unwrap().push(t.to_string())),
        )
        .await
        .expect("stream should succeed");

    assert_eq!(reply, "Hello World");
    assert_eq!(*tokens.lock().unwrap(), vec![" Hello", " World"]);
    assert!(!session.is_streaming());
}

#[tokio::test]
async fn test_rate_limit_surfaces_retry_after() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat/stream"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "12")
                .set_body_json(serde_json::json!({ "message": "Too many requests" })),
        )
        .mount(&mock_server)
        .await;

    let session = session_for(&mock_server);
    let result = session.begin("c", "m", StreamCallbacks::new()).await;

    match result {
        Err(Error::RateLimited {
            retry_after,
            message,
        }) => {
            assert_eq!(retry_after, Some(Duration::from_secs(12)));
            assert_eq!(message, "Too many requests");
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    let terminal = session.error().expect("error should be recorded");
    assert_eq!(terminal.kind, TerminalErrorKind::RateLimited);
    assert!(session.content().is_empty());
}

#[tokio::test]
async fn test_server_error_body_is_not_streamed() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat/stream"))
        .respond_with(ResponseTemplate::new(500).set_body_string("data: not a token\n"))
        .mount(&mock_server)
        .await;

    let session = session_for(&mock_server);
    let tokens = Arc::new(Mutex::new(0usize));
    let seen = tokens.clone();
    let result = session
        .begin(
            "c",
            "m",
            StreamCallbacks::new().on_token(move |_| *seen.lock().unwrap() += 1),
        )
        .await;

    assert!(matches!(result, Err(Error::Server { status: 500, .. })));
    assert_eq!(*tokens.lock().unwrap(), 0);
    assert!(session.content().is_empty());
}

#[tokio::test]
async fn test_unreachable_backend_is_transport_error() {
    let config = ApiConfig::default().with_base_url("http://127.0.0.1:1");
    let transport = HttpChatTransport::new(config).expect("Failed to create transport");
    let session = StreamingSession::new(Arc::new(transport));

    let result = session.begin("c", "m", StreamCallbacks::new()).await;
    assert!(matches!(result, Err(Error::Transport(_))));
    assert_eq!(
        session.error().map(|e| e.kind),
        Some(TerminalErrorKind::Transport)
    );
}
