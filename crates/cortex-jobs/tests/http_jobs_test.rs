//! Integration tests for the indexing job client and coordinator against a
//! mock backend.

use std::sync::Arc;
use std::time::Duration;

use cortex_core::{
    ApiConfig, Error, EventBus, JobEvent, JobId, JobStatus, JobTransport, MemoryStore,
    StartJobRequest, TargetSpec,
};
use cortex_jobs::{
    CoordinatorConfig, HttpJobClient, JobCoordinator, JobLedger, JobPoller, PollerConfig,
    TimerRegistry,
};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> HttpJobClient {
    let config = ApiConfig::default()
        .with_base_url(server.uri())
        .with_api_token("test-token");
    HttpJobClient::new(config).expect("Failed to create client")
}

#[tokio::test]
async fn test_start_sends_camel_case_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/indexing/start"))
        .and(header("Authorization", "Bearer test-token"))
        .and(body_json(serde_json::json!({
            "target": "pinecone",
            "provider": "openai",
            "model": "text-embedding-3-small",
            "dimensions": 1536
        })))
        .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({
            "jobId": "job-7",
            "status": "pending",
            "message": "queued"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let response = client
        .start(&StartJobRequest {
            target: "pinecone".into(),
            provider: "openai".into(),
            model: Some("text-embedding-3-small".into()),
            dimensions: Some(1536),
        })
        .await
        .expect("start should succeed");

    assert_eq!(response.job_id, JobId::new("job-7"));
    assert_eq!(response.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_status_parses_progress_and_errors() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/indexing/status/job-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "partially_completed",
            "progress": 87.6,
            "errors": ["note 12: embedding failed"]
        })))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let response = client.status(&JobId::new("job-7")).await.unwrap();

    assert_eq!(response.status, JobStatus::PartiallyCompleted);
    assert!((response.progress - 87.6).abs() < f64::EPSILON);
    assert_eq!(response.errors, vec!["note 12: embedding failed"]);
}

#[tokio::test]
async fn test_status_rejections_are_classified() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/indexing/status/missing"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(serde_json::json!({ "error": "Job not found" })),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/indexing/status/busy"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3"))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);

    match client.status(&JobId::new("missing")).await {
        Err(Error::Server { status, message }) => {
            assert_eq!(status, 404);
            assert_eq!(message, "Job not found");
        }
        other => panic!("expected 404, got {other:?}"),
    }

    let err = client.status(&JobId::new("busy")).await.unwrap_err();
    assert!(err.is_rate_limited());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
}

#[tokio::test]
async fn test_malformed_status_body_is_serialization_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/indexing/status/job-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy</html>"))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let result = client.status(&JobId::new("job-1")).await;
    assert!(matches!(result, Err(Error::Serialization(_))));
}

#[tokio::test]
async fn test_cancel_tolerates_empty_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/api/indexing/job-1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&mock_server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/indexing/job-2"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "message": "Job cancelled" })),
        )
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    assert_eq!(client.cancel(&JobId::new("job-1")).await.unwrap().message, None);
    assert_eq!(
        client.cancel(&JobId::new("job-2")).await.unwrap().message.as_deref(),
        Some("Job cancelled")
    );
}

#[tokio::test]
async fn test_job_lifecycle_over_http() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/indexing/start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jobId": "job-42",
            "status": "pending"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let replies = [
        serde_json::json!({ "status": "pending", "progress": 0 }),
        serde_json::json!({ "status": "running", "progress": 50 }),
        serde_json::json!({ "status": "completed", "progress": 100 }),
    ];
    for reply in &replies[..2] {
        Mock::given(method("GET"))
            .and(path("/api/indexing/status/job-42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/api/indexing/status/job-42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&replies[2]))
        .expect(2)
        .mount(&mock_server)
        .await;

    let transport = Arc::new(client_for(&mock_server));
    let store = Arc::new(MemoryStore::new());
    let ledger = JobLedger::new(store);
    let timers = Arc::new(TimerRegistry::new());
    let events = EventBus::default();
    let poller = JobPoller::new(
        transport.clone(),
        ledger.clone(),
        timers.clone(),
        events.clone(),
        PollerConfig::default().with_poll_interval(Duration::from_millis(20)),
    );
    let coordinator = JobCoordinator::new(
        transport,
        ledger.clone(),
        poller,
        events.clone(),
        CoordinatorConfig::default().with_user("alice"),
    );

    let mut rx = events.subscribe();
    let report = coordinator
        .start(TargetSpec::single("postgresql"))
        .await
        .expect("start should succeed");
    let job_id = report.jobs[0].job_id.clone();

    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(JobEvent::Completed { job_id, status, .. }) = rx.recv().await {
                return (job_id, status);
            }
        }
    })
    .await
    .expect("job should complete");

    assert_eq!(completed, (job_id.clone(), JobStatus::Completed));
    assert!(ledger.get(&job_id).is_none());
    assert_eq!(timers.active_count(), 0);
    assert!(!coordinator.is_job_active("postgresql"));
}
