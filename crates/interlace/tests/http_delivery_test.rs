// HTTP batch delivery against a mock collector
// Run with: cargo test -p interlace --test http_delivery_test

use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use interlace::{
    BeginOptions, DeliveryNotice, FinishOptions, RetryPolicy, SignalOptions, Tracer,
    TracerConfig, TracerError,
};

fn config(server: &MockServer) -> TracerConfig {
    TracerConfig::default()
        .with_base_url(server.uri())
        .with_api_key("sk-test")
        .with_retry(RetryPolicy::fixed(Duration::from_millis(10), 3))
}

async fn trace_one(tracer: &Tracer) -> String {
    let handle = tracer
        .begin(BeginOptions::new("rag_query").with_input("Q"))
        .await;
    handle.finish(FinishOptions::new().with_output("A")).await;
    handle.id().to_string()
}

#[tokio::test]
async fn test_batch_is_posted_with_bearer_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/batch"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let tracer = Tracer::new(config(&server)).unwrap();
    let id = trace_one(&tracer).await;
    tracer.flush().await;

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["interactions"][0]["id"], json!(id));
    assert_eq!(body["interactions"][0]["event"], json!("rag_query"));
    assert_eq!(body["interactions"][0]["output"], json!("A"));
    // Empty arrays are left off the wire
    assert!(body.get("signals").is_none());
    assert_eq!(tracer.stats().delivered, 1);
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/batch"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/batch"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let tracer = Tracer::new(config(&server)).unwrap();
    let mut notices = tracer.subscribe_notices();
    trace_one(&tracer).await;
    tracer.flush().await;

    let stats = tracer.stats();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.dropped, 0);
    assert!(notices.try_recv().is_err());
}

#[tokio::test]
async fn test_rate_limit_exhausts_retries_then_drops() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/batch"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let tracer = Tracer::new(config(&server)).unwrap();
    let mut notices = tracer.subscribe_notices();
    trace_one(&tracer).await;
    tracer.flush().await;

    match notices.try_recv().unwrap() {
        DeliveryNotice::Dropped {
            items,
            attempts,
            error,
        } => {
            assert_eq!(items, 1);
            assert_eq!(attempts, 3);
            assert!(error.is_transient());
        }
        other => panic!("expected drop, got {:?}", other),
    }
    assert_eq!(tracer.stats().dropped, 1);
}

#[tokio::test]
async fn test_rejected_batch_is_dropped_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/batch"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad payload"))
        .expect(1)
        .mount(&server)
        .await;

    let tracer = Tracer::new(config(&server)).unwrap();
    let mut notices = tracer.subscribe_notices();
    tracer.track_signal(SignalOptions::new("evt-1", "thumbs_down"));
    tracer.flush().await;

    match notices.try_recv().unwrap() {
        DeliveryNotice::Dropped {
            attempts, error, ..
        } => {
            assert_eq!(attempts, 1);
            match error {
                TracerError::PermanentDelivery { status, message } => {
                    assert_eq!(status, Some(400));
                    assert!(message.contains("bad payload"));
                }
                other => panic!("expected permanent failure, got {:?}", other),
            }
        }
        other => panic!("expected drop, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_api_key_drops_without_sending() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let config = TracerConfig::default().with_base_url(server.uri());
    let tracer = Tracer::new(config).unwrap();
    let mut notices = tracer.subscribe_notices();
    trace_one(&tracer).await;
    tracer.close().await;

    match notices.try_recv().unwrap() {
        DeliveryNotice::Dropped { error, .. } => assert_eq!(
            error,
            TracerError::PermanentDelivery {
                status: None,
                message: "missing API key".to_string(),
            }
        ),
        other => panic!("expected drop, got {:?}", other),
    }
    assert_eq!(tracer.stats().pending, 0);
}
