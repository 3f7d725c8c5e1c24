use std::sync::Arc;

use chrono::Utc;
use httpmock::prelude::*;
use serde_json::json;
use tokio::time::Duration;
use uuid::Uuid;

use reelforge::jobs::{NewGenerationJob, Resolution};
use reelforge::provider::{
    HttpVideoProvider, PredictionRequest, ProviderError, ProviderStatus, VideoProvider,
};
use reelforge::retry::RetryPolicy;
use reelforge::storage::{output_key, HttpOutputArchiver, LocalObjectStorage, OutputArchiver};

fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

fn provider(server: &MockServer) -> HttpVideoProvider {
    HttpVideoProvider::new(
        server.base_url(),
        Some("test-token".to_string()),
        "replicate",
        quick_retry(),
    )
    .unwrap()
}

#[tokio::test]
async fn versioned_prediction_carries_callback() {
    let server = MockServer::start_async().await;
    let create = server.mock(|when, then| {
        when.method(POST)
            .path("/predictions")
            .header("authorization", "Bearer test-token")
            .json_body_partial(
                r#"{
                    "version": "abc123",
                    "input": { "prompt": "waves", "duration": 5 },
                    "webhook": "https://api.example.com/api/webhooks/provider",
                    "webhook_events_filter": ["start", "completed"]
                }"#,
            );
        then.status(201)
            .json_body(json!({ "id": "pred-42", "status": "starting" }));
    });

    let prediction = provider(&server)
        .create_prediction(&PredictionRequest {
            model_ref: "acme/motion-v2".to_string(),
            version: Some("abc123".to_string()),
            input: json!({ "prompt": "waves", "duration": 5, "resolution": "720p" }),
            webhook: Some("https://api.example.com/api/webhooks/provider".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(prediction.id, "pred-42");
    assert_eq!(prediction.status, ProviderStatus::Starting);
    create.assert();
}

#[tokio::test]
async fn unversioned_prediction_uses_model_endpoint() {
    let server = MockServer::start_async().await;
    let create = server.mock(|when, then| {
        when.method(POST).path("/models/acme/motion-v2/predictions");
        then.status(201)
            .json_body(json!({ "id": "pred-7", "status": "processing" }));
    });

    let prediction = provider(&server)
        .create_prediction(&PredictionRequest {
            model_ref: "acme/motion-v2".to_string(),
            version: None,
            input: json!({ "prompt": "waves" }),
            webhook: None,
        })
        .await
        .unwrap();

    assert_eq!(prediction.status, ProviderStatus::Processing);
    create.assert();
}

#[tokio::test]
async fn status_poll_decodes_output() {
    let server = MockServer::start_async().await;
    let status = server.mock(|when, then| {
        when.method(GET).path("/predictions/pred-9");
        then.status(200).json_body(json!({
            "id": "pred-9",
            "status": "succeeded",
            "output": ["https://cdn.example/pred-9.mp4"]
        }));
    });

    let prediction = provider(&server).get_prediction("pred-9").await.unwrap();
    assert_eq!(prediction.status, ProviderStatus::Succeeded);
    assert_eq!(
        prediction.output_url().as_deref(),
        Some("https://cdn.example/pred-9.mp4")
    );
    status.assert();
}

#[tokio::test]
async fn mismatched_prediction_id_is_rejected() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/predictions/pred-1");
        then.status(200)
            .json_body(json!({ "id": "pred-2", "status": "processing" }));
    });

    let err = provider(&server).get_prediction("pred-1").await.unwrap_err();
    assert!(matches!(err, ProviderError::Decode(_)));
}

#[tokio::test]
async fn server_errors_are_retried_until_attempts_run_out() {
    let server = MockServer::start_async().await;
    let status = server.mock(|when, then| {
        when.method(GET).path("/predictions/pred-1");
        then.status(503).body("upstream busy");
    });

    let err = provider(&server).get_prediction("pred-1").await.unwrap_err();
    assert!(matches!(err, ProviderError::Api { status: 503, .. }));
    status.assert_hits(3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start_async().await;
    let create = server.mock(|when, then| {
        when.method(POST).path("/predictions");
        then.status(422).body(r#"{"detail":"invalid input"}"#);
    });

    let err = provider(&server)
        .create_prediction(&PredictionRequest {
            model_ref: "acme/motion-v2".to_string(),
            version: Some("abc123".to_string()),
            input: json!({}),
            webhook: None,
        })
        .await
        .unwrap_err();
    assert!(!err.is_transient());
    create.assert_hits(1);
}

fn job() -> reelforge::jobs::GenerationJob {
    NewGenerationJob {
        id: Uuid::new_v4(),
        owner_id: Uuid::new_v4(),
        prompt: "waves".to_string(),
        model_ref: "acme/motion-v2".to_string(),
        duration_seconds: 5,
        resolution: Resolution::Hd720,
        credits_reserved: 42,
        request_params: json!({}),
    }
    .into_job(Utc::now())
}

#[tokio::test]
async fn archiver_copies_output_into_storage() {
    let server = MockServer::start_async().await;
    let download = server.mock(|when, then| {
        when.method(GET).path("/out.mp4");
        then.status(200).body("mp4-bytes");
    });
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(LocalObjectStorage::new(
        dir.path(),
        "http://localhost/media",
        "storage-secret",
    ));
    let archiver = HttpOutputArchiver::new(storage.clone()).unwrap();
    let job = job();

    let key = archiver
        .archive(&job, &server.url("/out.mp4"))
        .await
        .unwrap();
    assert_eq!(key, output_key(job.owner_id, job.id));
    assert_eq!(storage.read(&key).await.unwrap(), b"mp4-bytes");
    download.assert();
}

#[tokio::test]
async fn archiver_rejects_failed_and_empty_downloads() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/gone.mp4");
        then.status(404);
    });
    server.mock(|when, then| {
        when.method(GET).path("/empty.mp4");
        then.status(200);
    });
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(LocalObjectStorage::new(
        dir.path(),
        "http://localhost/media",
        "storage-secret",
    ));
    let archiver = HttpOutputArchiver::new(storage).unwrap();
    let job = job();

    assert!(archiver.archive(&job, &server.url("/gone.mp4")).await.is_err());
    assert!(archiver.archive(&job, &server.url("/empty.mp4")).await.is_err());
    assert!(archiver.archive(&job, "ftp://cdn.example/out.mp4").await.is_err());
}
