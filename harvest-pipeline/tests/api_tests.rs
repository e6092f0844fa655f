//! HTTP API Integration Tests
//!
//! Drives the router with `tower::ServiceExt::oneshot`; no socket is bound.

mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use harvest_pipeline::workflow::{DailyOptions, WeeklyOptions};
use helpers::{seed_days, Harness, StubTrainer};

async fn get(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    into_json(response).await
}

async fn post(app: axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    into_json(response).await
}

async fn post_raw(
    app: axum::Router,
    uri: &str,
    content_type: Option<&str>,
    body: &str,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method("POST").uri(uri);
    if let Some(content_type) = content_type {
        request = request.header("content-type", content_type);
    }
    let response = app
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    into_json(response).await
}

async fn into_json(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// Harness where v1 (0.75) was replaced by v2 (0.77)
async fn two_versions() -> Harness {
    let h = Harness::new(StubTrainer::scores(&[0.75, 0.77])).await;
    seed_days(&h.db, 7, &["1111-2222-3333"]).await;
    let cancel = CancellationToken::new();
    h.orchestrator
        .run_weekly(WeeklyOptions::default(), &cancel)
        .await;
    h.orchestrator
        .run_weekly(
            WeeklyOptions {
                force: true,
                dry_run: false,
            },
            &cancel,
        )
        .await;
    h
}

#[tokio::test]
async fn test_health_reports_build_and_model() {
    let h = Harness::new(StubTrainer::default()).await;

    let (status, body) = get(h.app(), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "harvest-pipeline");
    assert!(body["version"].is_string());
    assert!(body["git_hash"].is_string());
    assert!(body["current_version"].is_null());
}

#[tokio::test]
async fn test_current_model_not_found_when_empty() {
    let h = Harness::new(StubTrainer::default()).await;

    let (status, body) = get(h.app(), "/model/current").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_current_and_versions_after_promotions() {
    let h = two_versions().await;

    let (status, current) = get(h.app(), "/model/current").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(current["version_id"], 2);
    assert_eq!(current["quality_score"], 0.77);

    let (status, versions) = get(h.app(), "/model/versions").await;
    assert_eq!(status, StatusCode::OK);
    let versions = versions.as_array().unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0]["version_id"], 1);
    assert_eq!(versions[0]["is_current"], false);
    assert_eq!(versions[1]["is_current"], true);
    assert!(versions.iter().all(|v| v["readable"] == true));

    let (_, backups) = get(h.app(), "/model/backups").await;
    assert_eq!(backups.as_array().unwrap().len(), 1);
    assert_eq!(backups[0]["superseded_version_id"], 1);

    let (_, health) = get(h.app(), "/health").await;
    assert_eq!(health["current_version"], 2);
}

#[tokio::test]
async fn test_rollback_endpoint() {
    let h = two_versions().await;

    // Default target: the model replaced by the latest promotion
    let (status, body) = post(h.app(), "/model/rollback", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "rolled_back");
    assert_eq!(body["current"]["version_id"], 1);

    // Explicit target
    let (status, body) = post(h.app(), "/model/rollback", json!({ "version_id": 2 })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current"]["version_id"], 2);

    // Unknown target
    let (status, body) = post(h.app(), "/model/rollback", json!({ "version_id": 42 })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "ARTIFACT_MISSING");
    assert_eq!(h.store().current().unwrap().unwrap().version_id, 2);
}

#[tokio::test]
async fn test_rollback_without_body_uses_latest_backup() {
    let h = two_versions().await;

    let (status, body) = post_raw(h.app(), "/model/rollback", None, "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current"]["version_id"], 1);
}

#[tokio::test]
async fn test_malformed_rollback_request_leaves_current() {
    let h = two_versions().await;

    for (content_type, raw) in [
        (Some("application/json"), r#"{"version_id":"2"}"#),
        (Some("application/json"), r#"{"version": 1}"#),
        (Some("application/json"), r#"{"version_id": 1"#),
        (Some("text/plain"), r#"{"version_id": 1}"#),
        (None, r#"{"version_id": 1}"#),
    ] {
        let (status, body) = post_raw(h.app(), "/model/rollback", content_type, raw).await;

        assert_eq!(status, StatusCode::BAD_REQUEST, "body {}", raw);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
        assert_eq!(h.store().current().unwrap().unwrap().version_id, 2);
    }
}

#[tokio::test]
async fn test_rollback_with_no_backup_is_not_found() {
    let h = Harness::new(StubTrainer::default()).await;

    let (status, body) = post(h.app(), "/model/rollback", json!({})).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_run_logs() {
    let h = two_versions().await;
    let options = DailyOptions {
        entities: Some(["1111-2222-3333".to_string()].into_iter().collect()),
        ..Default::default()
    };
    h.orchestrator
        .run_daily(&options, &CancellationToken::new())
        .await
        .unwrap();

    let (status, runs) = get(h.app(), "/runs/collection").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(runs.as_array().unwrap().len(), 1);
    assert_eq!(runs[0]["entities_succeeded"], 1);

    let (status, outcomes) = get(h.app(), "/runs/retrain?limit=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcomes.as_array().unwrap().len(), 1);

    let (status, _) = get(h.app(), "/runs/retrain?limit=0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
