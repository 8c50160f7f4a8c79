#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::{metrics, png, spawn, state_with, upload, MemoryStore, Reply, ScriptedModel};
use image_titler::{AppConfig, InvokeError};
use reqwest::{Client, StatusCode};

#[tokio::test]
async fn successful_title_is_returned_and_recorded() {
    let model = ScriptedModel::new(Reply::Title("Sunset Over Water"));
    let store = MemoryStore::new(false);
    let state = state_with(&AppConfig::default(), model.clone(), Some(store.clone()));
    let (base, _h) = spawn(state).await;
    let client = Client::new();

    let resp = upload(&client, &base, "beach.png", "image/png", png(640, 480, &[])).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["title"], "Sunset Over Water");
    assert_eq!(body["confidence"], 0.9);
    assert_eq!(body["explanation"], "A scenic view");
    assert!(body["processing_time"].as_f64().unwrap() >= 0.0);
    assert!(body["timestamp"].as_i64().unwrap() > 0);
    let key = body["s3_key"].as_str().unwrap();
    assert!(key.starts_with("images/"));
    assert!(key.ends_with("beach.png"));
    assert_eq!(store.keys(), vec![key.to_string()]);

    let m = metrics(&client, &base).await;
    assert_eq!(m["model_invocations"], 1);
    assert_eq!(m["successful_invocations"], 1);
    assert_eq!(m["failed_invocations"], 0);
    assert_eq!(m["success_rate"], 100.0);
    assert_eq!(m["processing_times"].as_array().unwrap().len(), 1);
    assert_eq!(model.calls(), 1);
}

#[tokio::test]
async fn sixth_request_in_window_is_rate_limited() {
    let model = ScriptedModel::new(Reply::Title("Mountain Lake"));
    let state = state_with(&AppConfig::default(), model.clone(), None);
    let (base, _h) = spawn(state).await;
    let client = Client::new();

    for _ in 0..5 {
        let resp = upload(&client, &base, "a.png", "image/png", png(10, 10, &[])).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["s3_key"].is_null());
    }
    let resp = upload(&client, &base, "a.png", "image/png", png(10, 10, &[])).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: serde_json::Value = resp.json().await.unwrap();
    let detail = body["detail"].as_str().unwrap();
    assert!(detail.starts_with("Rate limit exceeded. Please try again in "));
    assert!(detail.ends_with(" seconds."));

    let m = metrics(&client, &base).await;
    assert_eq!(m["model_invocations"], 5);
    assert_eq!(model.calls(), 5);
}

#[tokio::test]
async fn text_file_renamed_to_png_is_rejected_without_metrics() {
    let model = ScriptedModel::new(Reply::Title("Unused"));
    let state = state_with(&AppConfig::default(), model.clone(), None);
    let (base, _h) = spawn(state).await;
    let client = Client::new();

    let resp = upload(
        &client,
        &base,
        "notes.png",
        "image/png",
        b"shopping list: eggs, milk\n".to_vec(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["detail"].as_str().unwrap().contains("JPEG, PNG or GIF"));

    let m = metrics(&client, &base).await;
    assert_eq!(m["model_invocations"], 0);
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn disallowed_content_type_is_rejected() {
    let model = ScriptedModel::new(Reply::Title("Unused"));
    let state = state_with(&AppConfig::default(), model.clone(), None);
    let (base, _h) = spawn(state).await;
    let client = Client::new();

    let resp = upload(&client, &base, "a.webp", "image/webp", png(4, 4, &[])).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn missing_file_field_is_bad_request() {
    let model = ScriptedModel::new(Reply::Title("Unused"));
    let state = state_with(&AppConfig::default(), model.clone(), None);
    let (base, _h) = spawn(state).await;

    let form = reqwest::multipart::Form::new().text("note", "no image here");
    let resp = Client::new()
        .post(format!("{}/analyze-image", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["detail"], "Missing multipart field 'file'");
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn unsafe_input_is_rejected_before_the_model() {
    let model = ScriptedModel::new(Reply::Title("Unused"));
    let state = state_with(&AppConfig::default(), model.clone(), None);
    let (base, _h) = spawn(state).await;
    let client = Client::new();

    let image = png(32, 32, &[("Description", "NSFW photo set")]);
    let resp = upload(&client, &base, "set.png", "image/png", image).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["detail"], "Image content appears to be inappropriate");

    let oversized = png(5000, 10, &[]);
    let resp = upload(&client, &base, "wide.png", "image/png", oversized).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(
        body["detail"],
        "Image must be less than 5MB and dimensions must not exceed 4096x4096"
    );

    let m = metrics(&client, &base).await;
    assert_eq!(m["model_invocations"], 0);
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn unsafe_generated_title_is_rejected_and_counted_as_failure() {
    let model = ScriptedModel::new(Reply::Caption("Explicit Scene", "Something"));
    let store = MemoryStore::new(false);
    let state = state_with(&AppConfig::default(), model, Some(store.clone()));
    let (base, _h) = spawn(state).await;
    let client = Client::new();

    let resp = upload(&client, &base, "a.png", "image/png", png(8, 8, &[])).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["detail"], "Image content appears to be inappropriate");
    assert!(store.keys().is_empty(), "rejected output must not be stored");

    let m = metrics(&client, &base).await;
    assert_eq!(m["model_invocations"], 1);
    assert_eq!(m["failed_invocations"], 1);
    assert_eq!(m["success_rate"], 0.0);
    assert!(m["processing_times"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unsafe_explanation_is_also_screened() {
    let model = ScriptedModel::new(Reply::Caption("Quiet Street", "an adult only venue"));
    let state = state_with(&AppConfig::default(), model, None);
    let (base, _h) = spawn(state).await;

    let resp = upload(&Client::new(), &base, "a.png", "image/png", png(8, 8, &[])).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn model_timeout_returns_gateway_timeout_and_records_failure() {
    let mut config = AppConfig::default();
    config.model.timeout = Duration::from_millis(50);
    let model = ScriptedModel::new(Reply::Stall(Duration::from_secs(5)));
    let state = state_with(&config, model, None);
    let (base, _h) = spawn(state).await;
    let client = Client::new();

    let resp = upload(&client, &base, "a.png", "image/png", png(8, 8, &[])).await;
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);

    let m = metrics(&client, &base).await;
    assert_eq!(m["model_invocations"], 1);
    assert_eq!(m["failed_invocations"], 1);
    assert_eq!(m["successful_invocations"], 0);
}

#[tokio::test]
async fn upstream_failures_map_to_gateway_statuses() {
    let cases = [
        (
            InvokeError::UpstreamUnavailable("connection reset".into()),
            StatusCode::BAD_GATEWAY,
        ),
        (
            InvokeError::UpstreamRejected("refusal".into()),
            StatusCode::UNPROCESSABLE_ENTITY,
        ),
    ];
    for (err, status) in cases {
        let model = ScriptedModel::new(Reply::Fail(err));
        let state = state_with(&AppConfig::default(), model, None);
        let (base, _h) = spawn(state).await;
        let client = Client::new();

        let resp = upload(&client, &base, "a.png", "image/png", png(8, 8, &[])).await;
        assert_eq!(resp.status(), status);
        let m = metrics(&client, &base).await;
        assert_eq!(m["failed_invocations"], 1);
    }
}

#[tokio::test]
async fn storage_failure_still_returns_title() {
    let model = ScriptedModel::new(Reply::Title("City Lights"));
    let store = MemoryStore::new(true);
    let state = state_with(&AppConfig::default(), model, Some(store));
    let counters = state.counters.clone();
    let (base, _h) = spawn(state).await;
    let client = Client::new();

    let resp = upload(&client, &base, "city.png", "image/png", png(8, 8, &[])).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["title"], "City Lights");
    assert!(body["s3_key"].is_null());

    let m = metrics(&client, &base).await;
    assert_eq!(m["successful_invocations"], 1);
    assert_eq!(
        counters
            .storage_failures_total
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn client_disconnect_still_records_the_invocation_once() {
    let model = ScriptedModel::new(Reply::Stall(Duration::from_millis(300)));
    let state = state_with(&AppConfig::default(), model.clone(), None);
    let metrics = state.metrics.clone();
    let (base, _h) = spawn(state).await;
    let client = Client::new();

    // Give up on the response while the model call is still running.
    let pending = upload(&client, &base, "a.png", "image/png", png(8, 8, &[]));
    assert!(tokio::time::timeout(Duration::from_millis(80), pending)
        .await
        .is_err());

    tokio::time::sleep(Duration::from_millis(600)).await;
    let snap = metrics.snapshot();
    assert_eq!(model.calls(), 1);
    assert_eq!(snap.model_invocations, 1);
    assert_eq!(snap.successful_invocations, 1);
    assert_eq!(snap.failed_invocations, 0);
}
