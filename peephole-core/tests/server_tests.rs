//! HTTP API tests, driven through the router without a socket

mod mocks;

use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use axum::response::Response;
use mocks::{MockLauncher, jpeg_bytes, settle, spawn_supervisor};
use peephole_core::server::{AppState, router};
use peephole_core::{PeepholeConfig, PipelineTimings, SupervisorHandle};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_stream::StreamExt;
use tower::ServiceExt;

struct TestApp {
    launcher: Arc<MockLauncher>,
    supervisor: SupervisorHandle,
    state: Arc<AppState>,
    dir: TempDir,
}

impl TestApp {
    fn new() -> Self {
        Self::with_launcher(MockLauncher::new())
    }

    fn with_launcher(launcher: Arc<MockLauncher>) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = PeepholeConfig::default();
        config.server.data_dir = dir.path().join("files");
        config.capture.binary = "/nonexistent/peephole-test-ffmpeg".to_string();
        config.capture.gphoto2 = "/nonexistent/peephole-test-gphoto2".to_string();

        let supervisor = spawn_supervisor(&launcher, PipelineTimings::default());
        let state = Arc::new(AppState::new(supervisor.clone(), &config));
        Self {
            launcher,
            supervisor,
            state,
            dir,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        router(self.state.clone()).oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn post_json(&self, uri: &str, body: &str) -> Response {
        let request = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }
}

async fn json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let response = app.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await, serde_json::json!({ "ok": true }));
}

#[tokio::test]
async fn test_status_reports_idle_pipeline() {
    let app = TestApp::new();
    let response = app.get("/status").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = json(response).await;
    assert_eq!(body["state"], "idle");
    assert_eq!(body["device"], "0:none");
    assert_eq!(body["clients"], 0);
    assert_eq!(body["session"], Value::Null);
}

#[tokio::test]
async fn test_preview_streams_multipart() {
    let app = TestApp::new();
    let response = app.get("/preview?fps=10").await;
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(
        headers[header::CONTENT_TYPE],
        "multipart/x-mixed-replace; boundary=frame"
    );
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache, no-store, must-revalidate");
    assert_eq!(headers[header::PRAGMA], "no-cache");
    assert_eq!(headers["x-accel-buffering"], "no");
    assert_eq!(app.launcher.launch_count(), 1);

    let frame = jpeg_bytes(6, 32);
    app.launcher.emit(app.launcher.last_session(), frame.clone());

    let mut body = response.into_body().into_data_stream();
    let part = body.next().await.unwrap().unwrap();
    let head = format!("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", frame.len());
    assert!(part.starts_with(head.as_bytes()));
    assert!(part.ends_with(b"\xFF\xD9\r\n"));
    assert_eq!(part.len(), head.len() + frame.len() + 2);
}

#[tokio::test]
async fn test_preview_unavailable_when_capture_fails() {
    let launcher = MockLauncher::new();
    launcher.fail_device("0:none");
    let app = TestApp::with_launcher(launcher);

    let response = app.get("/preview").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json(response).await["error"], "Failed to start preview");
}

#[tokio::test]
async fn test_capture_without_frame() {
    let app = TestApp::new();
    let response = app.send(Request::post("/capture").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json(response).await, serde_json::json!({ "error": "no frame yet" }));
}

#[tokio::test]
async fn test_capture_saves_and_serves_latest_frame() {
    let app = TestApp::new();
    app.supervisor.start().await.unwrap();
    let frame = jpeg_bytes(8, 64);
    app.launcher.emit(app.launcher.last_session(), frame.clone());
    settle(&app.supervisor).await;

    let response = app.send(Request::post("/capture").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let job = json(response).await;

    let id = job["jobId"].as_str().unwrap().to_string();
    assert_eq!(id.len(), 12);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(job["status"], "done");
    assert_eq!(job["file"], format!("/files/{}.jpg", id));
    assert!(job.get("method").is_none());

    let saved = app.dir.path().join("files").join(format!("{}.jpg", id));
    assert_eq!(std::fs::read(&saved).unwrap(), frame);

    let response = app.get(&format!("/files/{}.jpg", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.as_ref(), frame.as_slice());
}

#[tokio::test]
async fn test_files_rejects_missing_and_traversal() {
    let app = TestApp::new();
    std::fs::write(app.dir.path().join("secret.txt"), b"secret").unwrap();

    assert_eq!(app.get("/files/missing.jpg").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        app.get("/files/..%2Fsecret.txt").await.status(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(app.get("/files/..").await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_switch_requires_device() {
    let app = TestApp::new();
    let expected = serde_json::json!({ "error": "Device parameter required (e.g., '0:none')" });

    let response = app.post_json("/camera/switch", "{}").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await, expected);

    let response = app.post_json("/camera/switch", r#"{"device":""}"#).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await, expected);

    let response = app.send(Request::post("/camera/switch").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_switch_rejects_device_without_index() {
    let app = TestApp::new();
    let response = app.post_json("/camera/switch", r#"{"device":"front"}"#).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await["error"], "Invalid device");
}

#[tokio::test]
async fn test_switch_device() {
    let app = TestApp::new();
    let response = app.post_json("/camera/switch", r#"{"device":"1:none"}"#).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json(response).await,
        serde_json::json!({
            "success": true,
            "device": "1:none",
            "message": "Switched to camera device 1:none",
        })
    );
    assert_eq!(app.launcher.device_of(app.launcher.last_session()), "1:none");
    assert_eq!(app.supervisor.current_device().await.unwrap().as_str(), "1:none");
}

#[tokio::test]
async fn test_switch_failure_is_server_error() {
    let launcher = MockLauncher::new();
    launcher.fail_device("5:none");
    let app = TestApp::with_launcher(launcher);

    let response = app.post_json("/camera/switch", r#"{"device":"5:none"}"#).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json(response).await;
    assert_eq!(body["error"], "Failed to switch camera");
    assert!(body["details"].as_str().unwrap().contains("5:none"));
}

#[tokio::test]
async fn test_current_camera_when_listing_fails() {
    let app = TestApp::new();
    let response = app.get("/camera/current").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = json(response).await;
    assert_eq!(body["device"], "0:none");
    assert_eq!(body["name"], Value::Null);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_cameras_listing_failure() {
    let app = TestApp::new();
    let response = app.get("/cameras").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json(response).await["error"], "Failed to list cameras");
}

#[tokio::test]
async fn test_gphoto2_missing_binary() {
    let app = TestApp::new();
    let response = app
        .send(Request::post("/capture-gphoto2").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json(response).await["error"], "gphoto2 capture failed");
}

#[tokio::test]
async fn test_cors_echoes_origin() {
    let app = TestApp::new();
    let request = Request::get("/health")
        .header(header::ORIGIN, "http://studio.local:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.send(request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://studio.local:3000"
    );
    assert_eq!(response.headers()[header::VARY], "Origin");
}

#[tokio::test]
async fn test_cors_preflight() {
    let app = TestApp::new();
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/camera/switch")
        .header(header::ORIGIN, "http://studio.local:3000")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
        .body(Body::empty())
        .unwrap();
    let response = app.send(request).await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let headers = response.headers();
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "content-type");
    assert!(
        headers[header::ACCESS_CONTROL_ALLOW_METHODS]
            .to_str()
            .unwrap()
            .contains("POST")
    );
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://studio.local:3000");
}
