//! HTTP API
//!
//! - `GET /health` liveness probe
//! - `GET /preview?fps=N` MJPEG stream (`multipart/x-mixed-replace`)
//! - `POST /camera/switch` change the capture device
//! - `GET /camera/current` device in use and its name
//! - `GET /cameras` available capture devices
//! - `POST /capture` save the latest preview frame
//! - `POST /capture-gphoto2` full-resolution shot from a tethered camera
//! - `GET /files/:name` saved captures
//! - `GET /status` pipeline state

use axum::{
    Router,
    body::Body,
    extract::{Path, Query, Request, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Deserialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::capture::DeviceLister;
use crate::config::PeepholeConfig;
use crate::error::{PeepholeError, Result};
use crate::pipeline::SupervisorHandle;
use crate::registry::BOUNDARY;
use crate::still::{StillCapture, content_type};
use crate::types::DeviceId;

/// Highest per-client frame rate a viewer may ask for
pub const MAX_CLIENT_FPS: u32 = 60;

/// Shared state for request handlers
pub struct AppState {
    /// Pipeline supervisor
    pub supervisor: SupervisorHandle,
    /// Device enumeration
    pub devices: DeviceLister,
    /// Still capture writer
    pub stills: StillCapture,
}

impl AppState {
    /// Build handler state from configuration
    pub fn new(supervisor: SupervisorHandle, config: &PeepholeConfig) -> Self {
        Self {
            supervisor,
            devices: DeviceLister::new(&config.capture),
            stills: StillCapture::new(&config.server.data_dir, &config.capture.gphoto2),
        }
    }
}

/// Build the router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/preview", get(preview))
        .route("/camera/switch", post(switch_camera))
        .route("/camera/current", get(current_camera))
        .route("/cameras", get(list_cameras))
        .route("/capture", post(capture_still))
        .route("/capture-gphoto2", post(capture_gphoto2))
        .route("/files/:name", get(serve_file))
        .route("/status", get(status))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Bind the listening socket
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| PeepholeError::from(e).with_context(format!("Failed to bind {}", addr)))
}

/// Serve the API until `shutdown` resolves and every open stream has ended
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on http://{}", addr);
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| PeepholeError::from(e).with_context("HTTP server error"))
}

/// Parse the `fps` query value; anything unparsable means unthrottled
pub fn parse_fps(value: Option<&str>) -> u32 {
    let fps = value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0);
    fps.clamp(0.0, MAX_CLIENT_FPS as f64) as u32
}

fn error_json(status: StatusCode, error: &str, details: impl std::fmt::Display) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": error, "details": details.to_string() })),
    )
        .into_response()
}

/// Reflect the caller's origin on every response
async fn cors(request: Request, next: Next) -> Response {
    let origin = request.headers().get(header::ORIGIN).cloned();

    let mut response = if request.method() == Method::OPTIONS {
        let mut preflight = StatusCode::NO_CONTENT.into_response();
        let headers = preflight.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET,HEAD,PUT,PATCH,POST,DELETE"),
        );
        if let Some(requested) = request.headers().get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
        preflight
    } else {
        next.run(request).await
    };

    if let Some(origin) = origin {
        let headers: &mut HeaderMap = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.append(header::VARY, HeaderValue::from_static("Origin"));
    }
    response
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
struct PreviewQuery {
    fps: Option<String>,
}

async fn preview(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PreviewQuery>,
) -> Response {
    let fps = parse_fps(query.fps.as_deref());

    let stream = match state.supervisor.subscribe(fps).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Preview client rejected: {}", e);
            return error_json(StatusCode::SERVICE_UNAVAILABLE, "Failed to start preview", e);
        }
    };
    debug!("Streaming to {}", stream.id());

    let content_type = format!("multipart/x-mixed-replace; boundary={}", BOUNDARY);
    let headers = [
        (header::CONTENT_TYPE, content_type.as_str()),
        (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
        (header::PRAGMA, "no-cache"),
        (header::EXPIRES, "0"),
        (header::CONNECTION, "keep-alive"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    let body = Body::from_stream(stream.map(Ok::<_, Infallible>));

    (headers, body).into_response()
}

#[derive(Debug, Deserialize)]
struct SwitchRequest {
    device: Option<String>,
}

async fn switch_camera(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<SwitchRequest>, JsonRejection>,
) -> Response {
    let device = body
        .ok()
        .and_then(|Json(request)| request.device)
        .and_then(|device| device.parse::<DeviceId>().ok());

    let Some(device) = device else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "Device parameter required (e.g., '0:none')" })),
        )
            .into_response();
    };

    info!("Camera switch requested: {}", device);
    match state.supervisor.switch_device(device).await {
        Ok(device) => Json(serde_json::json!({
            "success": true,
            "device": device,
            "message": format!("Switched to camera device {}", device),
        }))
        .into_response(),
        Err(e @ PeepholeError::InvalidDevice(_)) => {
            error_json(StatusCode::BAD_REQUEST, "Invalid device", e)
        }
        Err(e) => {
            warn!("Camera switch failed: {}", e);
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to switch camera", e)
        }
    }
}

async fn current_camera(State(state): State<Arc<AppState>>) -> Response {
    let device = match state.supervisor.current_device().await {
        Ok(device) => device,
        Err(e) => return error_json(StatusCode::SERVICE_UNAVAILABLE, "Pipeline unavailable", e),
    };

    if device.index().is_none() {
        return Json(serde_json::json!({ "device": device, "name": null })).into_response();
    }

    match state.devices.resolve_name(&device).await {
        Ok(name) => Json(serde_json::json!({ "device": device, "name": name })).into_response(),
        Err(e) => Json(serde_json::json!({
            "device": device,
            "name": null,
            "error": e.to_string(),
        }))
        .into_response(),
    }
}

async fn list_cameras(State(state): State<Arc<AppState>>) -> Response {
    match state.devices.list().await {
        Ok(cameras) => Json(serde_json::json!({ "cameras": cameras })).into_response(),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list cameras", e),
    }
}

async fn capture_still(State(state): State<Arc<AppState>>) -> Response {
    let frame = match state.supervisor.latest_frame().await {
        Ok(frame) => frame,
        Err(e) => return error_json(StatusCode::SERVICE_UNAVAILABLE, "Pipeline unavailable", e),
    };

    match state.stills.save_latest(frame).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => match e.root() {
            PeepholeError::NoFrame => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "no frame yet" })),
            )
                .into_response(),
            _ => error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save capture", e),
        },
    }
}

async fn capture_gphoto2(State(state): State<Arc<AppState>>) -> Response {
    match state.stills.capture_gphoto2().await {
        Ok(job) => Json(job).into_response(),
        Err(e) => match e.root() {
            PeepholeError::NoCamera(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "No gphoto2-compatible camera detected" })),
            )
                .into_response(),
            _ => error_json(StatusCode::INTERNAL_SERVER_ERROR, "gphoto2 capture failed", e),
        },
    }
}

async fn serve_file(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    let Some(path) = state.stills.resolve_file(&name) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match tokio::fs::read(&path).await {
        Ok(data) => ([(header::CONTENT_TYPE, content_type(&path))], data).into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read file", e),
    }
}

async fn status(State(state): State<Arc<AppState>>) -> Response {
    match state.supervisor.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_json(StatusCode::SERVICE_UNAVAILABLE, "Pipeline unavailable", e),
    }
}
