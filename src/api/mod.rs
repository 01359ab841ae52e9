//! Localhost intake and status API.
//!
//! The chat gateway is out of process: a thin relay POSTs raw message-edit
//! payloads to `/events/message-edit`. Operators can also trigger a
//! recording by URL, force a drive poll, and read service status. Commands
//! travel to the application loop over an mpsc channel.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::info;

use crate::detector::{extract_recording_url, MessageEditEvent, RecordingHandle, TriggerKind};

/// Commands delivered to the application loop.
pub enum AppCommand {
    MessageEdit(MessageEditEvent),
    Process(RecordingHandle),
    DrivePoll,
}

/// Read-only service facts for the status endpoint.
pub struct ServiceInfo {
    pub started_at: Instant,
    pub engine: String,
    pub generator_model: String,
    pub watch_channel_id: u64,
    pub output_channel_id: u64,
    pub drive_enabled: bool,
    pub active_pipelines: Box<dyn Fn() -> usize + Send + Sync>,
}

#[derive(Clone)]
pub struct AppState {
    tx: mpsc::Sender<AppCommand>,
    service: Arc<ServiceInfo>,
    domain_allowlist: Arc<Vec<String>>,
}

pub struct ApiServer {
    port: u16,
    state: AppState,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": true, "message": self.message }));
        (self.status, body).into_response()
    }
}

impl ApiServer {
    pub fn new(
        port: u16,
        tx: mpsc::Sender<AppCommand>,
        service: Arc<ServiceInfo>,
        domain_allowlist: Vec<String>,
    ) -> Self {
        Self {
            port,
            state: AppState {
                tx,
                service,
                domain_allowlist: Arc::new(domain_allowlist),
            },
        }
    }

    pub async fn start(self) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/", get(root))
            .route("/status", get(status))
            .route("/events/message-edit", post(message_edit))
            .route("/process", post(process_url))
            .route("/drive/poll", post(drive_poll))
            .with_state(self.state);

        let listener =
            tokio::net::TcpListener::bind(format!("127.0.0.1:{}", self.port)).await?;

        info!("API server listening on http://127.0.0.1:{}", self.port);
        info!("Endpoints:");
        info!("  GET  /                    - Service info");
        info!("  GET  /status              - Pipeline and watcher status");
        info!("  POST /events/message-edit - Raw gateway message-edit payload");
        info!("  POST /process             - Trigger a recording by URL");
        info!("  POST /drive/poll          - Force one drive poll");

        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "minutier",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let service = &state.service;
    Json(json!({
        "uptime_sec": service.started_at.elapsed().as_secs(),
        "engine": service.engine,
        "generator_model": service.generator_model,
        "watch_channel_id": service.watch_channel_id,
        "output_channel_id": service.output_channel_id,
        "drive_enabled": service.drive_enabled,
        "active_pipelines": (service.active_pipelines)(),
    }))
}

async fn message_edit(
    State(state): State<AppState>,
    Json(event): Json<MessageEditEvent>,
) -> Result<Json<Value>, ApiError> {
    state
        .tx
        .send(AppCommand::MessageEdit(event))
        .await
        .map_err(|_| ApiError::unavailable("service is shutting down"))?;
    Ok(Json(json!({ "accepted": true })))
}

#[derive(Debug, Deserialize)]
struct ProcessRequest {
    url: String,
}

async fn process_url(
    State(state): State<AppState>,
    Json(request): Json<ProcessRequest>,
) -> Result<Json<Value>, ApiError> {
    let Some((domain, recording_id, access_key)) =
        extract_recording_url(&request.url, &state.domain_allowlist)
    else {
        return Err(ApiError::bad_request(
            "not a recording URL with an allowlisted host (expected https://host/rec/{id}?key={key})",
        ));
    };

    let handle = RecordingHandle {
        recording_id: recording_id.clone(),
        access_key,
        origin_channel_id: 0,
        trigger: TriggerKind::PanelEdit,
        drive_file_id: None,
        source_domain: domain,
    };

    state
        .tx
        .send(AppCommand::Process(handle))
        .await
        .map_err(|_| ApiError::unavailable("service is shutting down"))?;

    Ok(Json(json!({ "accepted": true, "recording_id": recording_id })))
}

async fn drive_poll(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state
        .tx
        .send(AppCommand::DrivePoll)
        .await
        .map_err(|_| ApiError::unavailable("service is shutting down"))?;
    Ok(Json(json!({ "accepted": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(tx: mpsc::Sender<AppCommand>) -> AppState {
        AppState {
            tx,
            service: Arc::new(ServiceInfo {
                started_at: Instant::now(),
                engine: "test-engine".to_string(),
                generator_model: "test-model".to_string(),
                watch_channel_id: 1,
                output_channel_id: 2,
                drive_enabled: false,
                active_pipelines: Box::new(|| 3),
            }),
            domain_allowlist: Arc::new(vec!["craig.chat".to_string()]),
        }
    }

    #[tokio::test]
    async fn process_parses_url_into_handle() {
        let (tx, mut rx) = mpsc::channel(4);
        let response = process_url(
            State(state(tx)),
            Json(ProcessRequest {
                url: "https://craig.chat/rec/abc?key=XYZ".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.0["recording_id"], "abc");

        match rx.recv().await.unwrap() {
            AppCommand::Process(handle) => {
                assert_eq!(handle.recording_id, "abc");
                assert_eq!(handle.access_key, "XYZ");
                assert_eq!(handle.trigger, TriggerKind::PanelEdit);
            }
            _ => panic!("expected Process command"),
        }
    }

    #[tokio::test]
    async fn process_rejects_disallowed_host() {
        let (tx, _rx) = mpsc::channel(4);
        let err = process_url(
            State(state(tx)),
            Json(ProcessRequest {
                url: "https://evil.example/rec/abc?key=XYZ".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_reports_active_pipelines() {
        let (tx, _rx) = mpsc::channel(4);
        let response = status(State(state(tx))).await;
        assert_eq!(response.0["active_pipelines"], 3);
        assert_eq!(response.0["engine"], "test-engine");
    }
}
