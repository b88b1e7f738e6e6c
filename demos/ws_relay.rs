//! WebSocket relay server with a small session control API
//!
//! Run with: cargo run --example ws_relay [BIND_ADDR]
//!
//! Examples:
//!   cargo run --example ws_relay                   # binds to 0.0.0.0:8080
//!   cargo run --example ws_relay 127.0.0.1:9000
//!
//! Needs ffmpeg and Xvfb displays `:100`..`:104` already running.
//!
//! ## Control
//!
//!   curl -X POST localhost:8080/api/sessions \
//!        -H 'content-type: application/json' \
//!        -d '{"session_id": "demo", "width": 1280, "height": 720}'
//!   curl localhost:8080/api/sessions
//!   curl -X DELETE localhost:8080/api/sessions/demo
//!
//! ## Viewing
//!
//! Connect a WebSocket to `ws://localhost:8080/api/ws/stream/demo`. Every
//! binary message is one Annex-B NAL unit, ready for a WebCodecs decoder.
//! Close codes: 1000 stream ended, 1011 session not ready, 4004 unknown id.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use h264_relay::registry::RegistryError;
use h264_relay::{
    CaptureRequest, CloseCode, DisplayPool, RegistryConfig, SessionRegistry, SessionSummary,
    StreamConfig,
};

type Registry = Arc<SessionRegistry<DisplayPool>>;

#[derive(Debug, Deserialize)]
struct CreateSession {
    session_id: String,
    width: Option<u32>,
    height: Option<u32>,
    framerate: Option<u32>,
    bitrate: Option<String>,
    maxrate: Option<String>,
}

impl CreateSession {
    fn stream_config(&self) -> StreamConfig {
        let defaults = StreamConfig::default();
        StreamConfig {
            width: self.width.unwrap_or(defaults.width),
            height: self.height.unwrap_or(defaults.height),
            framerate: self.framerate.unwrap_or(defaults.framerate),
            bitrate: self.bitrate.clone().unwrap_or(defaults.bitrate),
            maxrate: self.maxrate.clone().unwrap_or(defaults.maxrate),
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionView {
    session_id: String,
    status: &'static str,
    subscribers: usize,
    resolution: String,
    framerate: u32,
    display: String,
    /// Seconds since the Unix epoch
    created_at: u64,
    stop_cause: Option<String>,
}

impl From<SessionSummary> for SessionView {
    fn from(summary: SessionSummary) -> Self {
        Self {
            resolution: summary.resolution(),
            status: summary.status.as_str(),
            subscribers: summary.subscriber_count,
            framerate: summary.framerate,
            display: summary.capture_id,
            created_at: summary
                .created_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            stop_cause: summary.stop_cause.map(|cause| cause.to_string()),
            session_id: summary.session_id,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError(RegistryError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RegistryError::DuplicateSession(_) => StatusCode::CONFLICT,
            RegistryError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::ResourceUnavailable { .. } | RegistryError::StartupFailure { .. } => {
                StatusCode::BAD_GATEWAY
            }
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn create_session(
    State(registry): State<Registry>,
    Json(body): Json<CreateSession>,
) -> Result<(StatusCode, Json<SessionView>), ApiError> {
    let stream = body.stream_config();
    let request = CaptureRequest::for_stream(&stream);

    registry
        .create(body.session_id.clone(), stream, request)
        .await
        .map_err(ApiError)?;

    let summary = registry
        .summary(&body.session_id)
        .await
        .ok_or_else(|| ApiError(RegistryError::NotFound(body.session_id.clone())))?;
    Ok((StatusCode::CREATED, Json(summary.into())))
}

async fn list_sessions(State(registry): State<Registry>) -> Json<Vec<SessionView>> {
    let sessions = registry.list().await.into_iter().map(Into::into).collect();
    Json(sessions)
}

async fn get_session(
    State(registry): State<Registry>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    registry
        .summary(&id)
        .await
        .map(|summary| Json(summary.into()))
        .ok_or(ApiError(RegistryError::NotFound(id)))
}

async fn delete_session(
    State(registry): State<Registry>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    registry.stop(&id).await.map_err(ApiError)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stream_session(
    ws: WebSocketUpgrade,
    State(registry): State<Registry>,
    Path(id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| relay(socket, registry, id))
}

/// Forward one session's units to one viewer
async fn relay(mut socket: WebSocket, registry: Registry, id: String) {
    let mut subscription = match registry.subscribe(&id).await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::warn!(session = %id, error = %e, "Viewer rejected");
            close(socket, e.close_code()).await;
            return;
        }
    };

    let subscriber = subscription.id();
    tracing::info!(session = %id, subscriber = subscriber, "Viewer connected");

    let mut sent: u64 = 0;
    let end = loop {
        tokio::select! {
            unit = subscription.recv() => match unit {
                Some(unit) => {
                    if socket.send(Message::Binary(unit.into_payload())).await.is_err() {
                        break None;
                    }
                    sent += 1;
                }
                None => break Some(CloseCode::Normal),
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break None,
                // Viewers have nothing to say; pings are answered by axum
                Some(Ok(_)) => {}
            },
        }
    };

    let dropped = subscription.dropped();
    drop(subscription);

    if let Some(code) = end {
        close(socket, code).await;
    }

    tracing::info!(
        session = %id,
        subscriber = subscriber,
        units = sent,
        dropped = dropped,
        "Viewer disconnected"
    );
}

async fn close(mut socket: WebSocket, code: CloseCode) {
    let frame = CloseFrame {
        code: code.code(),
        reason: code.reason().into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
        return;
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let bind_addr: SocketAddr = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => SocketAddr::from(([0, 0, 0, 0], 8080)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("h264_relay=debug".parse()?)
                .add_directive("ws_relay=debug".parse()?),
        )
        .init();

    let registry: Registry = Arc::new(SessionRegistry::with_config(
        DisplayPool::new(),
        RegistryConfig::default(),
    ));

    let app = Router::new()
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/ws/stream/{id}", get(stream_session))
        .with_state(Arc::clone(&registry));

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "Relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.stop_all().await;
    tracing::info!("All sessions stopped");
    Ok(())
}
