//! HTTP surface: destination polls and the control endpoints.

use crate::app::AppContext;
use crate::config::ConfigError;
use crate::event::LiveEvent;
use crate::source::IngestError;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{debug, error, info, warn};

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn success() -> Json<Value> {
    Json(json!({ "status": "success" }))
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    #[serde(default)]
    username: String,
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    #[serde(default)]
    command: String,
}

/// Build the router with every route. Also used by the route tests.
pub fn build_router(app: Arc<AppContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let media = ServeDir::new(&app.settings.paths.media_dir);
    let upload_limit = DefaultBodyLimit::max(app.settings.server.max_upload_bytes);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/status", get(get_status))
        // Destination polls
        .route("/data/{screen}", get(poll_screen))
        // Config
        .route("/updateData", get(reload_config))
        .route("/config", get(get_config).post(put_config))
        // Media assets
        .route("/upload", post(upload_media).layer(upload_limit))
        .nest_service("/media", media)
        // Tracking
        .route("/start", post(start_tracking))
        .route("/stop", post(stop_tracking))
        .route("/api/v1/events", post(ingest_event))
        .route("/command", post(send_command))
        .layer(cors)
        .with_state(app)
}

/// Bind and serve until the context's shutdown signal fires.
pub async fn serve(app: Arc<AppContext>) -> std::io::Result<()> {
    let port = app
        .settings
        .resolve_port(app.config.current().document.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let shutdown = app.shutdown.clone();

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("LiveTok listening on {}", addr);

    axum::serve(listener, build_router(app))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("HTTP server shutting down");
        })
        .await
}

async fn health_check(State(app): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "tracking": app.tracker.current().await.is_some(),
        "drain": app.drain.is_running(),
    }))
}

async fn get_metrics(State(app): State<Arc<AppContext>>) -> Json<Value> {
    Json(app.metrics.snapshot())
}

async fn get_status(State(app): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({
        "tracking": app.tracker.current().await,
        "active_destinations": app.liveness.active_destinations(),
        "media_queued": app.media.len(),
        "comments_queued": app.comments.len(),
    }))
}

async fn poll_screen(
    State(app): State<Arc<AppContext>>,
    Path(screen): Path<String>,
) -> Json<Value> {
    match app.poll(&screen) {
        Some(payload) => Json(json!(payload)),
        None => Json(json!({ "error": "No data in queue" })),
    }
}

async fn reload_config(State(app): State<Arc<AppContext>>) -> Result<Json<Value>, ApiError> {
    app.reload().map_err(|e| {
        error!(error = %e, "Failed to reload config");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load config")
    })?;

    Ok(success())
}

async fn get_config(State(app): State<Arc<AppContext>>) -> Result<Json<Value>, ApiError> {
    app.config
        .raw_document()
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn put_config(
    State(app): State<Arc<AppContext>>,
    Json(document): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    app.replace_config(document).map_err(|e| {
        warn!(error = %e, "Config update rejected");
        let status = match &e {
            ConfigError::ValidationError(_) | ConfigError::JsonError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        api_error(status, e.to_string())
    })?;

    Ok(success())
}

async fn upload_media(
    State(app): State<Arc<AppContext>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(e.status(), e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        // Only the final path component is kept.
        let file_name = field
            .file_name()
            .and_then(|name| std::path::Path::new(name).file_name())
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "Invalid file name"))?;

        let bytes = field
            .bytes()
            .await
            .map_err(|e| api_error(e.status(), e.body_text()))?;

        let media_dir = &app.settings.paths.media_dir;
        let dest = media_dir.join(&file_name);

        let saved = async {
            tokio::fs::create_dir_all(media_dir).await?;
            tokio::fs::write(&dest, &bytes).await
        };
        saved.await.map_err(|e| {
            error!(path = %dest.display(), error = %e, "Failed to save upload");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save file")
        })?;

        let port = app
            .settings
            .resolve_port(app.config.current().document.port);
        info!(file = %file_name, bytes = bytes.len(), "Media uploaded");

        return Ok(Json(json!({
            "status": "success",
            "url": format!("{}/media/{}", app.settings.public_url(port), file_name),
            "path": dest.display().to_string(),
        })));
    }

    Err(api_error(StatusCode::BAD_REQUEST, "No file uploaded"))
}

async fn start_tracking(
    State(app): State<Arc<AppContext>>,
    Json(body): Json<StartRequest>,
) -> Result<Json<Value>, ApiError> {
    let username = body.username.trim();
    if username.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Username is required"));
    }

    let handle = app.start_tracking(username).await.map_err(|e| {
        error!(username = %username, error = %e, "Failed to track user");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to track user: {}", e),
        )
    })?;

    Ok(Json(json!({
        "status": "success",
        "username": handle.identity,
        "stream_id": handle.id,
    })))
}

async fn stop_tracking(State(app): State<Arc<AppContext>>) -> Json<Value> {
    let stopped = app.stop_tracking().await;
    Json(json!({
        "status": "success",
        "stopped": stopped.map(|handle| handle.identity),
    }))
}

async fn ingest_event(
    State(app): State<Arc<AppContext>>,
    Json(event): Json<LiveEvent>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    debug!(kind = event.kind(), user = %event.user().username, "Received event");
    let kind = event.kind();

    app.ingest(event).await.map_err(|e| {
        let status = match &e {
            IngestError::NotTracking => StatusCode::CONFLICT,
            IngestError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        };
        api_error(status, e.to_string())
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "kind": kind })),
    ))
}

async fn send_command(
    State(app): State<Arc<AppContext>>,
    Json(body): Json<CommandRequest>,
) -> Result<Json<Value>, ApiError> {
    let command = body.command.trim();
    if command.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Command is required"));
    }

    app.send_command(command).await.map_err(|e| {
        warn!(command = %command, error = %e, "Manual command failed");
        api_error(StatusCode::BAD_GATEWAY, e.to_string())
    })?;

    Ok(success())
}
