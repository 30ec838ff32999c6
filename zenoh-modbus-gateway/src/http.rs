//! HTTP surface: the asynchronous read/write/stop variant and the
//! synchronous session-id API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Json, Router};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::manager::{Dispatched, SessionManager};
use crate::request::{DataPoint, ProtocolKind, RegisterRequest};
use crate::topic::{Channel, OperationIntent, RoutedIntent, StopIntent};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    manager: Arc<SessionManager>,
    topic_root: String,
    instance_id: String,
}

/// Handler error rendered as `{"error": "..."}`.
#[derive(Debug)]
enum ApiError {
    UnsupportedMediaType(String),
    Gateway(GatewayError),
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError::Gateway(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::MissingJsonContentType(e) => ApiError::UnsupportedMediaType(e.body_text()),
            other => ApiError::Gateway(GatewayError::MalformedPayload(other.body_text())),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::UnsupportedMediaType(message) => (StatusCode::UNSUPPORTED_MEDIA_TYPE, message),
            ApiError::Gateway(err) => {
                let status = if err.is_validation() {
                    StatusCode::BAD_REQUEST
                } else if err.is_not_found() {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (status, err.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult = std::result::Result<Response, ApiError>;

/// Create the HTTP router.
fn create_router(manager: Arc<SessionManager>, topic_root: String, instance_id: String) -> Router {
    let state = AppState {
        manager,
        topic_root,
        instance_id,
    };

    // `:session` is the protocol token on POST and a session id elsewhere.
    Router::new()
        .route("/health", get(health_handler))
        .route("/polls", get(polls_handler))
        .route("/stop/:address", post(stop_handler))
        .route(
            "/sessions/:session",
            post(configure_handler).delete(close_handler),
        )
        .route("/sessions/:session/read/:data_point", post(session_read_handler))
        .route("/sessions/:session/write/:data_point", post(session_write_handler))
        .route("/:verb/:protocol/:data_point", post(operation_handler))
        .with_state(state)
}

fn hex_payload(status: StatusCode, bytes: &[u8]) -> Response {
    (status, Json(json!({ "payload": hex::encode(bytes) }))).into_response()
}

fn parse_session_id(raw: &str) -> Result<u32, GatewayError> {
    raw.parse()
        .map_err(|_| GatewayError::MalformedPayload(format!("'{}' is not a session id", raw)))
}

/// Handler for `POST /{read|write}/{protocol}/{dataPoint}`.
async fn operation_handler(
    State(state): State<AppState>,
    Path((verb, protocol, data_point)): Path<(String, String, String)>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;

    let protocol: ProtocolKind = protocol.parse()?;
    let data_point: DataPoint = data_point.parse()?;
    let request = RegisterRequest::from_json(&body)?;
    let config = body
        .get("config")
        .cloned()
        .ok_or_else(|| GatewayError::MalformedPayload("missing config".to_string()))?;

    let op = OperationIntent {
        channel: Channel::new(state.topic_root.clone(), None),
        protocol,
        data_point,
        request,
        config,
    };
    let intent = match verb.as_str() {
        "read" => RoutedIntent::Read(op),
        "write" => RoutedIntent::Write(op),
        other => {
            return Err(GatewayError::MalformedTopic(format!("unknown operation '{}'", other)).into());
        }
    };

    match state.manager.dispatch(intent).await? {
        Dispatched::Written(bytes) => Ok(hex_payload(StatusCode::ACCEPTED, &bytes)),
        Dispatched::PollStarted {
            address,
            superseded,
        } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "address": address, "superseded": superseded })),
        )
            .into_response()),
        Dispatched::Stopped { address } => {
            Ok((StatusCode::ACCEPTED, Json(json!({ "address": address }))).into_response())
        }
    }
}

/// Handler for `POST /stop/{address}`.
async fn stop_handler(State(state): State<AppState>, Path(address): Path<String>) -> ApiResult {
    let address: u16 = address.parse().map_err(|_| {
        GatewayError::MalformedTopic(format!("'{}' is not a register address", address))
    })?;

    state
        .manager
        .dispatch(RoutedIntent::Stop(StopIntent {
            channel: Channel::new(state.topic_root.clone(), None),
            address,
        }))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "address": address }))).into_response())
}

/// Handler for `GET /polls`.
async fn polls_handler(State(state): State<AppState>) -> Response {
    Json(state.manager.active_polls()).into_response()
}

/// Handler for `GET /health`.
async fn health_handler(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "instance_id": state.instance_id,
        "version": env!("CARGO_PKG_VERSION"),
        "active_polls": state.manager.active_polls().len(),
        "open_sessions": state.manager.open_sessions(),
    }))
    .into_response()
}

/// Handler for `POST /sessions/{protocol}`; the body is the session config.
async fn configure_handler(
    State(state): State<AppState>,
    Path(protocol): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(config) = body?;
    let protocol: ProtocolKind = protocol.parse()?;
    let id = state.manager.configure_session(protocol, &config).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))).into_response())
}

/// Handler for `POST /sessions/{id}/read/{dataPoint}`.
async fn session_read_handler(
    State(state): State<AppState>,
    Path((id, data_point)): Path<(String, String)>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(options) = body?;
    let id = parse_session_id(&id)?;
    let data_point: DataPoint = data_point.parse()?;
    let request = RegisterRequest::from_json(&options)?;

    let bytes = state.manager.session_read(id, data_point, &request).await?;
    Ok(hex_payload(StatusCode::OK, &bytes))
}

/// Handler for `POST /sessions/{id}/write/{dataPoint}`.
async fn session_write_handler(
    State(state): State<AppState>,
    Path((id, data_point)): Path<(String, String)>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(options) = body?;
    let id = parse_session_id(&id)?;
    let data_point: DataPoint = data_point.parse()?;
    let request = RegisterRequest::from_json(&options)?;

    let bytes = state.manager.session_write(id, data_point, &request).await?;
    Ok(hex_payload(StatusCode::OK, &bytes))
}

/// Handler for `DELETE /sessions/{id}`.
async fn close_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let id = parse_session_id(&id)?;
    state.manager.close_session(id).await?;
    Ok(Json(json!({ "closed": true })).into_response())
}

/// HTTP server configuration.
pub struct HttpServer {
    manager: Arc<SessionManager>,
    listen_addr: SocketAddr,
    topic_root: String,
    instance_id: String,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(
        manager: Arc<SessionManager>,
        listen_addr: SocketAddr,
        topic_root: String,
        instance_id: String,
    ) -> Self {
        Self {
            manager,
            listen_addr,
            topic_root,
            instance_id,
        }
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let router = create_router(self.manager, self.topic_root, self.instance_id);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(addr = %self.listen_addr, "HTTP server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "HTTP server error");
                anyhow::anyhow!("HTTP server error: {}", e)
            })?;

        info!("HTTP server stopped");
        Ok(())
    }
}
