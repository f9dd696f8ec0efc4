use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::controller::ControllerError;
use crate::controller::ControllerHandle;
use crate::controller::Snapshot;
use crate::thermostat::InvalidTarget;
use crate::thermostat::Mode;
use crate::thermostat::StateUpdate;
use crate::thermostat::Target;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
}

/// Body of PUT /v1/thermostat. The temperature is owned by the sensor.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ThermostatRequest {
    #[serde(default)]
    mode: Option<Mode>,
    #[serde(default)]
    target: Option<Target>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error(transparent)]
    InvalidTarget(#[from] InvalidTarget),

    #[error(transparent)]
    Controller(#[from] ControllerError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidTarget(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Controller(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        tracing::warn!("Request failed: {}", self);
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Shared application state
struct AppState {
    version: &'static str,
    controller: ControllerHandle,
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
        }),
    )
}

/// Handler for GET /v1/thermostat
#[tracing::instrument(skip(state))]
async fn get_thermostat(State(state): State<Arc<AppState>>) -> Json<Snapshot> {
    Json(state.controller.snapshot())
}

/// Handler for PUT /v1/thermostat
#[tracing::instrument(skip(state))]
async fn put_thermostat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ThermostatRequest>,
) -> Result<Json<Snapshot>, ApiError> {
    if let Some(target) = &request.target {
        target.validate()?;
    }

    let update = StateUpdate {
        mode: request.mode,
        target: request.target,
        temperature: None,
    };
    let snapshot = state.controller.update(update).await?;
    Ok(Json(snapshot))
}

/// Create the API router with all endpoints
fn create_router(controller: ControllerHandle) -> Router {
    let state = Arc::new(AppState {
        version: env!("CARGO_PKG_VERSION"),
        controller,
    });

    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/thermostat", get(get_thermostat).put(put_thermostat))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to `listen:port` and serves until `shutdown_rx` fires or its sender
/// is dropped.
pub async fn serve(
    listen: &str,
    port: u16,
    controller: ControllerHandle,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(controller);

    let addr: SocketAddr = format!("{}:{}", listen, port)
        .parse()
        .with_context(|| format!("invalid API listen address {}:{}", listen, port))?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}
