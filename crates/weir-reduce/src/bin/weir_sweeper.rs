//! Weir expiry sweeper service.
//!
//! Exposes `POST /run` for an external scheduler to trigger sweep passes and
//! `GET /health` for liveness probes. All configuration comes from the
//! environment; see `required_env` calls in `main`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;

use weir_core::observability::{LogFormat, init_logging};
use weir_core::storage::{ObjectStoreBackend, StorageBackend};
use weir_core::ScopedStorage;
use weir_reduce::config::ExpiryPolicy;
use weir_reduce::emit::StorageEmitter;
use weir_reduce::error::{Error, Result};
use weir_reduce::store::AggregationStore;
use weir_reduce::sweeper::{ExpirySweeper, SweepSummary};

#[derive(Clone)]
struct AppState {
    sweeper: Arc<ExpirySweeper<StorageEmitter>>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    message: String,
    summary: Option<SweepSummary>,
}

impl ApiError {
    fn from_summary(summary: SweepSummary) -> Self {
        Self {
            message: "sweep completed with errors".to_string(),
            summary: Some(summary),
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self {
            message: error.to_string(),
            summary: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        if let Some(summary) = self.summary {
            return (status, Json(summary)).into_response();
        }

        (
            status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn run_handler(
    State(state): State<AppState>,
) -> std::result::Result<Json<SweepSummary>, ApiError> {
    let summary = state.sweeper.sweep(Utc::now()).await?;

    if summary.is_clean() {
        Ok(Json(summary))
    } else {
        Err(ApiError::from_summary(summary))
    }
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::configuration(format!("missing {key}")))
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    std::env::var(key).map_or(default, |value| value.eq_ignore_ascii_case("true"))
}

fn resolve_port() -> Result<u16> {
    if let Ok(port) = std::env::var("PORT") {
        return port
            .parse::<u16>()
            .map_err(|_| Error::configuration("invalid PORT"));
    }

    if let Ok(port) = std::env::var("WEIR_PORT") {
        return port
            .parse::<u16>()
            .map_err(|_| Error::configuration("invalid WEIR_PORT"));
    }

    Ok(8080)
}

fn log_format_from_env() -> LogFormat {
    match std::env::var("WEIR_LOG_FORMAT") {
        Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(log_format_from_env());

    let pipeline_id = required_env("WEIR_PIPELINE_ID")?;
    let state_url = required_env("WEIR_STATE_URL")?;
    let emit_empty = parse_bool_env("WEIR_EMIT_EMPTY_COMPOSITE", false);
    let port = resolve_port()?;

    let backend = ObjectStoreBackend::from_url(&state_url)?;
    let backend: Arc<dyn StorageBackend> = Arc::new(backend);
    let storage = ScopedStorage::new(backend, pipeline_id)?;

    let sweeper = ExpirySweeper::new(
        AggregationStore::new(storage.clone()),
        StorageEmitter::new(storage),
        ExpiryPolicy {
            emit_empty_composite: emit_empty,
        },
    );

    let state = AppState {
        sweeper: Arc::new(sweeper),
    };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/run", post(run_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::configuration(format!("failed to bind: {e}")))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::configuration(format!("server error: {e}")))
}
