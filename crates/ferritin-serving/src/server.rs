//! HTTP front end.
//!
//! - `POST /v1/infer`: body in either binding, picked by `Content-Type`; the
//!   response uses the same binding
//! - `GET /health`: liveness plus the backend name
//!
//! Failures are answered with a JSON [`ErrorBody`] and a status derived from the
//! error kind.
use crate::codec::WireFormat;
use crate::error::{BackendError, ErrorBody, ErrorKind};
use crate::service::InferenceService;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub const INFER_PATH: &str = "/v1/infer";
pub const HEALTH_PATH: &str = "/health";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub backend: String,
}

impl BackendError {
    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::BatchTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::InternalFailure => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BackendError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(ErrorBody::from(&self))).into_response()
    }
}

pub fn router(service: Arc<InferenceService>, max_body_bytes: usize) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(INFER_PATH, post(infer))
        .with_state(service)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
}

async fn health(State(service): State<Arc<InferenceService>>) -> Response {
    let ready = service.is_ready();
    let health = Health {
        status: if ready { "ok" } else { "shutting_down" }.to_string(),
        backend: service.backend_name().to_string(),
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

async fn infer(
    State(service): State<Arc<InferenceService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let format = match headers.get(CONTENT_TYPE).map(|v| v.to_str()) {
        None => WireFormat::Binary,
        Some(Ok(value)) => match WireFormat::from_content_type(value) {
            Some(format) => format,
            None => {
                return BackendError::invalid_input(
                    "content-type",
                    format!("unsupported content type `{value}`"),
                )
                .into_response()
            }
        },
        Some(Err(_)) => {
            return BackendError::invalid_input("content-type", "header is not ASCII")
                .into_response()
        }
    };

    match service.handle(format, &body).await {
        Ok(bytes) => ([(CONTENT_TYPE, format.content_type())], bytes).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Serve until `shutdown` resolves, then let in-flight requests finish.
pub async fn serve<F>(
    service: Arc<InferenceService>,
    listener: TcpListener,
    max_body_bytes: usize,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(%addr, backend = %service.backend_name(), "listening");
    axum::serve(listener, router(service, max_body_bytes))
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("server stopped");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            BackendError::invalid_input("sequences", "x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BackendError::BatchTooLarge { size: 9, limit: 8 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            BackendError::Timeout {
                operation: "embed".into(),
                timeout_ms: 1
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            BackendError::unavailable("x").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            BackendError::internal("embed", "x").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
