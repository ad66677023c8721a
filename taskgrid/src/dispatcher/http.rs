//! HTTP surface of the dispatcher.
//!
//! - `POST /rest/v1/srv` - one request envelope in, one response envelope out
//! - `GET /rest/v1/variable/:id` - input bytes for an identified worker
//! - `GET /rest/v1/function/:code` - a dispatcher-sourced function binary
//! - `GET /health` - liveness

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::{Dispatcher, RequestEnvelope, ResponseBody, SESSION_ID_HEADER, WORKER_ID_HEADER};
use crate::cancellation::CancellationToken;
use crate::core::{VariableId, WorkerId};
use crate::errors::{TaskgridError, TransportError};
use crate::utils::now_utc;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error_type: &'static str,
    message: String,
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn map_error(e: &TaskgridError) -> HandlerError {
    let (status, error_type) = match e {
        TaskgridError::StaleSession(_) => (StatusCode::UNAUTHORIZED, "session"),
        TaskgridError::Storage(s) if s.is_not_found() => (StatusCode::NOT_FOUND, "not_found"),
        TaskgridError::UnknownRun(_) => (StatusCode::NOT_FOUND, "not_found"),
        e if e.is_retryable() => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    (
        status,
        Json(ErrorResponse {
            error_type,
            message: e.to_string(),
        }),
    )
}

/// Builds the router over a shared dispatcher.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/rest/v1/srv", post(srv_handler))
        .route("/rest/v1/variable/:id", get(variable_handler))
        .route("/rest/v1/function/:code", get(function_handler))
        .with_state(dispatcher)
}

/// Serves the dispatcher on its configured bind address until `shutdown`
/// is cancelled. Also runs session eviction and stale-task reclamation.
pub async fn serve(dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) -> Result<(), TaskgridError> {
    let addr = dispatcher.config().bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TransportError::Network {
            endpoint: addr.clone(),
            reason: e.to_string(),
        })?;
    info!(bind_addr = %addr, "dispatcher listening");

    let housekeeping = tokio::spawn(housekeeping_loop(Arc::clone(&dispatcher), shutdown.clone()));
    let token = shutdown.clone();
    let served = axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;

    shutdown.cancel("http server stopped");
    if let Err(e) = housekeeping.await {
        warn!(error = %e, "housekeeping task ended abnormally");
    }
    served.map_err(|e| {
        TransportError::Network {
            endpoint: addr,
            reason: e.to_string(),
        }
        .into()
    })
}

async fn housekeeping_loop(dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                dispatcher.evict_expired_sessions(now_utc());
                if let Err(e) = dispatcher.reclaim_stale(dispatcher.config().stale_task_threshold()).await {
                    error!(error = %e, "stale task reclamation failed");
                }
            }
        }
    }
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn srv_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<RequestEnvelope>,
) -> Result<Json<ResponseBody>, HandlerError> {
    match dispatcher.handle(request).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            error!(error = %e, "request failed");
            Err(map_error(&e))
        }
    }
}

fn worker_session(headers: &HeaderMap) -> Result<(WorkerId, &str), HandlerError> {
    let worker_id = headers
        .get(WORKER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(WorkerId::new);
    let session_id = headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok());
    match (worker_id, session_id) {
        (Some(worker_id), Some(session_id)) => Ok((worker_id, session_id)),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error_type: "session",
                message: "worker and session headers are required".into(),
            }),
        )),
    }
}

async fn variable_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Result<Vec<u8>, HandlerError> {
    let (worker_id, session_id) = worker_session(&headers)?;
    dispatcher
        .fetch_variable(worker_id, session_id, VariableId::new(id))
        .await
        .map_err(|e| {
            warn!(variable_id = id, worker_id = %worker_id, error = %e, "variable download failed");
            map_error(&e)
        })
}

async fn function_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Vec<u8>, HandlerError> {
    let (worker_id, session_id) = worker_session(&headers)?;
    dispatcher
        .fetch_function(worker_id, session_id, &code)
        .await
        .map_err(|e| {
            warn!(function = %code, worker_id = %worker_id, error = %e, "function download failed");
            map_error(&e)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::RequestBody;
    use crate::errors::StorageError;
    use crate::testing::in_memory_dispatcher;

    #[tokio::test]
    async fn test_srv_handler_identifies() {
        let dispatcher = Arc::new(in_memory_dispatcher());
        let Json(response) = srv_handler(
            State(Arc::clone(&dispatcher)),
            Json(RequestEnvelope::anonymous(RequestBody::Identify { tags: Vec::new() })),
        )
        .await
        .unwrap();
        assert!(matches!(response, ResponseBody::Identity { .. }));
        assert_eq!(dispatcher.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_variable_handler_requires_session() {
        let dispatcher = Arc::new(in_memory_dispatcher());
        let (status, _) = variable_handler(State(Arc::clone(&dispatcher)), Path(1), HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (worker, session) = dispatcher.sessions().identify(Vec::new(), now_utc());
        let mut headers = HeaderMap::new();
        headers.insert(WORKER_ID_HEADER, worker.to_string().parse().unwrap());
        headers.insert(SESSION_ID_HEADER, session.parse().unwrap());
        let (status, _) = variable_handler(State(dispatcher), Path(999), headers)
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_function_handler_serves_stored_binary() {
        let dispatcher = Arc::new(in_memory_dispatcher());
        dispatcher.store_function("fn.score", b"\x7fELF".to_vec()).await.unwrap();

        let (worker, session) = dispatcher.sessions().identify(Vec::new(), now_utc());
        let mut headers = HeaderMap::new();
        headers.insert(WORKER_ID_HEADER, worker.to_string().parse().unwrap());
        headers.insert(SESSION_ID_HEADER, session.parse().unwrap());

        let bytes = function_handler(State(Arc::clone(&dispatcher)), Path("fn.score".into()), headers.clone())
            .await
            .unwrap();
        assert_eq!(bytes, b"\x7fELF");

        let (status, _) = function_handler(State(Arc::clone(&dispatcher)), Path("fn.other".into()), headers)
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = function_handler(State(dispatcher), Path("fn.score".into()), HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_error_mapping() {
        let (status, _) = map_error(&TaskgridError::StaleSession(WorkerId::new(1)));
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = map_error(&StorageError::Unavailable("db locked".into()).into());
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
