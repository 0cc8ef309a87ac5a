//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{any, get, post},
};
use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::bridge::protocol::{
    CompletionRequest, EmbeddingRequest, LoadRequest, LoadResponse, StatusResponse,
};
use crate::service::RunnerService;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Decode a JSON body, mapping failure to a 400.
///
/// Bodies are taken as raw bytes so a missing or odd content type does not
/// change the outcome.
#[allow(clippy::result_large_err)]
fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::debug!(error = %e, "Rejecting malformed request body");
        error_response(StatusCode::BAD_REQUEST, format!("invalid request: {e}"))
    })
}

async fn health(State(service): State<Arc<RunnerService>>) -> Json<StatusResponse> {
    Json(service.health())
}

async fn load(State(service): State<Arc<RunnerService>>, body: Bytes) -> Response {
    let request: LoadRequest = match decode(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let response: LoadResponse = service.load(request).await;
    Json(response).into_response()
}

async fn completion(State(service): State<Arc<RunnerService>>, body: Bytes) -> Response {
    let request: CompletionRequest = match decode(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let chunks = match service.completion(request).await {
        Ok(chunks) => chunks,
        Err(e) => {
            tracing::error!(error = %e, "Completion request failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
        }
    };

    // One body frame per chunk; hyper flushes each frame as it is produced.
    let lines = chunks.map(|chunk| {
        serde_json::to_vec(&chunk).map(|mut line| {
            line.push(b'\n');
            Bytes::from(line)
        })
    });

    (
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(lines),
    )
        .into_response()
}

async fn embedding(State(service): State<Arc<RunnerService>>, body: Bytes) -> Response {
    let request: EmbeddingRequest = match decode(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    match service.embedding(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Embedding request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

pub fn routes(service: Arc<RunnerService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/load", post(load))
        .route("/completion", any(completion))
        .route("/embedding", post(embedding))
        .with_state(service)
}
