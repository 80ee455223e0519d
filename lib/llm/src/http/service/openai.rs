// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::Response,
    routing::post,
};
use tokio_util::sync::CancellationToken;

use super::{
    ErrorResponse, RouteDoc,
    disconnect::create_connection_monitor,
    service_v2,
};
use crate::protocols::{CompletionRequest, Endpoint};

const CLIENT_REQUEST_ID_HEADER: &str = "x-request-id";

type HandlerResult = Result<Response, (StatusCode, Json<ErrorResponse>)>;

/// OpenAI Completions Request Handler
///
/// Handles `/v1/completions`. The body is relayed from the decode backend as it is produced;
/// streaming requests get `text/event-stream`, the rest `application/json`.
async fn completions(
    State(state): State<Arc<service_v2::State>>,
    headers: HeaderMap,
    body: Bytes,
) -> HandlerResult {
    handle(state, Endpoint::Completions, headers, body).await
}

/// OpenAI Chat Completions Request Handler
async fn chat_completions(
    State(state): State<Arc<service_v2::State>>,
    headers: HeaderMap,
    body: Bytes,
) -> HandlerResult {
    handle(state, Endpoint::ChatCompletions, headers, body).await
}

async fn handle(
    state: Arc<service_v2::State>,
    endpoint: Endpoint,
    headers: HeaderMap,
    body: Bytes,
) -> HandlerResult {
    let client_request_id = headers
        .get(CLIENT_REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let result = relay(&state, endpoint, &client_request_id, body).await;
    let status = match &result {
        Ok(response) => response.status(),
        Err((status, _)) => *status,
    };
    state.metrics().inc_request(endpoint, status);
    result
}

#[tracing::instrument(level = "debug", skip_all, fields(%endpoint, client_request_id = %client_request_id))]
async fn relay(
    state: &Arc<service_v2::State>,
    endpoint: Endpoint,
    client_request_id: &str,
    body: Bytes,
) -> HandlerResult {
    let request = CompletionRequest::parse(&body).map_err(ErrorResponse::bad_request)?;

    let token = CancellationToken::new();
    let (mut connection_handle, mut stream_handle) =
        create_connection_monitor(token.clone(), Some(state.metrics().clone()));

    let session = match state.dispatcher().dispatch(endpoint, request).await {
        Ok(session) => session,
        Err(err) => {
            connection_handle.disarm();
            return Err(ErrorResponse::from_dispatch_error(err));
        }
    };

    tracing::debug!(instance = ?session.instance(), "relaying decode stream");
    let content_type = if session.is_stream() {
        "text/event-stream"
    } else {
        "application/json"
    };
    let mut chunks = session.spawn(token);

    // from here the body owns disconnect detection
    stream_handle.arm();
    let stream = async_stream::stream! {
        while let Some(chunk) = chunks.recv().await {
            yield Ok::<Bytes, Infallible>(chunk);
        }
        stream_handle.disarm();
    };
    connection_handle.disarm();

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type)
        .body(Body::from_stream(stream))
        .map_err(ErrorResponse::internal_server_error)
}

/// Create an Axum [`Router`] for the OpenAI API Completions endpoint
/// If not path is provided, the default path is `/v1/completions`
pub fn completions_router(
    state: Arc<service_v2::State>,
    path: Option<String>,
) -> (Vec<RouteDoc>, Router) {
    let path = path.unwrap_or_else(|| Endpoint::Completions.path().to_string());
    let doc = RouteDoc::new(axum::http::Method::POST, &path);
    let router = Router::new()
        .route(&path, post(completions))
        .with_state(state);
    (vec![doc], router)
}

/// Create an Axum [`Router`] for the OpenAI API Chat Completions endpoint
/// If not path is provided, the default path is `/v1/chat/completions`
pub fn chat_completions_router(
    state: Arc<service_v2::State>,
    path: Option<String>,
) -> (Vec<RouteDoc>, Router) {
    let path = path.unwrap_or_else(|| Endpoint::ChatCompletions.path().to_string());
    let doc = RouteDoc::new(axum::http::Method::POST, &path);
    let router = Router::new()
        .route(&path, post(chat_completions))
        .with_state(state);
    (vec![doc], router)
}
