// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! HTTP Service for the Conductor router
//!
//! Serves the OpenAI-compatible completions and chat completions endpoints in front of a pool
//! of prefill and a pool of decode backends. Every request is primed on a prefill backend and
//! then streamed from a decode backend; the response is relayed as the decode backend produces
//! it, for streaming and non-streaming requests alike.
//!
//! The [`service_v2::HttpService`] also serves `/healthcheck` and the Prometheus `/metrics`.

mod openai;

pub mod disconnect;
pub mod health;
pub mod metrics;
pub mod service_v2;

pub use axum;
pub use metrics::Metrics;

use axum::{Json, http::StatusCode};
use serde::{Deserialize, Serialize};

use crate::dispatch::DispatchError;

/// Documentation for a route
#[derive(Debug, Clone)]
pub struct RouteDoc {
    method: axum::http::Method,
    path: String,
}

impl std::fmt::Display for RouteDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

impl RouteDoc {
    pub fn new<T: Into<String>>(method: axum::http::Method, path: T) -> Self {
        RouteDoc {
            method,
            path: path.into(),
        }
    }
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn bad_request(msg: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: msg.to_string(),
            }),
        )
    }

    /// No backend is configured for one of the pools.
    pub fn service_unavailable(msg: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: msg.to_string(),
            }),
        )
    }

    /// A backend could not be reached or kept failing.
    pub fn bad_gateway(msg: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
        tracing::error!("Backend failure: {msg}");
        (
            StatusCode::BAD_GATEWAY,
            Json(ErrorResponse {
                error: msg.to_string(),
            }),
        )
    }

    /// Internal Service Error
    /// Internal errors are the result of misconfiguration or bugs in the service.
    pub fn internal_server_error(msg: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
        tracing::error!("Internal server error: {msg}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: msg.to_string(),
            }),
        )
    }

    pub fn from_dispatch_error(err: DispatchError) -> (StatusCode, Json<ErrorResponse>) {
        match err {
            DispatchError::InvalidRequest(err) => ErrorResponse::bad_request(err),
            err if err.is_no_backends() => ErrorResponse::service_unavailable(err),
            err @ (DispatchError::PrimeFailed { .. } | DispatchError::DecodeFailed { .. }) => {
                ErrorResponse::bad_gateway(err)
            }
            err => ErrorResponse::internal_server_error(err),
        }
    }
}
