// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::Method, routing::get};
use serde::{Deserialize, Serialize};

use super::{RouteDoc, service_v2};
use crate::kv_router::WorkerType;

/// Body of the health check: the router is up and knows this many backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub prefill_instances: usize,
    pub decode_instances: usize,
}

pub fn health_check_router(
    state: Arc<service_v2::State>,
    path: Option<String>,
) -> (Vec<RouteDoc>, Router) {
    let health_path = path.unwrap_or_else(|| "/healthcheck".to_string());
    let docs = vec![RouteDoc::new(Method::GET, &health_path)];

    let router = Router::new()
        .route(&health_path, get(health_handler))
        .with_state(state);

    (docs, router)
}

async fn health_handler(State(state): State<Arc<service_v2::State>>) -> Json<HealthResponse> {
    let balancer = state.load_balancer();
    Json(HealthResponse {
        status: "ok".to_string(),
        prefill_instances: balancer.pool(WorkerType::Prefill).len(),
        decode_instances: balancer.pool(WorkerType::Decode).len(),
    })
}
