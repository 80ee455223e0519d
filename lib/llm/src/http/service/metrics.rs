// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts};
use std::sync::Arc;

use crate::kv_router::{LoadBalancer, WorkerType};
use crate::protocols::Endpoint;

pub use prometheus::Registry;

use super::{RouteDoc, service_v2};

const METRICS_PREFIX: &str = "conductor";

pub struct Metrics {
    request_counter: IntCounterVec,
    backend_retries: IntCounterVec,
    recomputes: IntCounter,
    prefix_cache_lookups: IntCounterVec,
    client_disconnects: IntCounter,
    backend_active_tokens: IntGaugeVec,
}

/// Where a retried backend call was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Prime,
    Decode,
}

impl RetryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryPhase::Prime => "prime",
            RetryPhase::Decode => "decode",
        }
    }
}

impl Metrics {
    /// Creates the router's metrics:
    /// - `conductor_requests_total{endpoint,status}` - requests by HTTP status class
    /// - `conductor_backend_retries_total{phase}` - retried backend calls, `prime` or `decode`
    /// - `conductor_recomputes_total` - decode restarts after a `recomputed` stop reason
    /// - `conductor_prefix_cache_lookups_total{result}` - cache-aware prefill outcomes
    /// - `conductor_client_disconnects_total` - requests dropped by the client
    /// - `conductor_backend_active_tokens{pool,backend}` - outstanding load, refreshed on scrape
    pub fn new() -> Result<Self, prometheus::Error> {
        let name = |suffix: &str| format!("{METRICS_PREFIX}_{suffix}");

        let request_counter = IntCounterVec::new(
            Opts::new(name("requests_total"), "Total number of requests processed"),
            &["endpoint", "status"],
        )?;

        let backend_retries = IntCounterVec::new(
            Opts::new(
                name("backend_retries_total"),
                "Number of backend calls retried after a failure",
            ),
            &["phase"],
        )?;

        let recomputes = IntCounter::new(
            name("recomputes_total"),
            "Number of decode restarts requested by a backend",
        )?;

        let prefix_cache_lookups = IntCounterVec::new(
            Opts::new(
                name("prefix_cache_lookups_total"),
                "Outcomes of cache-aware prefill selection",
            ),
            &["result"],
        )?;

        let client_disconnects = IntCounter::new(
            name("client_disconnects_total"),
            "Number of connections dropped by clients",
        )?;

        let backend_active_tokens = IntGaugeVec::new(
            Opts::new(
                name("backend_active_tokens"),
                "Load units currently charged to a backend",
            ),
            &["pool", "backend"],
        )?;

        Ok(Metrics {
            request_counter,
            backend_retries,
            recomputes,
            prefix_cache_lookups,
            client_disconnects,
            backend_active_tokens,
        })
    }

    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.request_counter.clone()))?;
        registry.register(Box::new(self.backend_retries.clone()))?;
        registry.register(Box::new(self.recomputes.clone()))?;
        registry.register(Box::new(self.prefix_cache_lookups.clone()))?;
        registry.register(Box::new(self.client_disconnects.clone()))?;
        registry.register(Box::new(self.backend_active_tokens.clone()))?;
        Ok(())
    }

    pub fn inc_request(&self, endpoint: Endpoint, status: StatusCode) {
        self.request_counter
            .with_label_values(&[endpoint.as_str(), status.as_str()])
            .inc();
    }

    pub fn get_request_count(&self, endpoint: Endpoint, status: StatusCode) -> u64 {
        self.request_counter
            .with_label_values(&[endpoint.as_str(), status.as_str()])
            .get()
    }

    pub fn inc_retry(&self, phase: RetryPhase) {
        self.backend_retries
            .with_label_values(&[phase.as_str()])
            .inc();
    }

    pub fn get_retry_count(&self, phase: RetryPhase) -> u64 {
        self.backend_retries.with_label_values(&[phase.as_str()]).get()
    }

    pub fn inc_recompute(&self) {
        self.recomputes.inc();
    }

    pub fn get_recompute_count(&self) -> u64 {
        self.recomputes.get()
    }

    pub fn inc_prefix_cache_lookup(&self, result: &str) {
        self.prefix_cache_lookups.with_label_values(&[result]).inc();
    }

    pub fn inc_client_disconnect(&self) {
        self.client_disconnects.inc();
    }

    pub fn get_client_disconnect_count(&self) -> u64 {
        self.client_disconnects.get()
    }

    /// Copies every backend's outstanding load into the gauge.
    pub fn update_backend_loads(&self, balancer: &LoadBalancer) {
        for worker_type in [WorkerType::Prefill, WorkerType::Decode] {
            for snapshot in balancer.pool(worker_type).snapshot() {
                self.backend_active_tokens
                    .with_label_values(&[worker_type.as_str(), snapshot.address.as_str()])
                    .set(snapshot.active_tokens);
            }
        }
    }
}

/// Create a new router with the given path
pub fn router(
    state: Arc<service_v2::State>,
    registry: Registry,
    path: Option<String>,
) -> (Vec<RouteDoc>, Router) {
    let path = path.unwrap_or_else(|| "/metrics".to_string());
    let doc = RouteDoc::new(axum::http::Method::GET, &path);
    let route = Router::new()
        .route(&path, get(handler_metrics))
        .with_state((state, Arc::new(registry)));
    (vec![doc], route)
}

/// Metrics Handler
async fn handler_metrics(
    State((state, registry)): State<(Arc<service_v2::State>, Arc<Registry>)>,
) -> impl IntoResponse {
    state.metrics().update_backend_loads(state.load_balancer());

    let encoder = prometheus::TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = vec![];
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match String::from_utf8(buffer) {
        Ok(metrics) => (StatusCode::OK, metrics).into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response(),
    }
}
