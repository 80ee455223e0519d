// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use anyhow::{Context, Result};
use derive_builder::Builder;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{RouteDoc, health, metrics, openai};
use crate::config::RouterSettings;
use crate::dispatch::Dispatcher;
use crate::kv_router::{LoadBalancer, ReplicaLookup};

/// Application state shared by every handler.
pub struct State {
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<metrics::Metrics>,
}

impl State {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let metrics = dispatcher.metrics().clone();
        State {
            dispatcher,
            metrics,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        self.dispatcher.load_balancer()
    }

    pub fn metrics(&self) -> &Arc<metrics::Metrics> {
        &self.metrics
    }
}

#[derive(Clone)]
pub struct HttpService {
    state: Arc<State>,
    router: axum::Router,
    port: u16,
    host: String,
    route_docs: Vec<RouteDoc>,
}

#[derive(Builder)]
#[builder(pattern = "owned", build_fn(private, name = "build_internal"))]
pub struct HttpServiceConfig {
    settings: RouterSettings,

    /// Replica lookup used instead of the HTTP client built from the settings.
    #[builder(default, setter(strip_option))]
    replica_lookup: Option<Arc<dyn ReplicaLookup>>,
}

impl HttpService {
    pub fn builder() -> HttpServiceConfigBuilder {
        HttpServiceConfigBuilder::default()
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn route_docs(&self) -> &[RouteDoc] {
        &self.route_docs
    }

    pub async fn spawn(&self, cancel_token: CancellationToken) -> JoinHandle<Result<()>> {
        let this = self.clone();
        tokio::spawn(async move { this.run(cancel_token).await })
    }

    pub async fn run(&self, cancel_token: CancellationToken) -> Result<()> {
        let address = format!("{}:{}", self.host, self.port);
        tracing::info!(address, "Starting HTTP service on: {address}");

        let listener = tokio::net::TcpListener::bind(address.as_str())
            .await
            .with_context(|| format!("could not bind to address: {address}"))?;

        let router = self.router.clone();
        let observer = cancel_token.child_token();

        axum::serve(listener, router)
            .with_graceful_shutdown(observer.cancelled_owned())
            .await
            .inspect_err(|_| cancel_token.cancel())?;

        Ok(())
    }
}

impl HttpServiceConfigBuilder {
    pub fn build(self) -> Result<HttpService> {
        let config = self.build_internal()?;
        let settings = config.settings;

        // enable prometheus metrics
        let registry = metrics::Registry::new();
        let metrics = Arc::new(metrics::Metrics::new()?);
        metrics.register(&registry)?;

        let mut dispatcher = Dispatcher::from_settings(&settings, metrics)?;
        if let Some(lookup) = config.replica_lookup {
            dispatcher = dispatcher.with_replica_lookup(&settings, lookup)?;
        }
        let state = Arc::new(State::new(Arc::new(dispatcher)));

        let routes = vec![
            metrics::router(state.clone(), registry, None),
            health::health_check_router(state.clone(), None),
            openai::completions_router(state.clone(), None),
            openai::chat_completions_router(state.clone(), None),
        ];

        let mut router = axum::Router::new();
        let mut route_docs = Vec::new();
        for (docs, route) in routes {
            router = router.merge(route);
            route_docs.extend(docs);
        }

        tracing::debug!(
            routes = %route_docs.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
            "HTTP routes"
        );

        Ok(HttpService {
            state,
            router,
            port: settings.port,
            host: settings.host,
            route_docs,
        })
    }
}
