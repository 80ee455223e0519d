// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Clients for the distributed cache store's replica query.
//!
//! The router only ever asks one question of the store: for each of these keys, which nodes
//! hold a copy? [`ReplicaLookup`] is that question. [`HttpReplicaLookup`] asks it of a JSON
//! sidecar in front of the store; [`StaticReplicaLookup`] answers it from memory.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::protocols::{LookupOutcome, ReplicaDescriptor};

const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 200;

#[async_trait]
pub trait ReplicaLookup: Send + Sync {
    /// Returns exactly one outcome per key, in key order.
    async fn batch_get_replica_list(&self, keys: &[String]) -> Result<Vec<LookupOutcome>>;
}

#[derive(Debug, Serialize)]
struct BatchLookupRequest<'a> {
    keys: &'a [String],
}

#[derive(Debug, Deserialize)]
struct BatchLookupResponse {
    results: Vec<LookupOutcome>,
}

/// Queries a replica lookup sidecar over HTTP.
///
/// `POST {url}` with `{"keys": [...]}`; the response is `{"results": [...]}` with one entry
/// per key, `null` for unknown keys.
pub struct HttpReplicaLookup {
    client: reqwest::Client,
    url: String,
}

impl HttpReplicaLookup {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(url, Duration::from_millis(DEFAULT_LOOKUP_TIMEOUT_MS))
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build replica lookup client")?;
        Ok(HttpReplicaLookup {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ReplicaLookup for HttpReplicaLookup {
    async fn batch_get_replica_list(&self, keys: &[String]) -> Result<Vec<LookupOutcome>> {
        let response = self
            .client
            .post(&self.url)
            .json(&BatchLookupRequest { keys })
            .send()
            .await
            .with_context(|| format!("replica lookup request to {} failed", self.url))?
            .error_for_status()?;

        let body: BatchLookupResponse = response
            .json()
            .await
            .context("malformed replica lookup response")?;
        Ok(body.results)
    }
}

/// In-memory replica table.
#[derive(Default)]
pub struct StaticReplicaLookup {
    replicas: RwLock<HashMap<String, Vec<ReplicaDescriptor>>>,
}

impl StaticReplicaLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, replica: ReplicaDescriptor) {
        self.replicas
            .write()
            .entry(key.into())
            .or_default()
            .push(replica);
    }

    pub fn remove(&self, key: &str) -> Option<Vec<ReplicaDescriptor>> {
        self.replicas.write().remove(key)
    }
}

#[async_trait]
impl ReplicaLookup for StaticReplicaLookup {
    async fn batch_get_replica_list(&self, keys: &[String]) -> Result<Vec<LookupOutcome>> {
        let replicas = self.replicas.read();
        Ok(keys.iter().map(|key| replicas.get(key).cloned()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::post};
    use serde_json::{Value, json};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/lookup")
    }

    #[tokio::test]
    async fn test_static_lookup_preserves_key_order() {
        let lookup = StaticReplicaLookup::new();
        lookup.insert("b", ReplicaDescriptor::memory("node-1"));
        lookup.insert("b", ReplicaDescriptor::memory("node-2"));

        let keys = vec!["a".to_string(), "b".to_string()];
        let results = lookup.batch_get_replica_list(&keys).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_none());
        assert_eq!(results[1].as_ref().map(|r| r.len()), Some(2));

        lookup.remove("b");
        let results = lookup.batch_get_replica_list(&keys).await.unwrap();
        assert!(results[1].is_none());
    }

    #[tokio::test]
    async fn test_http_lookup() {
        let router = Router::new().route(
            "/lookup",
            post(|Json(body): Json<Value>| async move {
                let keys = body["keys"].as_array().cloned().unwrap_or_default();
                let results: Vec<Value> = keys
                    .iter()
                    .map(|key| {
                        if key == "hot" {
                            json!([{
                                "status": "complete",
                                "location": {
                                    "type": "memory",
                                    "buffer_descriptors": [{"transport_endpoint": "10.0.0.1:17777"}]
                                }
                            }])
                        } else {
                            Value::Null
                        }
                    })
                    .collect();
                Json(json!({ "results": results }))
            }),
        );
        let url = serve(router).await;

        let lookup = HttpReplicaLookup::new(url).unwrap();
        let results = lookup
            .batch_get_replica_list(&["hot".to_string(), "cold".to_string()])
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(
            results[0].as_ref().unwrap()[0].complete_node_id(),
            Some("10.0.0.1:17777")
        );
        assert!(results[1].is_none());
    }

    #[tokio::test]
    async fn test_http_lookup_error_status() {
        let router = Router::new().route(
            "/lookup",
            post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down") }),
        );
        let url = serve(router).await;

        let lookup = HttpReplicaLookup::new(url).unwrap();
        assert!(lookup.batch_get_replica_list(&["k".to_string()]).await.is_err());
    }
}
