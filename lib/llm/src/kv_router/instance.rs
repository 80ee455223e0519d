// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Registry of configured prefill and decode backends.
//!
//! Every configured backend gets exactly one [`BackendInstance`] for the lifetime of the
//! process. The instance owns the pooled HTTP connection to the backend, its load counters
//! and the set of request ids whose KV state the backend should drop on its next prime call.
//!
//! Counters are atomics so they can be read without taking the pool lock (health, metrics),
//! but they are only ever written by the [`super::load_balancer::LoadBalancer`] while it
//! holds the lock of the owning pool.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::environment_names::backend as env_backend;

/// Weight of outstanding KV cache in a prefill backend's score.
pub const PREFILL_KV_WEIGHT: f64 = 0.3;

const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 100;
const DEFAULT_POOL_IDLE_TIMEOUT_SECS: u64 = 90;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Which pool a backend belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    Prefill,
    Decode,
}

impl WorkerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Prefill => "prefill",
            WorkerType::Decode => "decode",
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network identity of a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendAddress {
    pub host: String,
    pub port: u16,
}

impl BackendAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        BackendAddress {
            host: host.into(),
            port,
        }
    }

    /// Base URL of the backend's OpenAI-compatible API, without the `/v1` suffix.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Connection pool settings shared by all backend clients.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendClientConfig {
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// Whole-request timeout. `None` leaves outbound calls unbounded; retries are bounded by
    /// attempt count only.
    pub request_timeout: Option<Duration>,
}

impl Default for BackendClientConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            pool_idle_timeout: Duration::from_secs(DEFAULT_POOL_IDLE_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            request_timeout: None,
        }
    }
}

impl BackendClientConfig {
    /// Defaults overridden by `CONDUCTOR_BACKEND_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = parse_env::<usize>(env_backend::CONDUCTOR_BACKEND_POOL_MAX_IDLE_PER_HOST)
        {
            config.pool_max_idle_per_host = size;
        }
        if let Some(secs) = parse_env::<u64>(env_backend::CONDUCTOR_BACKEND_POOL_IDLE_TIMEOUT_SECS) {
            config.pool_idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>(env_backend::CONDUCTOR_BACKEND_CONNECT_TIMEOUT_SECS) {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>(env_backend::CONDUCTOR_BACKEND_REQUEST_TIMEOUT_SECS) {
            config.request_timeout = Some(Duration::from_secs(secs));
        }

        config
    }

    pub fn build_client(&self) -> reqwest::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(self.pool_idle_timeout)
            .connect_timeout(self.connect_timeout);
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }
        builder.build()
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|val| val.parse().ok())
}

/// Point-in-time view of one backend's load counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadSnapshot {
    pub index: usize,
    pub address: String,
    pub active_tokens: i64,
    pub active_kv_cache: i64,
    pub active_requests: i64,
    pub pending_aborts: usize,
    pub score: f64,
}

/// Mutable state of one configured backend.
pub struct BackendInstance {
    index: usize,
    worker_type: WorkerType,
    address: BackendAddress,
    base_url: String,
    client: reqwest::Client,
    active_tokens: AtomicI64,
    active_kv_cache: AtomicI64,
    active_requests: AtomicI64,
    pending_aborts: Mutex<HashSet<String>>,
}

impl fmt::Debug for BackendInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendInstance")
            .field("index", &self.index)
            .field("worker_type", &self.worker_type)
            .field("address", &self.address)
            .field("active_tokens", &self.active_tokens())
            .field("active_kv_cache", &self.active_kv_cache())
            .finish()
    }
}

impl BackendInstance {
    pub fn new(
        index: usize,
        worker_type: WorkerType,
        address: BackendAddress,
        client: reqwest::Client,
    ) -> Self {
        let base_url = address.base_url();
        BackendInstance {
            index,
            worker_type,
            address,
            base_url,
            client,
            active_tokens: AtomicI64::new(0),
            active_kv_cache: AtomicI64::new(0),
            active_requests: AtomicI64::new(0),
            pending_aborts: Mutex::new(HashSet::new()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    pub fn address(&self) -> &BackendAddress {
        &self.address
    }

    /// The pooled connection to this backend.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Full URL for an API path such as `/v1/completions`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn active_tokens(&self) -> i64 {
        self.active_tokens.load(Ordering::Relaxed)
    }

    pub fn active_kv_cache(&self) -> i64 {
        self.active_kv_cache.load(Ordering::Relaxed)
    }

    pub fn active_requests(&self) -> i64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    /// Current selection score. Lower is less loaded.
    pub fn score(&self) -> f64 {
        match self.worker_type {
            WorkerType::Prefill => {
                self.active_tokens() as f64 + PREFILL_KV_WEIGHT * self.active_kv_cache() as f64
            }
            WorkerType::Decode => self.active_tokens() as f64,
        }
    }

    pub(crate) fn charge(&self, load_units: i64) {
        self.active_tokens.fetch_add(load_units, Ordering::Relaxed);
        if self.worker_type == WorkerType::Prefill {
            self.active_kv_cache.fetch_add(load_units, Ordering::Relaxed);
        }
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn discharge_tokens(&self, load_units: i64) {
        self.active_tokens.fetch_sub(load_units, Ordering::Relaxed);
        let _ = self
            .active_requests
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some((n - 1).max(0)));
    }

    pub(crate) fn discharge_kv_cache(&self, load_units: i64) {
        let _ = self
            .active_kv_cache
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |kv| {
                Some((kv - load_units).max(0))
            });
    }

    /// Queues `request_id` for abort notification on the next prime call. Idempotent.
    pub fn mark_aborted(&self, request_id: impl Into<String>) {
        self.pending_aborts.lock().insert(request_id.into());
    }

    /// Takes every queued abort, leaving the set empty.
    pub fn drain_aborted(&self) -> HashSet<String> {
        std::mem::take(&mut *self.pending_aborts.lock())
    }

    pub fn pending_abort_count(&self) -> usize {
        self.pending_aborts.lock().len()
    }

    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            index: self.index,
            address: self.address.to_string(),
            active_tokens: self.active_tokens(),
            active_kv_cache: self.active_kv_cache(),
            active_requests: self.active_requests(),
            pending_aborts: self.pending_abort_count(),
            score: self.score(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(worker_type: WorkerType) -> BackendInstance {
        BackendInstance::new(
            0,
            worker_type,
            BackendAddress::new("localhost", 8001),
            reqwest::Client::new(),
        )
    }

    #[test]
    fn test_urls() {
        let backend = instance(WorkerType::Prefill);
        assert_eq!(backend.address().to_string(), "localhost:8001");
        assert_eq!(
            backend.url("/v1/completions"),
            "http://localhost:8001/v1/completions"
        );
    }

    #[test]
    fn test_prefill_score_weights_kv_cache() {
        let backend = instance(WorkerType::Prefill);
        backend.charge(100);
        assert_eq!(backend.active_tokens(), 100);
        assert_eq!(backend.active_kv_cache(), 100);
        assert!((backend.score() - 130.0).abs() < f64::EPSILON);

        backend.discharge_tokens(100);
        assert!((backend.score() - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_decode_score_ignores_kv_cache() {
        let backend = instance(WorkerType::Decode);
        backend.charge(40);
        assert_eq!(backend.active_kv_cache(), 0);
        assert!((backend.score() - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_kv_cache_floors_at_zero() {
        let backend = instance(WorkerType::Prefill);
        backend.charge(10);
        backend.discharge_kv_cache(25);
        assert_eq!(backend.active_kv_cache(), 0);
    }

    #[test]
    fn test_drain_aborted_empties_set() {
        let backend = instance(WorkerType::Prefill);
        backend.mark_aborted("a");
        backend.mark_aborted("a");
        backend.mark_aborted("b");
        assert_eq!(backend.pending_abort_count(), 2);

        let drained = backend.drain_aborted();
        assert_eq!(drained, HashSet::from(["a".to_string(), "b".to_string()]));
        assert!(backend.drain_aborted().is_empty());
    }

    #[test]
    fn test_client_config_from_env() {
        temp_env::with_vars(
            [
                (
                    env_backend::CONDUCTOR_BACKEND_POOL_MAX_IDLE_PER_HOST,
                    Some("7"),
                ),
                (
                    env_backend::CONDUCTOR_BACKEND_CONNECT_TIMEOUT_SECS,
                    Some("not-a-number"),
                ),
            ],
            || {
                let config = BackendClientConfig::from_env();
                assert_eq!(config.pool_max_idle_per_host, 7);
                assert_eq!(
                    config.connect_timeout,
                    Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)
                );
                assert!(config.build_client().is_ok());
            },
        );
    }
}
