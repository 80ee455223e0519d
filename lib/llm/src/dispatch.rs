// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Two-phase request dispatch.
//!
//! Every request is first primed on a prefill backend with a single-token, non-streaming call
//! that leaves its KV cache ready for transfer. The prefill response's transfer parameters are
//! then attached to the real request, which is streamed from a decode backend back to the
//! client. A decode backend that loses the transferred state answers with a `recomputed` stop
//! reason; the [`DecodeSession`] then re-dispatches the remainder of the request to a fresh
//! pair without the client seeing a seam.

use std::sync::Arc;

use conductor_tokens::{BlockHasher, Token};
use serde_json::Value;

use crate::config::RouterSettings;
use crate::http::service::metrics::{Metrics, RetryPhase};
use crate::kv_router::{
    CacheLookupResult, HttpReplicaLookup, LoadBalancer, LoadBalancerError, NodeMap,
    PrefillRouter, ReplicaLookup, WorkerType,
};
use crate::protocols::{CompletionRequest, Endpoint, RequestError};
use crate::tokenizers::{Encoder, HuggingFaceTokenizer};

mod backend;
mod lease;
mod retry;
mod stream;

pub use backend::{BackendCall, BackendError, LineStream};
pub use lease::InstanceInfo;
pub use retry::RetryPolicy;
pub use stream::DecodeSession;

use lease::InstanceLease;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    LoadBalancer(#[from] LoadBalancerError),

    #[error("prefill backend {backend} failed: {source}")]
    PrimeFailed {
        backend: String,
        #[source]
        source: BackendError,
    },

    #[error("decode backend {backend} failed: {source}")]
    DecodeFailed {
        backend: String,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    InvalidRequest(#[from] RequestError),
}

impl DispatchError {
    /// True when a pool has no backends at all.
    pub fn is_no_backends(&self) -> bool {
        matches!(
            self,
            DispatchError::LoadBalancer(LoadBalancerError::NoBackends(_))
        )
    }
}

pub struct Dispatcher {
    balancer: Arc<LoadBalancer>,
    prefill_router: Option<PrefillRouter>,
    tokenizer: Option<Arc<dyn Encoder>>,
    retry: RetryPolicy,
    api_key: Option<String>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(balancer: Arc<LoadBalancer>, retry: RetryPolicy, metrics: Arc<Metrics>) -> Self {
        Dispatcher {
            balancer,
            prefill_router: None,
            tokenizer: None,
            retry,
            api_key: None,
            metrics,
        }
    }

    /// Builds the backend pools and, when configured, the cache-aware prefill path.
    pub fn from_settings(settings: &RouterSettings, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        let balancer = Arc::new(LoadBalancer::from_addresses(
            &settings.prefill,
            &settings.decode,
            &settings.client,
        )?);
        let retry = RetryPolicy::new(settings.max_retries, settings.retry_delay);
        let mut dispatcher =
            Dispatcher::new(balancer, retry, metrics).with_api_key(settings.api_key.clone());

        if let Some(url) = &settings.replica_lookup_url {
            let lookup = Arc::new(HttpReplicaLookup::new(url.clone())?);
            dispatcher = dispatcher.with_replica_lookup(settings, lookup)?;
            tracing::info!(
                url = %url,
                block_size = settings.block_size,
                "cache-aware prefill routing enabled"
            );
        }

        if let Some(path) = &settings.tokenizer_path {
            let tokenizer = HuggingFaceTokenizer::from_file(path)?;
            dispatcher = dispatcher.with_tokenizer(Arc::new(tokenizer));
        }

        Ok(dispatcher)
    }

    /// Enables cache-aware prefill selection against `lookup`, hashing and mapping nodes
    /// the way `settings` describe.
    pub fn with_replica_lookup(
        self,
        settings: &RouterSettings,
        lookup: Arc<dyn ReplicaLookup>,
    ) -> anyhow::Result<Self> {
        let mut hasher = BlockHasher::new(settings.block_size)?;
        if let Some(prefix) = &settings.cache_key_prefix {
            hasher = hasher.with_key_prefix(prefix.clone());
        }
        let nodes = NodeMap::new(&settings.prefill, settings.prefill_node_ids.as_deref());
        Ok(self.with_prefill_router(PrefillRouter::new(hasher, lookup, nodes)))
    }

    pub fn with_prefill_router(mut self, router: PrefillRouter) -> Self {
        self.prefill_router = Some(router);
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Encoder>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Primes a prefill backend and opens the decode stream.
    ///
    /// Failures up to and including the decode stream's first line are returned here, before
    /// anything is sent to the client.
    pub async fn dispatch(
        self: &Arc<Self>,
        endpoint: Endpoint,
        mut request: CompletionRequest,
    ) -> Result<DecodeSession, DispatchError> {
        let lease = self.select_instance(endpoint, &mut request).await?;
        let (first, lines) = self.open_decode(endpoint, &request, &lease).await?;
        Ok(DecodeSession::new(
            self.clone(),
            endpoint,
            request,
            lease,
            first,
            lines,
        ))
    }

    /// Charges a prefill backend, primes it, and charges a decode backend.
    pub(crate) async fn select_instance(
        &self,
        endpoint: Endpoint,
        request: &mut CompletionRequest,
    ) -> Result<InstanceLease, DispatchError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let load_units = request.load_units();

        let prefill_index = self.choose_prefill(request, load_units).await?;
        let prefill = self.balancer.prefill_instance(prefill_index)?;
        let mut lease = InstanceLease::new(
            self.balancer.clone(),
            request_id,
            prefill.clone(),
            load_units,
        );

        tracing::info!(
            request_id = %lease.request_id(),
            prefill = %prefill.address(),
            load_units,
            retry_count = request.retry_count(),
            "dispatching request"
        );

        let aborted: Vec<String> = prefill.drain_aborted().into_iter().collect();
        let payload = request.prime_payload(aborted.clone());
        let call = self.call(endpoint, lease.request_id());
        let url = prefill.url(endpoint.path());
        let primed = self
            .retry
            .run(
                &url,
                |_| call.prime(&prefill, &payload),
                |_, _| self.metrics.inc_retry(RetryPhase::Prime),
            )
            .await;
        lease.release_prefill_tokens();

        let response = match primed {
            Ok(response) => response,
            Err(source) => {
                for request_id in aborted {
                    prefill.mark_aborted(request_id);
                }
                return Err(DispatchError::PrimeFailed {
                    backend: prefill.address().to_string(),
                    source,
                });
            }
        };
        request.set_transfer_params(response.get("kv_transfer_params").cloned());

        let decode_index = self.balancer.select_decode(load_units)?;
        let decode = self.balancer.decode_instance(decode_index)?;
        tracing::debug!(
            request_id = %lease.request_id(),
            prefill = %prefill.address(),
            decode = %decode.address(),
            "selected decode backend"
        );
        lease.attach_decode(decode);
        Ok(lease)
    }

    /// Opens the decode stream for `lease`, retrying until its first line arrives.
    pub(crate) async fn open_decode(
        &self,
        endpoint: Endpoint,
        request: &CompletionRequest,
        lease: &InstanceLease,
    ) -> Result<(Option<String>, LineStream), DispatchError> {
        let Some(decode) = lease.decode() else {
            return Err(LoadBalancerError::NoBackends(WorkerType::Decode).into());
        };
        let payload = Value::Object(request.body().clone());
        let call = self.call(endpoint, lease.request_id());
        let url = decode.url(endpoint.path());

        self.retry
            .run(
                &url,
                |_| call.open_stream(decode, &payload),
                |_, _| self.metrics.inc_retry(RetryPhase::Decode),
            )
            .await
            .map_err(|source| {
                lease.mark_aborted();
                DispatchError::DecodeFailed {
                    backend: decode.address().to_string(),
                    source,
                }
            })
    }

    fn call<'a>(&'a self, endpoint: Endpoint, request_id: &'a str) -> BackendCall<'a> {
        BackendCall {
            path: endpoint.path(),
            request_id,
            api_key: self.api_key.as_deref(),
        }
    }

    /// Picks and charges a prefill backend, preferring one that already caches the prompt.
    async fn choose_prefill(
        &self,
        request: &CompletionRequest,
        load_units: i64,
    ) -> Result<usize, DispatchError> {
        if let Some(router) = &self.prefill_router {
            let result = match self.prompt_tokens(request) {
                Some(tokens) => router.find_prefill(&tokens).await,
                None => CacheLookupResult::Unavailable,
            };
            self.metrics.inc_prefix_cache_lookup(result.as_str());
            if let Some(hit) = result.hit() {
                self.balancer.acquire_prefill(hit.index, load_units)?;
                return Ok(hit.index);
            }
        }
        Ok(self.balancer.select_prefill(load_units)?)
    }

    fn prompt_tokens(&self, request: &CompletionRequest) -> Option<Vec<Token>> {
        if let Some(tokens) = request.token_ids() {
            return Some(tokens);
        }
        let tokenizer = self.tokenizer.as_ref()?;
        let text = request.prompt_text()?;
        match tokenizer.encode(text) {
            Ok(tokens) => Some(tokens),
            Err(err) => {
                tracing::warn!(%err, "failed to tokenize prompt");
                None
            }
        }
    }
}
