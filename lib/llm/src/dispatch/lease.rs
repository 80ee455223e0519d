// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use crate::kv_router::{BackendInstance, LoadBalancer, WorkerType};

/// The backends serving one attempt of a request.
#[derive(Clone)]
pub struct InstanceInfo {
    pub request_id: String,
    pub prefill: Arc<BackendInstance>,
    pub decode: Option<Arc<BackendInstance>>,
    pub load_units: i64,
}

impl std::fmt::Debug for InstanceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceInfo")
            .field("request_id", &self.request_id)
            .field("prefill", &self.prefill.address().to_string())
            .field("decode", &self.decode.as_ref().map(|d| d.address().to_string()))
            .field("load_units", &self.load_units)
            .finish()
    }
}

impl InstanceInfo {
    /// Queues this attempt's request id for release on its prefill backend.
    pub(crate) fn mark_aborted(&self) {
        tracing::warn!(
            request_id = %self.request_id,
            prefill = %self.prefill.address(),
            "request aborted, prefill backend will be notified on its next prime call"
        );
        self.prefill.mark_aborted(self.request_id.clone());
    }
}

/// Load charged on behalf of one attempt, returned to the balancer exactly once.
///
/// Created right after the prefill backend is charged. Prefill tokens are returned when the
/// prime call completes; prefill KV and decode load when the lease is dropped, whether the
/// decode stream finished, failed, or was cancelled.
pub(crate) struct InstanceLease {
    balancer: Arc<LoadBalancer>,
    info: InstanceInfo,
    prefill_tokens_held: bool,
}

impl InstanceLease {
    pub(crate) fn new(
        balancer: Arc<LoadBalancer>,
        request_id: String,
        prefill: Arc<BackendInstance>,
        load_units: i64,
    ) -> Self {
        InstanceLease {
            balancer,
            info: InstanceInfo {
                request_id,
                prefill,
                decode: None,
                load_units,
            },
            prefill_tokens_held: true,
        }
    }

    pub(crate) fn info(&self) -> &InstanceInfo {
        &self.info
    }

    pub(crate) fn request_id(&self) -> &str {
        &self.info.request_id
    }

    pub(crate) fn decode(&self) -> Option<&Arc<BackendInstance>> {
        self.info.decode.as_ref()
    }

    pub(crate) fn release_prefill_tokens(&mut self) {
        if std::mem::take(&mut self.prefill_tokens_held) {
            log_release(
                WorkerType::Prefill,
                self.balancer
                    .release_prefill(self.info.prefill.index(), self.info.load_units),
            );
        }
    }

    /// Records a decode backend already charged with this lease's load.
    pub(crate) fn attach_decode(&mut self, decode: Arc<BackendInstance>) {
        self.info.decode = Some(decode);
    }

    pub(crate) fn mark_aborted(&self) {
        self.info.mark_aborted();
    }

    /// Returns all held load, keeping the attempt's backends so it can still be aborted.
    pub(crate) fn release(self) -> InstanceInfo {
        let info = self.info.clone();
        drop(self);
        info
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.release_prefill_tokens();
        log_release(
            WorkerType::Prefill,
            self.balancer
                .release_prefill_kv(self.info.prefill.index(), self.info.load_units),
        );
        if let Some(decode) = self.info.decode.take() {
            log_release(
                WorkerType::Decode,
                self.balancer
                    .release_decode(decode.index(), self.info.load_units),
            );
        }
    }
}

fn log_release<E: std::fmt::Display>(worker_type: WorkerType, result: Result<(), E>) {
    if let Err(err) = result {
        tracing::error!(%worker_type, %err, "failed to release backend load");
    }
}
