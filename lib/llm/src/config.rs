// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Router settings, fixed at startup.

use std::path::PathBuf;
use std::time::Duration;

use derive_builder::Builder;
use validator::Validate;

use crate::kv_router::{BackendAddress, BackendClientConfig, DEFAULT_BLOCK_SIZE};

pub mod environment_names;

use environment_names::logging as env_logging;

/// Default number of attempts for each backend call.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay of the exponential backoff.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Default `max_tokens` when a request does not set one.
pub const DEFAULT_MAX_TOKENS: u64 = 16;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(transparent)]
    Builder(#[from] RouterSettingsBuilderError),

    #[error("invalid router settings: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("number of {pool} hosts ({hosts}) must match number of {pool} ports ({ports})")]
    MismatchedPool {
        pool: &'static str,
        hosts: usize,
        ports: usize,
    },

    #[error("{node_ids} prefill node ids given for {backends} prefill backends")]
    MismatchedNodeIds { node_ids: usize, backends: usize },
}

/// Everything the router needs to serve, supplied once at startup.
#[derive(Debug, Clone, Builder, Validate)]
#[builder(pattern = "owned", build_fn(private, name = "build_internal"))]
pub struct RouterSettings {
    #[builder(setter(into), default = "String::from(\"localhost\")")]
    pub host: String,

    #[builder(default = "8000")]
    pub port: u16,

    #[builder(default)]
    pub prefill: Vec<BackendAddress>,

    #[builder(default)]
    pub decode: Vec<BackendAddress>,

    /// Attempts per backend call, including the first.
    #[builder(default = "DEFAULT_MAX_RETRIES")]
    #[validate(range(min = 1, message = "max_retries must be at least 1"))]
    pub max_retries: u32,

    #[builder(default = "DEFAULT_RETRY_DELAY")]
    pub retry_delay: Duration,

    #[builder(default = "DEFAULT_BLOCK_SIZE")]
    #[validate(range(min = 1, message = "block_size must be at least 1"))]
    pub block_size: usize,

    #[builder(default, setter(into, strip_option))]
    pub cache_key_prefix: Option<String>,

    /// Replica lookup endpoint. Without it prefill selection is purely load based.
    #[builder(default, setter(into, strip_option))]
    pub replica_lookup_url: Option<String>,

    /// Cache store node id of each prefill backend, in prefill order.
    #[builder(default, setter(strip_option))]
    pub prefill_node_ids: Option<Vec<String>>,

    #[builder(default, setter(into, strip_option))]
    pub tokenizer_path: Option<PathBuf>,

    /// Bearer token for outbound calls.
    #[builder(default, setter(into, strip_option))]
    pub api_key: Option<String>,

    #[builder(default)]
    pub client: BackendClientConfig,
}

impl RouterSettings {
    pub fn builder() -> RouterSettingsBuilder {
        RouterSettingsBuilder::default()
    }
}

impl RouterSettingsBuilder {
    pub fn build(self) -> Result<RouterSettings, SettingsError> {
        let settings = self.build_internal()?;
        settings.validate()?;

        if let Some(node_ids) = &settings.prefill_node_ids {
            if node_ids.len() != settings.prefill.len() {
                return Err(SettingsError::MismatchedNodeIds {
                    node_ids: node_ids.len(),
                    backends: settings.prefill.len(),
                });
            }
        }

        Ok(settings)
    }
}

/// Zips parallel host and port lists into addresses.
pub fn pair_addresses(
    pool: &'static str,
    hosts: &[String],
    ports: &[u16],
) -> Result<Vec<BackendAddress>, SettingsError> {
    if hosts.len() != ports.len() {
        return Err(SettingsError::MismatchedPool {
            pool,
            hosts: hosts.len(),
            ports: ports.len(),
        });
    }
    Ok(hosts
        .iter()
        .zip(ports)
        .map(|(host, port)| BackendAddress::new(host.clone(), *port))
        .collect())
}

/// Check if a string is truthy.
///
/// This will be used to evaluate environment variables or any other subjective
/// configuration parameters that can be set by the user that should be evaluated
/// as a boolean value.
pub fn is_truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Check if an environment variable is truthy.
pub fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_truthy(val.as_str()),
        Err(_) => false,
    }
}

/// Returns true if `CONDUCTOR_LOGGING_JSONL` is set to a truthy value.
pub fn jsonl_logging_enabled() -> bool {
    env_is_truthy(env_logging::CONDUCTOR_LOGGING_JSONL)
}

/// Returns true if `CONDUCTOR_DISABLE_ANSI_LOGGING` is set to a truthy value.
pub fn disable_ansi_logging() -> bool {
    env_is_truthy(env_logging::CONDUCTOR_DISABLE_ANSI_LOGGING)
}

/// Returns true if `CONDUCTOR_LOG_USE_LOCAL_TZ` is set to a truthy value.
pub fn use_local_timezone() -> bool {
    env_is_truthy(env_logging::CONDUCTOR_LOG_USE_LOCAL_TZ)
}
