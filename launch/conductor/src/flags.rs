// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use conductor_llm::config::environment_names::{backend as env_backend, router as env_router};
use conductor_llm::config::{RouterSettings, pair_addresses};
use conductor_llm::kv_router::BackendClientConfig;

/// Prefill/decode request router
#[derive(clap::Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Flags {
    /// Address the HTTP service listens on
    #[arg(long, env = env_router::CONDUCTOR_HOST, default_value = "localhost")]
    pub host: String,

    #[arg(long, env = env_router::CONDUCTOR_PORT, default_value_t = 8000)]
    pub port: u16,

    /// Prefill backend hosts, paired by position with `--prefiller-ports`
    #[arg(
        long,
        env = env_router::CONDUCTOR_PREFILLER_HOSTS,
        num_args = 1..,
        value_delimiter = ',',
        default_value = "localhost"
    )]
    pub prefiller_hosts: Vec<String>,

    #[arg(
        long,
        env = env_router::CONDUCTOR_PREFILLER_PORTS,
        num_args = 1..,
        value_delimiter = ',',
        default_value = "8001"
    )]
    pub prefiller_ports: Vec<u16>,

    /// Decode backend hosts, paired by position with `--decoder-ports`
    #[arg(
        long,
        env = env_router::CONDUCTOR_DECODER_HOSTS,
        num_args = 1..,
        value_delimiter = ',',
        default_value = "localhost"
    )]
    pub decoder_hosts: Vec<String>,

    #[arg(
        long,
        env = env_router::CONDUCTOR_DECODER_PORTS,
        num_args = 1..,
        value_delimiter = ',',
        default_value = "8002"
    )]
    pub decoder_ports: Vec<u16>,

    /// Attempts per backend call, including the first
    #[arg(long, env = env_router::CONDUCTOR_MAX_RETRIES, default_value_t = 3)]
    pub max_retries: u32,

    /// Base delay in seconds; doubles on every retry
    #[arg(long, env = env_router::CONDUCTOR_RETRY_DELAY, default_value_t = 0.001)]
    pub retry_delay: f64,

    /// Tokens per hashed cache block
    #[arg(long, env = env_router::CONDUCTOR_BLOCK_SIZE, default_value_t = 16)]
    pub block_size: usize,

    #[arg(long, env = env_router::CONDUCTOR_CACHE_KEY_PREFIX)]
    pub cache_key_prefix: Option<String>,

    /// Replica lookup service. Without it prefill selection is purely load based.
    #[arg(long, env = env_router::CONDUCTOR_REPLICA_LOOKUP_URL)]
    pub replica_lookup_url: Option<String>,

    /// Cache store node id of each prefill backend, in `--prefiller-hosts` order.
    /// Defaults to matching the lookup's node ids against the prefill hosts.
    #[arg(
        long,
        env = env_router::CONDUCTOR_PREFILL_NODE_IDS,
        num_args = 1..,
        value_delimiter = ','
    )]
    pub prefill_node_ids: Option<Vec<String>>,

    /// HuggingFace `tokenizer.json` used to hash text prompts
    #[arg(long, env = env_router::CONDUCTOR_TOKENIZER_PATH)]
    pub tokenizer_path: Option<PathBuf>,

    /// Whole-request timeout in seconds for backend calls
    #[arg(long, env = env_backend::CONDUCTOR_BACKEND_REQUEST_TIMEOUT_SECS)]
    pub request_timeout: Option<u64>,
}

impl Flags {
    pub fn router_settings(&self) -> anyhow::Result<RouterSettings> {
        if !self.retry_delay.is_finite() || self.retry_delay < 0.0 {
            anyhow::bail!("--retry-delay must be a non-negative number of seconds");
        }

        let mut client = BackendClientConfig::from_env();
        if let Some(secs) = self.request_timeout {
            client.request_timeout = Some(Duration::from_secs(secs));
        }

        let mut builder = RouterSettings::builder()
            .host(self.host.clone())
            .port(self.port)
            .prefill(pair_addresses(
                "prefiller",
                &self.prefiller_hosts,
                &self.prefiller_ports,
            )?)
            .decode(pair_addresses(
                "decoder",
                &self.decoder_hosts,
                &self.decoder_ports,
            )?)
            .max_retries(self.max_retries)
            .retry_delay(Duration::from_secs_f64(self.retry_delay))
            .block_size(self.block_size)
            .client(client);

        if let Some(prefix) = &self.cache_key_prefix {
            builder = builder.cache_key_prefix(prefix.clone());
        }
        if let Some(url) = &self.replica_lookup_url {
            builder = builder.replica_lookup_url(url.clone());
        }
        if let Some(node_ids) = &self.prefill_node_ids {
            builder = builder.prefill_node_ids(node_ids.clone());
        }
        if let Some(path) = &self.tokenizer_path {
            builder = builder.tokenizer_path(path.clone());
        }
        if let Ok(api_key) = std::env::var(env_backend::OPENAI_API_KEY) {
            builder = builder.api_key(api_key);
        }

        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_comma_lists_pair_up() {
        let flags = Flags::try_parse_from([
            "conductor",
            "--prefiller-hosts",
            "p0,p1",
            "--prefiller-ports",
            "7001,7002",
            "--decoder-hosts",
            "d0",
            "--decoder-ports",
            "7100",
            "--retry-delay",
            "0.25",
        ])
        .unwrap();

        let settings = flags.router_settings().unwrap();
        assert_eq!(settings.prefill.len(), 2);
        assert_eq!(settings.prefill[1].to_string(), "p1:7002");
        assert_eq!(settings.decode[0].to_string(), "d0:7100");
        assert_eq!(settings.retry_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_mismatched_ports_rejected() {
        let flags = Flags::try_parse_from([
            "conductor",
            "--decoder-hosts",
            "d0,d1",
            "--decoder-ports",
            "7100",
        ])
        .unwrap();
        assert!(flags.router_settings().is_err());
    }

    #[test]
    fn test_negative_retry_delay_rejected() {
        let flags = Flags::try_parse_from(["conductor", "--retry-delay=-1"]).unwrap();
        assert!(flags.router_settings().is_err());
    }
}
