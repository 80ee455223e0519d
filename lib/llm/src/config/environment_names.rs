// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Environment variable names, grouped by functional area.
//!
//! - **Logging**: log level, configuration file and output format
//! - **Router**: listener address and backend pools, read by the CLI
//! - **Backend**: outbound connection pool and credentials

/// Logging environment variables
pub mod logging {
    /// Log filter directives (e.g., "debug", "conductor_llm=trace")
    pub const CONDUCTOR_LOG: &str = "CONDUCTOR_LOG";

    /// Path to logging configuration file
    pub const CONDUCTOR_LOGGING_CONFIG_PATH: &str = "CONDUCTOR_LOGGING_CONFIG_PATH";

    /// Enable JSONL logging format
    pub const CONDUCTOR_LOGGING_JSONL: &str = "CONDUCTOR_LOGGING_JSONL";

    /// Disable ANSI terminal colors in logs
    pub const CONDUCTOR_DISABLE_ANSI_LOGGING: &str = "CONDUCTOR_DISABLE_ANSI_LOGGING";

    /// Use local timezone for logging timestamps (default is UTC)
    pub const CONDUCTOR_LOG_USE_LOCAL_TZ: &str = "CONDUCTOR_LOG_USE_LOCAL_TZ";
}

/// Router settings, mirrored by the CLI flags
pub mod router {
    pub const CONDUCTOR_HOST: &str = "CONDUCTOR_HOST";

    pub const CONDUCTOR_PORT: &str = "CONDUCTOR_PORT";

    pub const CONDUCTOR_PREFILLER_HOSTS: &str = "CONDUCTOR_PREFILLER_HOSTS";

    pub const CONDUCTOR_PREFILLER_PORTS: &str = "CONDUCTOR_PREFILLER_PORTS";

    pub const CONDUCTOR_DECODER_HOSTS: &str = "CONDUCTOR_DECODER_HOSTS";

    pub const CONDUCTOR_DECODER_PORTS: &str = "CONDUCTOR_DECODER_PORTS";

    pub const CONDUCTOR_MAX_RETRIES: &str = "CONDUCTOR_MAX_RETRIES";

    /// Base delay in seconds for exponential backoff
    pub const CONDUCTOR_RETRY_DELAY: &str = "CONDUCTOR_RETRY_DELAY";

    /// Tokens per hashed cache block
    pub const CONDUCTOR_BLOCK_SIZE: &str = "CONDUCTOR_BLOCK_SIZE";

    pub const CONDUCTOR_CACHE_KEY_PREFIX: &str = "CONDUCTOR_CACHE_KEY_PREFIX";

    /// URL of the replica lookup sidecar; unset disables cache-aware prefill selection
    pub const CONDUCTOR_REPLICA_LOOKUP_URL: &str = "CONDUCTOR_REPLICA_LOOKUP_URL";

    pub const CONDUCTOR_PREFILL_NODE_IDS: &str = "CONDUCTOR_PREFILL_NODE_IDS";

    /// Path to a HuggingFace `tokenizer.json`
    pub const CONDUCTOR_TOKENIZER_PATH: &str = "CONDUCTOR_TOKENIZER_PATH";
}

/// Outbound backend connections
pub mod backend {
    /// Bearer token forwarded to every backend
    pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";

    pub const CONDUCTOR_BACKEND_POOL_MAX_IDLE_PER_HOST: &str =
        "CONDUCTOR_BACKEND_POOL_MAX_IDLE_PER_HOST";

    pub const CONDUCTOR_BACKEND_POOL_IDLE_TIMEOUT_SECS: &str =
        "CONDUCTOR_BACKEND_POOL_IDLE_TIMEOUT_SECS";

    pub const CONDUCTOR_BACKEND_CONNECT_TIMEOUT_SECS: &str =
        "CONDUCTOR_BACKEND_CONNECT_TIMEOUT_SECS";

    /// Whole-request timeout in seconds; unset means no deadline
    pub const CONDUCTOR_BACKEND_REQUEST_TIMEOUT_SECS: &str =
        "CONDUCTOR_BACKEND_REQUEST_TIMEOUT_SECS";
}
