// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Router logging.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `CONDUCTOR_LOGGING_CONFIG_PATH` environment variable.
//!
//! Output is compact human readable lines on stderr unless `CONDUCTOR_LOGGING_JSONL` is truthy,
//! in which case each event is one JSON object. Timestamps are UTC unless
//! `CONDUCTOR_LOG_USE_LOCAL_TZ` is truthy.
//!
//! Filters come from `CONDUCTOR_LOG` (standard `EnvFilter` directives) or the `log_filters`
//! table in the TOML file:
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "conductor_llm::dispatch" = "debug"
//! ```

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter::Directive, fmt};

use crate::config::environment_names::logging as env_logging;
use crate::config::{disable_ansi_logging, jsonl_logging_enabled, use_local_timezone};

const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::from([
                ("h2".to_string(), "error".to_string()),
                ("tower".to_string(), "error".to_string()),
                ("hyper_util".to_string(), "error".to_string()),
                ("reqwest".to_string(), "error".to_string()),
                ("rustls".to_string(), "error".to_string()),
                ("tokenizers".to_string(), "error".to_string()),
                ("axum".to_string(), "error".to_string()),
            ]),
        }
    }
}

/// Output encoding of log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    /// One line per event, `timestamp LEVEL target: message fields`.
    Compact,
    /// One JSON object per event, for log shippers.
    Jsonl,
}

impl LogFormat {
    fn from_env() -> Self {
        if jsonl_logging_enabled() {
            LogFormat::Jsonl
        } else {
            LogFormat::Compact
        }
    }
}

/// Installs the global subscriber. Later calls are no-ops.
///
/// A broken logging config is fatal: the router exits before serving anything.
pub fn init() {
    INIT.call_once(|| {
        if let Err(err) = install(LogFormat::from_env()) {
            eprintln!("conductor: failed to initialize logging: {err}");
            std::process::exit(1);
        }
    });
}

fn install(format: LogFormat) -> anyhow::Result<()> {
    let filter = env_filter(load_config()?);
    let stderr = fmt::layer().with_writer(std::io::stderr);

    let layer = match format {
        LogFormat::Jsonl => stderr
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_timer(Timestamp::from_env())
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => stderr
            .with_ansi(!disable_ansi_logging())
            .event_format(fmt::format().compact().with_timer(Timestamp::from_env()))
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(layer).try_init()?;
    Ok(())
}

/// `CONDUCTOR_LOG` directives on top of the configured level, with per-target overrides
/// from the config appended last. Unparseable entries are reported and skipped.
fn env_filter(config: LoggingConfig) -> EnvFilter {
    let default_directive = config
        .log_level
        .parse::<Directive>()
        .unwrap_or_else(|_| LevelFilter::INFO.into());

    let base = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(env_logging::CONDUCTOR_LOG)
        .from_env_lossy();

    config
        .log_filters
        .into_iter()
        .fold(base, |filter, (target, level)| {
            match format!("{target}={level}").parse::<Directive>() {
                Ok(directive) => filter.add_directive(directive),
                Err(err) => {
                    eprintln!("conductor: ignoring log filter {target}={level}: {err}");
                    filter
                }
            }
        })
}

fn load_config() -> Result<LoggingConfig, figment::Error> {
    let mut figment = Figment::new().merge(Serialized::defaults(LoggingConfig::default()));
    if let Ok(path) = std::env::var(env_logging::CONDUCTOR_LOGGING_CONFIG_PATH) {
        figment = figment.merge(Toml::file(path));
    }
    figment.extract()
}

/// RFC 3339 timestamps with microseconds, UTC unless the local zone is requested.
struct Timestamp {
    local: bool,
}

impl Timestamp {
    fn from_env() -> Self {
        Timestamp {
            local: use_local_timezone(),
        }
    }

    fn now(&self) -> String {
        if self.local {
            chrono::Local::now()
                .format("%Y-%m-%dT%H:%M:%S%.6f%:z")
                .to_string()
        } else {
            chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.6fZ")
                .to_string()
        }
    }
}

impl FormatTime for Timestamp {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", self.now())
    }
}
