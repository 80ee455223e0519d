// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use tokio_util::sync::CancellationToken;

use conductor_llm::http::service::service_v2::HttpService;
use conductor_llm::logging;

mod flags;
use flags::Flags;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let flags = Flags::parse();
    let settings = flags.router_settings()?;
    tracing::info!(
        prefill = settings.prefill.len(),
        decode = settings.decode.len(),
        cache_aware = settings.replica_lookup_url.is_some(),
        "starting router"
    );

    let service = HttpService::builder().settings(settings).build()?;

    let cancel_token = CancellationToken::new();
    let signal_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for ctrl-c");
            return;
        }
        tracing::info!("shutting down");
        signal_token.cancel();
    });

    service.run(cancel_token).await
}
