// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Conductor LLM
//!
//! The `conductor-llm` crate routes OpenAI-compatible completion requests across
//! disaggregated prefill and decode backends: a prefill backend computes the prompt's KV cache,
//! a decode backend receives it and streams the completion back to the client.

pub mod config;
pub mod dispatch;
pub mod http;
pub mod kv_router;
pub mod logging;
pub mod protocols;
pub mod tokenizers;
