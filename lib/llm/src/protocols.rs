// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Conductor Protocols
//!
//! Message formats exchanged with clients over the OpenAI-compatible HTTP API and with the
//! prefill and decode backends behind it.
//!
//! Request bodies are kept as JSON objects rather than typed structs: the router only reads
//! and rewrites a handful of fields and forwards everything else untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod openai;

pub use openai::{ChoiceChunk, CompletionRequest, Endpoint, RequestError, StreamChunk};

/// The token ID type
pub type TokenIdType = conductor_tokens::Token;

/// KV transfer block attached to the prime call.
///
/// Tells the prefill backend to keep the computed KV cache for a remote decoder, and carries
/// the ids of earlier requests whose cached state it may now drop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KvTransferParams {
    pub do_remote_decode: bool,
    pub do_remote_prefill: bool,
    pub remote_engine_id: Option<Value>,
    pub remote_block_ids: Option<Value>,
    pub remote_host: Option<Value>,
    pub remote_port: Option<Value>,
    #[serde(default)]
    pub aborted_request: Vec<String>,
}

impl KvTransferParams {
    pub fn prime(aborted_request: Vec<String>) -> Self {
        KvTransferParams {
            do_remote_decode: true,
            do_remote_prefill: false,
            remote_engine_id: None,
            remote_block_ids: None,
            remote_host: None,
            remote_port: None,
            aborted_request,
        }
    }
}
