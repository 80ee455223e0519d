// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Prompt tokenization for cache-aware prefill routing.

pub mod hf;

pub use anyhow::{Error, Result};
pub use hf::HuggingFaceTokenizer;

pub type TokenIdType = conductor_tokens::Token;

/// Turns prompt text into the token ids the backends will see.
pub trait Encoder: Send + Sync {
    fn encode(&self, input: &str) -> Result<Vec<TokenIdType>>;
}
