// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! Types and utilities for hashing sequences of tokens into content-addressable blocks.
//!
//! A token sequence is cut into full blocks of `block_size` tokens. Each block is hashed
//! together with the hash of the block before it, so the hashes form a chain: changing any
//! token changes the hash of its own block and of every block after it.
//!
//! The digest is `sha256(pickle.dumps((parent, tuple(tokens), extra_keys)))`, which is the
//! same key an inference engine computes for its prefix cache. Keys derived here can be
//! looked up directly in a cache store populated by the engine.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub mod blocks;
pub mod pickle;

pub use blocks::{BlockHasher, chain_hashes};

/// A token is represented as a 32-bit unsigned integer.
pub type Token = u32;

/// Width of a [`BlockHash`] in bytes.
pub const BLOCK_HASH_LEN: usize = 32;

/// Parent hash used for the first block of every sequence.
pub const NONE_HASH: BlockHash = BlockHash([0u8; BLOCK_HASH_LEN]);

/// Errors raised while configuring block hashing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenBlockError {
    /// The block size must hold at least one token.
    #[error("block size must be greater than 0")]
    InvalidBlockSize,

    /// A hex string did not describe a 32 byte digest.
    #[error("invalid block hash '{0}': expected {len} hex characters", len = BLOCK_HASH_LEN * 2)]
    InvalidHex(String),
}

/// A SHA-256 digest identifying one block of tokens and, through its parent, every block
/// before it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash([u8; BLOCK_HASH_LEN]);

impl BlockHash {
    /// Wraps raw digest bytes.
    pub const fn from_bytes(bytes: [u8; BLOCK_HASH_LEN]) -> Self {
        BlockHash(bytes)
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; BLOCK_HASH_LEN] {
        &self.0
    }

    /// Lowercase hex rendering, the form used for cache store keys.
    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({self})")
    }
}

impl FromStr for BlockHash {
    type Err = TokenBlockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != BLOCK_HASH_LEN * 2 || !s.is_ascii() {
            return Err(TokenBlockError::InvalidHex(s.to_string()));
        }
        let mut bytes = [0u8; BLOCK_HASH_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
                .map_err(|_| TokenBlockError::InvalidHex(s.to_string()))?;
        }
        Ok(BlockHash(bytes))
    }
}

impl From<[u8; BLOCK_HASH_LEN]> for BlockHash {
    fn from(bytes: [u8; BLOCK_HASH_LEN]) -> Self {
        BlockHash(bytes)
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An additional key folded into a block hash, e.g. a LoRA id or a multimodal content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraKey {
    /// An integer key.
    Int(i64),
    /// A string key.
    Str(String),
}

impl From<i64> for ExtraKey {
    fn from(value: i64) -> Self {
        ExtraKey::Int(value)
    }
}

impl From<&str> for ExtraKey {
    fn from(value: &str) -> Self {
        ExtraKey::Str(value.to_string())
    }
}

impl From<String> for ExtraKey {
    fn from(value: String) -> Self {
        ExtraKey::Str(value)
    }
}

/// Hashes one block of tokens.
///
/// `parent` is the hash of the preceding block, or `None` for the first block, in which
/// case [`NONE_HASH`] is used. `extra_keys` of `None` hashes as Python `None`; a slice
/// hashes as a tuple of its keys.
pub fn hash_block(
    parent: Option<&BlockHash>,
    tokens: &[Token],
    extra_keys: Option<&[ExtraKey]>,
) -> BlockHash {
    use pickle::PickleValue;

    let parent = parent.unwrap_or(&NONE_HASH);
    let extra = match extra_keys {
        None => PickleValue::None,
        Some(keys) => PickleValue::Tuple(
            keys.iter()
                .map(|key| match key {
                    ExtraKey::Int(v) => PickleValue::Int(*v),
                    ExtraKey::Str(s) => PickleValue::Str(s.as_str()),
                })
                .collect(),
        ),
    };

    let payload = pickle::dumps(&PickleValue::Tuple(vec![
        PickleValue::Bytes(parent.as_bytes()),
        PickleValue::Ints(tokens),
        extra,
    ]));

    BlockHash(Sha256::digest(&payload).into())
}
