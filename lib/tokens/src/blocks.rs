// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Chained hashing of full token blocks.

use crate::{BlockHash, ExtraKey, Token, TokenBlockError, hash_block};

/// Hashes every full block of `tokens`, chaining each block to the one before it.
///
/// Blocks start at offset 0; a trailing partial block is ignored. Returns an empty vector
/// when `tokens` does not fill a single block, or when `block_size` is 0.
pub fn chain_hashes(tokens: &[Token], block_size: usize) -> Vec<BlockHash> {
    chain_hashes_with(tokens, block_size, None)
}

fn chain_hashes_with(
    tokens: &[Token],
    block_size: usize,
    extra_keys: Option<&[ExtraKey]>,
) -> Vec<BlockHash> {
    if block_size == 0 {
        return Vec::new();
    }

    let mut hashes: Vec<BlockHash> = Vec::with_capacity(tokens.len() / block_size);
    for chunk in tokens.chunks_exact(block_size) {
        let hash = hash_block(hashes.last(), chunk, extra_keys);
        hashes.push(hash);
    }
    hashes
}

/// Block hashing configuration shared by every request routed through a cache store.
///
/// Cache keys are the lowercase hex digest of each block, prefixed with `key_prefix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHasher {
    block_size: usize,
    extra_keys: Option<Vec<ExtraKey>>,
    key_prefix: String,
}

impl BlockHasher {
    /// Creates a hasher for blocks of `block_size` tokens.
    pub fn new(block_size: usize) -> Result<Self, TokenBlockError> {
        if block_size == 0 {
            return Err(TokenBlockError::InvalidBlockSize);
        }
        Ok(BlockHasher {
            block_size,
            extra_keys: None,
            key_prefix: String::new(),
        })
    }

    /// Folds `extra_keys` into every block hash.
    pub fn with_extra_keys(mut self, extra_keys: Vec<ExtraKey>) -> Self {
        self.extra_keys = Some(extra_keys);
        self
    }

    /// Prepends `prefix` to every cache key.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Number of tokens per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The chain of block hashes for `tokens`.
    pub fn hashes(&self, tokens: &[Token]) -> Vec<BlockHash> {
        chain_hashes_with(tokens, self.block_size, self.extra_keys.as_deref())
    }

    /// The cache store keys for `tokens`, one per full block, in block order.
    pub fn cache_keys(&self, tokens: &[Token]) -> Vec<String> {
        self.hashes(tokens)
            .into_iter()
            .map(|hash| format!("{}{}", self.key_prefix, hash))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn tokens_1_to_10() -> Vec<Token> {
        (1..=10).collect()
    }

    #[test]
    fn test_chain_two_full_blocks() {
        let hashes = chain_hashes(&tokens_1_to_10(), 5);
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], hash_block(None, &[1, 2, 3, 4, 5], None));
        assert_eq!(hashes[1], hash_block(Some(&hashes[0]), &[6, 7, 8, 9, 10], None));
    }

    #[test]
    fn test_first_token_change_cascades() {
        let base = chain_hashes(&tokens_1_to_10(), 5);

        let mut changed = tokens_1_to_10();
        changed[0] = 100;
        let changed = chain_hashes(&changed, 5);

        assert_ne!(base[0], changed[0]);
        assert_ne!(base[1], changed[1]);
    }

    #[test]
    fn test_second_block_change_is_local() {
        let base = chain_hashes(&tokens_1_to_10(), 5);

        let mut changed = tokens_1_to_10();
        changed[5] = 600;
        let changed = chain_hashes(&changed, 5);

        assert_eq!(base[0], changed[0]);
        assert_ne!(base[1], changed[1]);
    }

    #[rstest]
    #[case(0, 5, 0)]
    #[case(4, 5, 0)]
    #[case(5, 5, 1)]
    #[case(9, 5, 1)]
    #[case(10, 5, 2)]
    #[case(10, 0, 0)]
    #[case(33, 16, 2)]
    fn test_only_full_blocks_are_hashed(
        #[case] len: u32,
        #[case] block_size: usize,
        #[case] expected: usize,
    ) {
        let tokens: Vec<Token> = (0..len).collect();
        assert_eq!(chain_hashes(&tokens, block_size).len(), expected);
    }

    #[test]
    fn test_hasher_rejects_zero_block_size() {
        assert_eq!(BlockHasher::new(0), Err(TokenBlockError::InvalidBlockSize));
    }

    #[test]
    fn test_cache_keys_are_prefixed_hex() {
        let hasher = BlockHasher::new(5).unwrap().with_key_prefix("llama@1@0@");
        let keys = hasher.cache_keys(&tokens_1_to_10());
        assert_eq!(
            keys[0],
            "llama@1@0@62a05fac03f5470c9e1e66b43447b1cb321ec98e3afb509f531d0781dde12d52"
        );
        assert_eq!(
            keys[1],
            "llama@1@0@3b3f53cad691850fca841706606c71b1320e0515cca38dec3b48f3e3722052be"
        );
    }

    #[test]
    fn test_extra_keys_apply_to_every_block() {
        let plain = BlockHasher::new(5).unwrap();
        let salted = BlockHasher::new(5)
            .unwrap()
            .with_extra_keys(vec![ExtraKey::Int(7)]);

        let plain = plain.hashes(&tokens_1_to_10());
        let salted = salted.hashes(&tokens_1_to_10());
        assert_eq!(salted.len(), 2);
        assert_ne!(plain[0], salted[0]);
        assert_eq!(
            salted[1],
            hash_block(Some(&salted[0]), &[6, 7, 8, 9, 10], Some(&[ExtraKey::Int(7)]))
        );
    }

    proptest! {
        #[test]
        fn prop_chain_is_restartable(
            tokens in proptest::collection::vec(any::<u32>(), 0..64),
            block_size in 1usize..9,
        ) {
            let full = chain_hashes(&tokens, block_size);
            prop_assert_eq!(full.len(), tokens.len() / block_size);

            // hashing a prefix of whole blocks reproduces the head of the chain
            let cut = (tokens.len() / block_size / 2) * block_size;
            let head = chain_hashes(&tokens[..cut], block_size);
            prop_assert_eq!(&full[..head.len()], &head[..]);
        }
    }
}
