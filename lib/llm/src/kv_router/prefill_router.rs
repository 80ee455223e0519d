// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cache-aware prefill selection.
//!
//! Hashes the request's full token blocks, asks the cache store which nodes hold them, and
//! maps the node with the longest cached prefix back to a configured prefill backend. Any
//! outcome other than a mapped hit leaves the choice to the load balancer.

use std::collections::HashMap;
use std::sync::Arc;

use conductor_tokens::{BlockHasher, Token};

use super::instance::BackendAddress;
use super::prefix_router::find_best_prefix;
use super::protocols::PrefixMatch;
use super::replica_lookup::ReplicaLookup;

/// A prefill backend that already holds a prefix of the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefillHit {
    pub index: usize,
    pub node_id: String,
    pub matched_blocks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookupResult {
    Hit(PrefillHit),
    Miss,
    /// The best node is not one of the configured prefill backends.
    Unmapped(String),
    /// Lookup failed or the request had no full block.
    Unavailable,
}

impl CacheLookupResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLookupResult::Hit(_) => "hit",
            CacheLookupResult::Miss => "miss",
            CacheLookupResult::Unmapped(_) => "unmapped",
            CacheLookupResult::Unavailable => "unavailable",
        }
    }

    pub fn hit(&self) -> Option<&PrefillHit> {
        match self {
            CacheLookupResult::Hit(hit) => Some(hit),
            _ => None,
        }
    }
}

/// Maps cache store node ids to prefill backend indices.
///
/// With explicit node ids, `node_ids[i]` names prefill backend `i`. Otherwise a node id of
/// the form `host:port` maps to the single prefill backend on `host`; a host shared by
/// several backends cannot be resolved and is left unmapped.
#[derive(Debug, Clone, Default)]
pub struct NodeMap {
    explicit: HashMap<String, usize>,
    hosts: HashMap<String, Option<usize>>,
}

impl NodeMap {
    pub fn new(prefill: &[BackendAddress], node_ids: Option<&[String]>) -> Self {
        let explicit = node_ids
            .map(|ids| {
                ids.iter()
                    .enumerate()
                    .map(|(index, id)| (id.clone(), index))
                    .collect()
            })
            .unwrap_or_default();

        let mut hosts: HashMap<String, Option<usize>> = HashMap::new();
        for (index, address) in prefill.iter().enumerate() {
            hosts
                .entry(address.host.clone())
                .and_modify(|slot| *slot = None)
                .or_insert(Some(index));
        }

        NodeMap { explicit, hosts }
    }

    pub fn resolve(&self, node_id: &str) -> Option<usize> {
        if !self.explicit.is_empty() {
            return self.explicit.get(node_id).copied();
        }
        self.hosts.get(endpoint_host(node_id)).copied().flatten()
    }
}

/// Host part of `host:port`, `[v6]:port` or a bare host.
fn endpoint_host(endpoint: &str) -> &str {
    if let Some(rest) = endpoint.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => endpoint,
    }
}

pub struct PrefillRouter {
    hasher: BlockHasher,
    lookup: Arc<dyn ReplicaLookup>,
    nodes: NodeMap,
}

impl PrefillRouter {
    pub fn new(hasher: BlockHasher, lookup: Arc<dyn ReplicaLookup>, nodes: NodeMap) -> Self {
        PrefillRouter {
            hasher,
            lookup,
            nodes,
        }
    }

    pub fn block_size(&self) -> usize {
        self.hasher.block_size()
    }

    /// Looks up the request's cached prefix.
    pub async fn find_prefill(&self, tokens: &[Token]) -> CacheLookupResult {
        let keys = self.hasher.cache_keys(tokens);
        if keys.is_empty() {
            return CacheLookupResult::Unavailable;
        }

        let results = match self.lookup.batch_get_replica_list(&keys).await {
            Ok(results) => results,
            Err(err) => {
                tracing::warn!(%err, blocks = keys.len(), "replica lookup failed");
                return CacheLookupResult::Unavailable;
            }
        };

        let result = match find_best_prefix(&keys, &results) {
            PrefixMatch::Miss => CacheLookupResult::Miss,
            PrefixMatch::Hit {
                best_index,
                node_id,
                ..
            } => match self.nodes.resolve(&node_id) {
                Some(index) => CacheLookupResult::Hit(PrefillHit {
                    index,
                    node_id,
                    matched_blocks: best_index + 1,
                }),
                None => CacheLookupResult::Unmapped(node_id),
            },
        };

        tracing::debug!(
            result = result.as_str(),
            blocks = keys.len(),
            matched = result.hit().map_or(0, |hit| hit.matched_blocks),
            prefill = ?result.hit().map(|hit| hit.index),
            "prefix cache lookup"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::protocols::ReplicaDescriptor;
    use super::super::replica_lookup::StaticReplicaLookup;
    use super::*;
    use rstest::rstest;

    fn prefill_addresses() -> Vec<BackendAddress> {
        vec![
            BackendAddress::new("10.0.0.1", 8001),
            BackendAddress::new("10.0.0.2", 8001),
            BackendAddress::new("10.0.0.2", 8003),
        ]
    }

    #[rstest]
    #[case("10.0.0.1:17777", "10.0.0.1")]
    #[case("10.0.0.1", "10.0.0.1")]
    #[case("[fe80::1]:17777", "fe80::1")]
    #[case("fe80::1", "fe80::1")]
    #[case("node-a:rdma", "node-a:rdma")]
    fn test_endpoint_host(#[case] endpoint: &str, #[case] host: &str) {
        assert_eq!(endpoint_host(endpoint), host);
    }

    #[test]
    fn test_node_map_by_host() {
        let nodes = NodeMap::new(&prefill_addresses(), None);
        assert_eq!(nodes.resolve("10.0.0.1:17777"), Some(0));
        // shared host is ambiguous
        assert_eq!(nodes.resolve("10.0.0.2:17777"), None);
        assert_eq!(nodes.resolve("10.0.0.9:17777"), None);
    }

    #[test]
    fn test_node_map_explicit() {
        let ids = vec![
            "te-a".to_string(),
            "te-b".to_string(),
            "te-c".to_string(),
        ];
        let nodes = NodeMap::new(&prefill_addresses(), Some(&ids));
        assert_eq!(nodes.resolve("te-c"), Some(2));
        assert_eq!(nodes.resolve("10.0.0.1:17777"), None);
    }

    #[tokio::test]
    async fn test_find_prefill_hit() {
        let hasher = BlockHasher::new(4).unwrap();
        let tokens: Vec<Token> = (0..10).collect();
        let keys = hasher.cache_keys(&tokens);
        assert_eq!(keys.len(), 2);

        let lookup = Arc::new(StaticReplicaLookup::new());
        lookup.insert(keys[0].clone(), ReplicaDescriptor::memory("10.0.0.9:1"));
        lookup.insert(keys[0].clone(), ReplicaDescriptor::memory("10.0.0.1:1"));
        lookup.insert(keys[1].clone(), ReplicaDescriptor::memory("10.0.0.1:1"));

        let router = PrefillRouter::new(
            hasher,
            lookup,
            NodeMap::new(&prefill_addresses(), None),
        );
        assert_eq!(
            router.find_prefill(&tokens).await,
            CacheLookupResult::Hit(PrefillHit {
                index: 0,
                node_id: "10.0.0.1:1".to_string(),
                matched_blocks: 2,
            })
        );
    }

    #[tokio::test]
    async fn test_find_prefill_fallbacks() {
        let hasher = BlockHasher::new(4).unwrap();
        let tokens: Vec<Token> = (0..8).collect();
        let keys = hasher.cache_keys(&tokens);

        let lookup = Arc::new(StaticReplicaLookup::new());
        let router = PrefillRouter::new(
            hasher,
            lookup.clone(),
            NodeMap::new(&prefill_addresses(), None),
        );

        assert_eq!(router.find_prefill(&tokens[..3]).await, CacheLookupResult::Unavailable);
        assert_eq!(router.find_prefill(&tokens).await, CacheLookupResult::Miss);

        lookup.insert(keys[0].clone(), ReplicaDescriptor::memory("10.0.0.2:1"));
        assert_eq!(
            router.find_prefill(&tokens).await,
            CacheLookupResult::Unmapped("10.0.0.2:1".to_string())
        );
    }
}
