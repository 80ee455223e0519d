// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Longest cached prefix search over replica lookup results.

use std::collections::HashSet;

use super::protocols::{LookupOutcome, PrefixMatch};

/// Finds the node holding the longest run of complete replicas starting at `keys[0]`.
///
/// `lookup_results[i]` must describe `keys[i]`; when the lengths differ the lookup cannot be
/// trusted and the result is a miss. Only complete memory replicas count toward a node's
/// run. The longest run wins; on equal runs the node seen first (scanning keys in order,
/// replicas in order) is kept.
pub fn find_best_prefix<K: Clone>(keys: &[K], lookup_results: &[LookupOutcome]) -> PrefixMatch<K> {
    if keys.len() != lookup_results.len() {
        tracing::warn!(
            keys = keys.len(),
            results = lookup_results.len(),
            "cache key and lookup result counts differ; treating as a miss"
        );
        return PrefixMatch::Miss;
    }
    if keys.is_empty() {
        return PrefixMatch::Miss;
    }

    // per node hit vectors, in first-appearance order
    let mut nodes: Vec<(&str, Vec<bool>)> = Vec::new();
    for (index, outcome) in lookup_results.iter().enumerate() {
        let Some(replicas) = outcome else {
            continue;
        };

        let mut seen = HashSet::new();
        for node_id in replicas.iter().filter_map(|r| r.complete_node_id()) {
            if !seen.insert(node_id) {
                continue;
            }
            let position = match nodes.iter().position(|(id, _)| *id == node_id) {
                Some(position) => position,
                None => {
                    nodes.push((node_id, vec![false; keys.len()]));
                    nodes.len() - 1
                }
            };
            nodes[position].1[index] = true;
        }
    }

    let mut best: Option<(&str, usize)> = None;
    for (node_id, hits) in &nodes {
        let run = hits.iter().take_while(|hit| **hit).count();
        if run > best.map_or(0, |(_, best_run)| best_run) {
            best = Some((*node_id, run));
        }
    }

    match best {
        Some((node_id, run)) => PrefixMatch::Hit {
            best_index: run - 1,
            best_key: keys[run - 1].clone(),
            node_id: node_id.to_string(),
        },
        None => PrefixMatch::Miss,
    }
}

#[cfg(test)]
mod tests {
    use super::super::protocols::{ReplicaDescriptor, ReplicaStatus};
    use super::*;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("k{i}")).collect()
    }

    /// Builds lookup results from per-node hit vectors.
    fn outcomes(nodes: &[(&str, &[bool])]) -> Vec<LookupOutcome> {
        let n = nodes.first().map_or(0, |(_, hits)| hits.len());
        (0..n)
            .map(|i| {
                let replicas: Vec<ReplicaDescriptor> = nodes
                    .iter()
                    .filter(|(_, hits)| hits[i])
                    .map(|(node, _)| ReplicaDescriptor::memory(*node))
                    .collect();
                if replicas.is_empty() {
                    None
                } else {
                    Some(replicas)
                }
            })
            .collect()
    }

    #[test]
    fn test_leading_run_beats_total_hits() {
        const T: bool = true;
        const F: bool = false;
        let results = outcomes(&[("A", &[T, T, T, F][..]), ("B", &[T, F, T, T][..])]);

        let result = find_best_prefix(&keys(4), &results);
        assert_eq!(
            result,
            PrefixMatch::Hit {
                best_index: 2,
                best_key: "k2".to_string(),
                node_id: "A".to_string(),
            }
        );
        assert_eq!(result.matched_blocks(), 3);
    }

    #[test]
    fn test_length_mismatch_is_miss() {
        let results = outcomes(&[("A", &[true, true][..])]);
        assert_eq!(find_best_prefix(&keys(3), &results), PrefixMatch::Miss);
    }

    #[test]
    fn test_no_leading_hit_is_miss() {
        let results = outcomes(&[("A", &[false, true, true][..]), ("B", &[false, false, true][..])]);
        let result = find_best_prefix(&keys(3), &results);
        assert!(!result.is_hit());
        assert_eq!(result.node_id(), None);
    }

    #[test]
    fn test_empty_inputs_are_miss() {
        assert_eq!(find_best_prefix::<String>(&[], &[]), PrefixMatch::Miss);
        assert_eq!(
            find_best_prefix(&keys(2), &[None, None]),
            PrefixMatch::Miss
        );
    }

    #[test]
    fn test_tie_keeps_first_seen_node() {
        let results = outcomes(&[("B", &[true, true, false][..]), ("A", &[true, true, false][..])]);
        let result = find_best_prefix(&keys(3), &results);
        assert_eq!(result.node_id(), Some("B"));
        assert_eq!(result.matched_blocks(), 2);
    }

    #[test]
    fn test_incomplete_replicas_do_not_count() {
        let results = vec![
            Some(vec![
                ReplicaDescriptor::memory("A").with_status(ReplicaStatus::Processing),
                ReplicaDescriptor::memory("B"),
            ]),
            Some(vec![ReplicaDescriptor::memory("A")]),
        ];
        let result = find_best_prefix(&keys(2), &results);
        assert_eq!(result.node_id(), Some("B"));
        assert_eq!(result.matched_blocks(), 1);
    }

    #[test]
    fn test_duplicate_replicas_on_one_node() {
        let results = vec![
            Some(vec![ReplicaDescriptor::memory("A"), ReplicaDescriptor::memory("A")]),
            Some(vec![ReplicaDescriptor::memory("A")]),
        ];
        let result = find_best_prefix(&keys(2), &results);
        assert_eq!(result.matched_blocks(), 2);
    }

    #[test]
    fn test_full_run_returns_last_key() {
        let results = outcomes(&[("A", &[true; 5][..])]);
        assert_eq!(
            find_best_prefix(&keys(5), &results),
            PrefixMatch::Hit {
                best_index: 4,
                best_key: "k4".to_string(),
                node_id: "A".to_string(),
            }
        );
    }
}
