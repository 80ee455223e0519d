// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire types of the cache store's replica query.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one stored replica of a cache block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    Undefined,
    Initialized,
    Processing,
    Complete,
    Removed,
    Failed,
}

/// One contiguous buffer backing a memory replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    /// Transfer endpoint of the node that owns the buffer, typically `host:port`.
    pub transport_endpoint: String,
    #[serde(default)]
    pub size: u64,
}

/// Where a replica's bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicaLocation {
    Memory {
        buffer_descriptors: Vec<BufferDescriptor>,
    },
    Disk {
        file_path: String,
    },
}

/// One stored copy of a cache block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub status: ReplicaStatus,
    pub location: ReplicaLocation,
}

impl ReplicaDescriptor {
    /// A complete memory replica owned by `node_id`.
    pub fn memory(node_id: impl Into<String>) -> Self {
        ReplicaDescriptor {
            status: ReplicaStatus::Complete,
            location: ReplicaLocation::Memory {
                buffer_descriptors: vec![BufferDescriptor {
                    transport_endpoint: node_id.into(),
                    size: 0,
                }],
            },
        }
    }

    pub fn with_status(mut self, status: ReplicaStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_complete(&self) -> bool {
        self.status == ReplicaStatus::Complete
    }

    pub fn is_memory_replica(&self) -> bool {
        matches!(self.location, ReplicaLocation::Memory { .. })
    }

    /// Owning node of a memory replica: the endpoint of its first buffer.
    pub fn node_id(&self) -> Option<&str> {
        match &self.location {
            ReplicaLocation::Memory { buffer_descriptors } => buffer_descriptors
                .first()
                .map(|buffer| buffer.transport_endpoint.as_str()),
            ReplicaLocation::Disk { .. } => None,
        }
    }

    /// Node holding a usable copy: set only for complete memory replicas.
    pub fn complete_node_id(&self) -> Option<&str> {
        if self.is_complete() {
            self.node_id()
        } else {
            None
        }
    }
}

/// Result of looking up one cache key. `None` means the key is unknown to the store.
pub type LookupOutcome = Option<Vec<ReplicaDescriptor>>;

/// Best node for a sequence of cache keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixMatch<K> {
    Miss,
    Hit {
        /// Index of the last key in the matched prefix.
        best_index: usize,
        best_key: K,
        node_id: String,
    },
}

impl<K> PrefixMatch<K> {
    pub fn is_hit(&self) -> bool {
        matches!(self, PrefixMatch::Hit { .. })
    }

    /// Number of leading keys the winning node holds.
    pub fn matched_blocks(&self) -> usize {
        match self {
            PrefixMatch::Miss => 0,
            PrefixMatch::Hit { best_index, .. } => best_index + 1,
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            PrefixMatch::Miss => None,
            PrefixMatch::Hit { node_id, .. } => Some(node_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_wire_shape() {
        let json = serde_json::json!({
            "status": "complete",
            "location": {
                "type": "memory",
                "buffer_descriptors": [
                    {"transport_endpoint": "10.0.0.1:17777", "size": 4096},
                    {"transport_endpoint": "10.0.0.9:17777"}
                ]
            }
        });
        let replica: ReplicaDescriptor = serde_json::from_value(json).unwrap();
        assert!(replica.is_complete());
        assert!(replica.is_memory_replica());
        assert_eq!(replica.complete_node_id(), Some("10.0.0.1:17777"));
    }

    #[test]
    fn test_disk_and_incomplete_replicas_have_no_usable_node() {
        let disk = ReplicaDescriptor {
            status: ReplicaStatus::Complete,
            location: ReplicaLocation::Disk {
                file_path: "/mnt/cache/block".to_string(),
            },
        };
        assert!(!disk.is_memory_replica());
        assert_eq!(disk.complete_node_id(), None);

        let pending = ReplicaDescriptor::memory("a").with_status(ReplicaStatus::Processing);
        assert_eq!(pending.node_id(), Some("a"));
        assert_eq!(pending.complete_node_id(), None);

        let empty = ReplicaDescriptor {
            status: ReplicaStatus::Complete,
            location: ReplicaLocation::Memory {
                buffer_descriptors: vec![],
            },
        };
        assert_eq!(empty.complete_node_id(), None);
    }
}
