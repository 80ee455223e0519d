// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Backend selection for disaggregated prefill/decode serving.
//!
//! - [`load_balancer`]: least-loaded selection and load accounting for both pools
//! - [`prefix_router`]: longest cached prefix search over replica lookups
//! - [`prefill_router`]: hashes a request and maps its cached prefix to a prefill backend
//! - [`replica_lookup`]: clients for the cache store's replica query

pub mod instance;
pub mod load_balancer;
pub mod prefill_router;
pub mod prefix_router;
pub mod protocols;
pub mod replica_lookup;

pub use instance::{BackendAddress, BackendClientConfig, BackendInstance, WorkerType};
pub use load_balancer::{LoadBalancer, LoadBalancerError};
pub use prefill_router::{CacheLookupResult, NodeMap, PrefillHit, PrefillRouter};
pub use prefix_router::find_best_prefix;
pub use replica_lookup::{HttpReplicaLookup, ReplicaLookup, StaticReplicaLookup};

/// Default number of tokens per hashed block.
pub const DEFAULT_BLOCK_SIZE: usize = 16;
