// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Least-loaded backend selection for the prefill and decode pools.
//!
//! Each pool keeps a min-heap of [`PriorityEntry`] with exactly one entry per backend. A
//! selection pops the least loaded entry, charges the backend and pushes a fresh entry with
//! the new score; a release drops the backend's stale entry and pushes a fresh one. The heap
//! and every counter update happen under the pool lock, so a pop-charge-push is never
//! interleaved with another selection or release on the same pool.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use super::instance::{
    BackendAddress, BackendClientConfig, BackendInstance, LoadSnapshot, WorkerType,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LoadBalancerError {
    #[error("no {0} backends available to route work")]
    NoBackends(WorkerType),

    #[error("{worker_type} backend index {index} is out of range")]
    InvalidIndex {
        worker_type: WorkerType,
        index: usize,
    },
}

/// Heap entry ordering backends by score, then by index.
#[derive(Debug, Clone)]
pub struct PriorityEntry {
    pub score: f64,
    pub index: usize,
    pub instance: Arc<BackendInstance>,
}

impl PriorityEntry {
    fn current(instance: &Arc<BackendInstance>) -> Self {
        PriorityEntry {
            score: instance.score(),
            index: instance.index(),
            instance: instance.clone(),
        }
    }
}

impl PartialEq for PriorityEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PriorityEntry {}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.index.cmp(&other.index))
    }
}

/// One pool of interchangeable backends.
pub struct BackendPool {
    worker_type: WorkerType,
    instances: Vec<Arc<BackendInstance>>,
    heap: Mutex<BinaryHeap<Reverse<PriorityEntry>>>,
}

impl BackendPool {
    pub fn new(worker_type: WorkerType, instances: Vec<Arc<BackendInstance>>) -> Self {
        let heap = instances
            .iter()
            .map(|instance| Reverse(PriorityEntry::current(instance)))
            .collect();
        BackendPool {
            worker_type,
            instances,
            heap: Mutex::new(heap),
        }
    }

    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[Arc<BackendInstance>] {
        &self.instances
    }

    pub fn get(&self, index: usize) -> Result<&Arc<BackendInstance>, LoadBalancerError> {
        self.instances
            .get(index)
            .ok_or(LoadBalancerError::InvalidIndex {
                worker_type: self.worker_type,
                index,
            })
    }

    /// Charges the least loaded backend with `load_units` and returns its index.
    pub fn select(&self, load_units: i64) -> Result<usize, LoadBalancerError> {
        let mut heap = self.heap.lock();
        let Reverse(best) = heap
            .pop()
            .ok_or(LoadBalancerError::NoBackends(self.worker_type))?;
        best.instance.charge(load_units);
        heap.push(Reverse(PriorityEntry::current(&best.instance)));
        Ok(best.index)
    }

    /// Charges a specific backend with `load_units`.
    pub fn acquire(&self, index: usize, load_units: i64) -> Result<(), LoadBalancerError> {
        self.update(index, |instance| instance.charge(load_units))
    }

    pub fn release_tokens(&self, index: usize, load_units: i64) -> Result<(), LoadBalancerError> {
        self.update(index, |instance| instance.discharge_tokens(load_units))
    }

    pub fn release_kv_cache(
        &self,
        index: usize,
        load_units: i64,
    ) -> Result<(), LoadBalancerError> {
        self.update(index, |instance| instance.discharge_kv_cache(load_units))
    }

    fn update(
        &self,
        index: usize,
        mutate: impl FnOnce(&BackendInstance),
    ) -> Result<(), LoadBalancerError> {
        let instance = self.get(index)?;
        let mut heap = self.heap.lock();
        mutate(instance);
        heap.retain(|Reverse(entry)| entry.index != index);
        heap.push(Reverse(PriorityEntry::current(instance)));
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<LoadSnapshot> {
        let _heap = self.heap.lock();
        self.instances.iter().map(|i| i.snapshot()).collect()
    }

    #[cfg(test)]
    fn heap_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .heap
            .lock()
            .iter()
            .map(|Reverse(entry)| entry.index)
            .collect();
        indices.sort_unstable();
        indices
    }
}

/// Load accounting for both pools of a disaggregated deployment.
pub struct LoadBalancer {
    prefill: BackendPool,
    decode: BackendPool,
}

impl LoadBalancer {
    pub fn new(
        prefill: Vec<Arc<BackendInstance>>,
        decode: Vec<Arc<BackendInstance>>,
    ) -> Self {
        LoadBalancer {
            prefill: BackendPool::new(WorkerType::Prefill, prefill),
            decode: BackendPool::new(WorkerType::Decode, decode),
        }
    }

    /// Builds one [`BackendInstance`] per address, each with its own pooled client.
    pub fn from_addresses(
        prefill: &[BackendAddress],
        decode: &[BackendAddress],
        client_config: &BackendClientConfig,
    ) -> anyhow::Result<Self> {
        let build = |worker_type: WorkerType,
                     addresses: &[BackendAddress]|
         -> anyhow::Result<Vec<Arc<BackendInstance>>> {
            addresses
                .iter()
                .enumerate()
                .map(|(index, address)| -> anyhow::Result<Arc<BackendInstance>> {
                    let client = client_config.build_client()?;
                    Ok(Arc::new(BackendInstance::new(
                        index,
                        worker_type,
                        address.clone(),
                        client,
                    )))
                })
                .collect()
        };

        Ok(Self::new(
            build(WorkerType::Prefill, prefill)?,
            build(WorkerType::Decode, decode)?,
        ))
    }

    pub fn pool(&self, worker_type: WorkerType) -> &BackendPool {
        match worker_type {
            WorkerType::Prefill => &self.prefill,
            WorkerType::Decode => &self.decode,
        }
    }

    pub fn select_prefill(&self, load_units: i64) -> Result<usize, LoadBalancerError> {
        self.prefill.select(load_units)
    }

    /// Charges the prefill backend at `index`, chosen by prefix cache affinity.
    pub fn acquire_prefill(&self, index: usize, load_units: i64) -> Result<(), LoadBalancerError> {
        self.prefill.acquire(index, load_units)
    }

    pub fn release_prefill(&self, index: usize, load_units: i64) -> Result<(), LoadBalancerError> {
        self.prefill.release_tokens(index, load_units)
    }

    pub fn release_prefill_kv(
        &self,
        index: usize,
        load_units: i64,
    ) -> Result<(), LoadBalancerError> {
        self.prefill.release_kv_cache(index, load_units)
    }

    pub fn select_decode(&self, load_units: i64) -> Result<usize, LoadBalancerError> {
        self.decode.select(load_units)
    }

    pub fn release_decode(&self, index: usize, load_units: i64) -> Result<(), LoadBalancerError> {
        self.decode.release_tokens(index, load_units)
    }

    pub fn mark_aborted(
        &self,
        prefill_index: usize,
        request_id: &str,
    ) -> Result<(), LoadBalancerError> {
        self.prefill.get(prefill_index)?.mark_aborted(request_id);
        Ok(())
    }

    pub fn drain_aborted(&self, prefill_index: usize) -> Result<HashSet<String>, LoadBalancerError> {
        Ok(self.prefill.get(prefill_index)?.drain_aborted())
    }

    pub fn prefill_instance(&self, index: usize) -> Result<Arc<BackendInstance>, LoadBalancerError> {
        self.prefill.get(index).cloned()
    }

    pub fn decode_instance(&self, index: usize) -> Result<Arc<BackendInstance>, LoadBalancerError> {
        self.decode.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_instances(worker_type: WorkerType, n: usize) -> Vec<Arc<BackendInstance>> {
        (0..n)
            .map(|index| {
                Arc::new(BackendInstance::new(
                    index,
                    worker_type,
                    BackendAddress::new("localhost", 8000 + index as u16),
                    reqwest::Client::new(),
                ))
            })
            .collect()
    }

    fn balancer(prefill: usize, decode: usize) -> LoadBalancer {
        LoadBalancer::new(
            pool_instances(WorkerType::Prefill, prefill),
            pool_instances(WorkerType::Decode, decode),
        )
    }

    fn expected_min(pool: &BackendPool) -> usize {
        pool.instances()
            .iter()
            .min_by(|a, b| {
                a.score()
                    .total_cmp(&b.score())
                    .then_with(|| a.index().cmp(&b.index()))
            })
            .map(|i| i.index())
            .unwrap()
    }

    #[test]
    fn test_ties_break_to_lowest_index() {
        let lb = balancer(3, 3);
        assert_eq!(lb.select_prefill(10).unwrap(), 0);
        assert_eq!(lb.select_prefill(10).unwrap(), 1);
        assert_eq!(lb.select_prefill(10).unwrap(), 2);
        assert_eq!(lb.select_decode(5).unwrap(), 0);
    }

    #[test]
    fn test_select_prefill_charges_both_counters() {
        let lb = balancer(2, 1);
        let idx = lb.select_prefill(100).unwrap();
        let backend = lb.prefill_instance(idx).unwrap();
        assert_eq!(backend.active_tokens(), 100);
        assert_eq!(backend.active_kv_cache(), 100);
        assert_eq!(backend.active_requests(), 1);

        lb.release_prefill(idx, 100).unwrap();
        assert_eq!(backend.active_tokens(), 0);
        assert_eq!(backend.active_kv_cache(), 100);
        assert_eq!(backend.active_requests(), 0);

        lb.release_prefill_kv(idx, 60).unwrap();
        assert_eq!(backend.active_kv_cache(), 40);
        lb.release_prefill_kv(idx, 60).unwrap();
        assert_eq!(backend.active_kv_cache(), 0);
    }

    #[test]
    fn test_kv_cache_weight_affects_prefill_order() {
        let lb = balancer(2, 0);
        // backend 0: tokens 0, kv 100 -> score 30
        assert_eq!(lb.select_prefill(100).unwrap(), 0);
        lb.release_prefill(0, 100).unwrap();
        // backend 1: tokens 20, kv 20 -> score 26
        lb.acquire_prefill(1, 20).unwrap();
        assert_eq!(lb.select_prefill(1).unwrap(), 1);
    }

    #[test]
    fn test_decode_score_is_active_tokens() {
        let lb = balancer(0, 2);
        assert_eq!(lb.select_decode(50).unwrap(), 0);
        assert_eq!(lb.select_decode(10).unwrap(), 1);
        assert_eq!(lb.select_decode(10).unwrap(), 1);
        lb.release_decode(0, 50).unwrap();
        assert_eq!(lb.select_decode(1).unwrap(), 0);
        assert_eq!(lb.decode_instance(0).unwrap().active_kv_cache(), 0);
    }

    #[test]
    fn test_empty_pool_fails() {
        let lb = balancer(0, 0);
        assert_eq!(
            lb.select_prefill(1),
            Err(LoadBalancerError::NoBackends(WorkerType::Prefill))
        );
        assert_eq!(
            lb.select_decode(1),
            Err(LoadBalancerError::NoBackends(WorkerType::Decode))
        );
    }

    #[test]
    fn test_invalid_index() {
        let lb = balancer(1, 1);
        assert_eq!(
            lb.release_decode(3, 1),
            Err(LoadBalancerError::InvalidIndex {
                worker_type: WorkerType::Decode,
                index: 3
            })
        );
        assert!(lb.acquire_prefill(1, 1).is_err());
        assert!(lb.mark_aborted(9, "req").is_err());
    }

    #[test]
    fn test_one_entry_per_backend() {
        let lb = balancer(4, 0);
        for i in 0..4 {
            lb.acquire_prefill(i, 3).unwrap();
            lb.release_prefill(i, 1).unwrap();
            lb.release_prefill_kv(i, 1).unwrap();
        }
        lb.select_prefill(7).unwrap();
        assert_eq!(lb.pool(WorkerType::Prefill).heap_indices(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_selection_always_takes_minimum() {
        let lb = balancer(5, 0);
        let pool = lb.pool(WorkerType::Prefill);
        let mut outstanding: Vec<(usize, i64)> = Vec::new();

        // deterministic pseudo-random mix of selects and releases
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let units = (seed % 97) as i64 + 1;

            if seed % 3 == 0 && !outstanding.is_empty() {
                let (idx, units) = outstanding.swap_remove((seed as usize) % outstanding.len());
                lb.release_prefill(idx, units).unwrap();
                if seed % 2 == 0 {
                    lb.release_prefill_kv(idx, units).unwrap();
                }
            } else {
                let expected = expected_min(pool);
                let idx = lb.select_prefill(units).unwrap();
                assert_eq!(idx, expected, "selection must return the minimum score");
                outstanding.push((idx, units));
            }
        }
        assert_eq!(pool.heap_indices(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_drain_aborted_exactly_once() {
        let lb = balancer(2, 0);
        lb.mark_aborted(1, "req-1").unwrap();
        lb.mark_aborted(1, "req-2").unwrap();
        lb.mark_aborted(1, "req-1").unwrap();
        lb.mark_aborted(0, "req-3").unwrap();

        let drained = lb.drain_aborted(1).unwrap();
        assert_eq!(
            drained,
            HashSet::from(["req-1".to_string(), "req-2".to_string()])
        );
        assert!(lb.drain_aborted(1).unwrap().is_empty());
        assert_eq!(lb.drain_aborted(0).unwrap().len(), 1);
    }

    #[test]
    fn test_from_addresses() {
        let lb = LoadBalancer::from_addresses(
            &[BackendAddress::new("10.0.0.1", 8001)],
            &[
                BackendAddress::new("10.0.0.2", 8002),
                BackendAddress::new("10.0.0.3", 8002),
            ],
            &BackendClientConfig::default(),
        )
        .unwrap();
        assert_eq!(lb.pool(WorkerType::Prefill).len(), 1);
        assert_eq!(lb.pool(WorkerType::Decode).len(), 2);
        assert_eq!(
            lb.decode_instance(1).unwrap().address().to_string(),
            "10.0.0.3:8002"
        );
    }
}
