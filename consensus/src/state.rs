// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Engine-wide shared state: one value constructed at startup and handed
//! (by shared ownership) to every task.

use crate::txn_table::TxnTable;
use config::{Committee, Parameters};
use crypto::{Hash, NodeId};
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use types::QuorumCertificate;

pub struct EngineState {
    pub node_id: NodeId,
    pub committee: Committee,
    pub parameters: Parameters,

    /// Per-instance view the replica is currently at. Advances by `n` when
    /// a batch decides (the leader keeps its slot) and by 1 on a view
    /// change (the leadership rotates).
    current_view: Vec<AtomicU64>,
    /// Per-instance next global batch index; instance `k` owns the indices
    /// congruent to `k` modulo the instance count.
    next_idx: Vec<AtomicU64>,
    /// Highest-view prepared certificate per instance.
    prepared_qc: Vec<RwLock<QuorumCertificate>>,
    /// Highest-view locked certificate per instance; voting safety hinges
    /// on it.
    locked_qc: Vec<RwLock<QuorumCertificate>>,

    /// Per-instance map from batch hash to the highest-phase certificate
    /// witnessed for it.
    pub hash_to_qc: Vec<DashMap<Hash, QuorumCertificate>>,
    /// Per-instance hash <-> txn id indexes, so certificates arriving
    /// before or after their proposal can be matched to the manager.
    pub hash_to_txn: Vec<DashMap<Hash, u64>>,
    pub txn_to_hash: Vec<DashMap<u64, Hash>>,

    pub txn_table: TxnTable,

    /// Replicas believed crashed or Byzantine; consulted when rotating to
    /// a new leader.
    pub stopped_nodes: DashSet<NodeId>,
    /// Peers that completed the startup handshake.
    pub ready_nodes: DashSet<NodeId>,

    /// Next batch index the execute stage expects.
    last_executed: AtomicU64,
    /// Batch index of the last stable checkpoint.
    last_stable_checkpoint: AtomicU64,
}

impl EngineState {
    pub fn new(node_id: NodeId, committee: Committee, parameters: Parameters) -> Self {
        let instances = parameters.instances as usize;
        Self {
            node_id,
            committee,
            parameters,
            current_view: (0..instances).map(|_| AtomicU64::new(0)).collect(),
            next_idx: (0..instances).map(|k| AtomicU64::new(k as u64)).collect(),
            prepared_qc: (0..instances)
                .map(|_| RwLock::new(QuorumCertificate::genesis()))
                .collect(),
            locked_qc: (0..instances)
                .map(|_| RwLock::new(QuorumCertificate::genesis()))
                .collect(),
            hash_to_qc: (0..instances).map(|_| DashMap::new()).collect(),
            hash_to_txn: (0..instances).map(|_| DashMap::new()).collect(),
            txn_to_hash: (0..instances).map(|_| DashMap::new()).collect(),
            txn_table: TxnTable::new(),
            stopped_nodes: DashSet::new(),
            ready_nodes: DashSet::new(),
            last_executed: AtomicU64::new(0),
            last_stable_checkpoint: AtomicU64::new(0),
        }
    }

    pub fn instances(&self) -> u64 {
        self.parameters.instances
    }

    pub fn current_view(&self, instance: u64) -> u64 {
        self.current_view[instance as usize].load(Ordering::Acquire)
    }

    /// Advances the instance view, never regressing it.
    pub fn advance_view(&self, instance: u64, view: u64) {
        self.current_view[instance as usize].fetch_max(view, Ordering::AcqRel);
    }

    /// Takes the next global index owned by `instance`.
    pub fn assign_index(&self, instance: u64) -> u64 {
        self.next_idx[instance as usize].fetch_add(self.instances(), Ordering::AcqRel)
    }

    pub fn prepared_qc(&self, instance: u64) -> QuorumCertificate {
        self.prepared_qc[instance as usize].read().clone()
    }

    pub fn locked_qc(&self, instance: u64) -> QuorumCertificate {
        self.locked_qc[instance as usize].read().clone()
    }

    /// Adopts `qc` as the instance's prepared certificate iff it is
    /// strictly fresher (or the current one is genesis). Earlier
    /// certificates are dropped, never downgraded to.
    pub fn try_update_prepared(&self, instance: u64, qc: &QuorumCertificate) -> bool {
        let mut current = self.prepared_qc[instance as usize].write();
        if crate::safety::fresher(qc, &current) {
            *current = qc.clone();
            return true;
        }
        false
    }

    /// Same freshness rule for the lock.
    pub fn try_update_locked(&self, instance: u64, qc: &QuorumCertificate) -> bool {
        let mut current = self.locked_qc[instance as usize].write();
        if crate::safety::fresher(qc, &current) {
            *current = qc.clone();
            return true;
        }
        false
    }

    /// Records a certificate for its batch hash, keeping the highest phase
    /// seen.
    pub fn record_qc(&self, instance: u64, qc: &QuorumCertificate) {
        let map = &self.hash_to_qc[instance as usize];
        match map.get_mut(&qc.batch_hash) {
            Some(mut existing) => {
                if qc.kind > existing.kind || (qc.kind == existing.kind && qc.view > existing.view)
                {
                    *existing = qc.clone();
                }
            }
            None => {
                map.insert(qc.batch_hash, qc.clone());
            }
        }
    }

    pub fn index_batch(&self, instance: u64, hash: Hash, txn_id: u64) {
        self.hash_to_txn[instance as usize].insert(hash, txn_id);
        self.txn_to_hash[instance as usize].insert(txn_id, hash);
    }

    pub fn txn_for_hash(&self, instance: u64, hash: &Hash) -> Option<u64> {
        self.hash_to_txn[instance as usize].get(hash).map(|e| *e)
    }

    pub fn last_executed(&self) -> u64 {
        self.last_executed.load(Ordering::Acquire)
    }

    pub fn set_last_executed(&self, index: u64) {
        self.last_executed.fetch_max(index, Ordering::AcqRel);
    }

    pub fn last_stable_checkpoint(&self) -> u64 {
        self.last_stable_checkpoint.load(Ordering::Acquire)
    }

    pub fn set_last_stable_checkpoint(&self, index: u64) {
        self.last_stable_checkpoint.fetch_max(index, Ordering::AcqRel);
    }

    /// Drops every per-batch index entry at or below the garbage-collected
    /// transaction id.
    pub fn prune_indexes(&self, watermark: u64) {
        for instance in 0..self.instances() as usize {
            let stale: Vec<(u64, Hash)> = self.txn_to_hash[instance]
                .iter()
                .filter(|e| *e.key() <= watermark)
                .map(|e| (*e.key(), *e.value()))
                .collect();
            for (txn_id, hash) in stale {
                self.txn_to_hash[instance].remove(&txn_id);
                self.hash_to_txn[instance].remove(&hash);
                self.hash_to_qc[instance].remove(&hash);
            }
        }
    }
}
