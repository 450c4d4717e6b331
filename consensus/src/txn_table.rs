// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The concurrent map from transaction id to its manager. Managers are
//! created lazily on first sighting and destroyed in bulk when a stable
//! checkpoint advances past them. Exclusive access is a short-lived map
//! guard; the per-instance single-writer discipline comes from routing
//! every message of an instance to the same worker.

use crate::txn_manager::TxnManager;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use types::{ConsensusError, ConsensusResult};

pub struct TxnTable {
    managers: DashMap<u64, TxnManager>,
    /// First transaction id that has not been garbage collected.
    last_deleted: AtomicU64,
}

impl Default for TxnTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnTable {
    pub fn new() -> Self {
        Self {
            managers: DashMap::new(),
            last_deleted: AtomicU64::new(0),
        }
    }

    /// Transaction ids strictly below this watermark are gone.
    pub fn last_deleted(&self) -> u64 {
        self.last_deleted.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    pub fn contains(&self, txn_id: u64) -> bool {
        self.managers.contains_key(&txn_id)
    }

    /// Exclusive access to an existing manager.
    pub fn get_mut(&self, txn_id: u64) -> Option<RefMut<'_, u64, TxnManager>> {
        self.managers.get_mut(&txn_id)
    }

    /// Fetches the manager for `txn_id`, creating it on first sighting.
    /// Ids below the garbage-collection watermark are refused.
    pub fn get_or_create(
        &self,
        txn_id: u64,
        instance: u64,
    ) -> ConsensusResult<RefMut<'_, u64, TxnManager>> {
        let watermark = self.last_deleted();
        if txn_id < watermark {
            return Err(ConsensusError::TooOld {
                txn_id,
                last_deleted: watermark,
            });
        }
        Ok(self
            .managers
            .entry(txn_id)
            .or_insert_with(|| TxnManager::new(txn_id, instance)))
    }

    /// Destroys every manager with `txn_id <= watermark` and advances the
    /// deletion watermark. Returns how many managers were reclaimed.
    pub fn gc_up_to(&self, watermark: u64) -> usize {
        let before = self.managers.len();
        self.managers.retain(|txn_id, _| *txn_id > watermark);
        self.last_deleted
            .fetch_max(watermark + 1, Ordering::AcqRel);
        before - self.managers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managers_are_created_lazily() {
        let table = TxnTable::new();
        assert!(!table.contains(399));
        {
            let tm = table.get_or_create(399, 3).unwrap();
            assert_eq!(tm.txn_id, 399);
            assert_eq!(tm.instance, 3);
            assert!(!tm.has_proposal());
        }
        assert!(table.contains(399));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn gc_reclaims_and_blocks_stale_ids() {
        let table = TxnTable::new();
        for txn_id in [99u64, 199, 299, 399, 499] {
            table.get_or_create(txn_id, 0).unwrap();
        }

        // Checkpoint at batch 2 of batch size 100 reclaims ids <= 299.
        let reclaimed = table.gc_up_to(299);
        assert_eq!(reclaimed, 3);
        assert_eq!(table.len(), 2);
        assert_eq!(table.last_deleted(), 300);

        // A delayed vote for a reclaimed batch is refused.
        assert_eq!(
            table.get_or_create(199, 0).err(),
            Some(ConsensusError::TooOld {
                txn_id: 199,
                last_deleted: 300,
            })
        );
        // In-flight ids above the watermark still resolve.
        assert!(table.get_or_create(399, 0).is_ok());
    }
}
