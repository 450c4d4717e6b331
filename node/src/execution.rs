// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The in-memory key-value store backing execution. Requests carry a
//! serialized [`KvCommand`]; the store applies them in batch order and
//! maintains a rolling digest over the applied payloads so replicas can
//! compare state at checkpoints.

use consensus::ExecutionState;
use crypto::Hash;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;
use types::Request;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KvCommand {
    Set { key: Vec<u8>, value: Vec<u8> },
    Get { key: Vec<u8> },
}

pub struct KvStore {
    map: DashMap<Vec<u8>, Vec<u8>>,
    /// Digest chained over every applied payload, in execution order.
    digest: Mutex<Hash>,
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
            digest: Mutex::new(Hash::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn advance_digest(&self, payload: &[u8]) {
        let mut digest = self.digest.lock();
        let mut bytes = Vec::with_capacity(crypto::DIGEST_LENGTH + payload.len());
        bytes.extend_from_slice(digest.as_bytes());
        bytes.extend_from_slice(payload);
        *digest = Hash::digest(&bytes);
    }
}

#[async_trait::async_trait]
impl ExecutionState for KvStore {
    async fn apply(&self, txn_id: u64, request: &Request) -> Vec<u8> {
        self.advance_digest(&request.payload);
        match bincode::deserialize::<KvCommand>(&request.payload) {
            Ok(KvCommand::Set { key, value }) => {
                trace!("txn {txn_id}: set {} bytes", value.len());
                self.map.insert(key, value.clone());
                value
            }
            Ok(KvCommand::Get { key }) => {
                self.map.get(&key).map(|v| v.value().clone()).unwrap_or_default()
            }
            // Opaque payloads still advance the digest; their result is
            // the payload echoed back.
            Err(_) => request.payload.clone(),
        }
    }

    async fn state_digest(&self) -> Hash {
        *self.digest.lock()
    }
}
