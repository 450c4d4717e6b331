// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Static run configuration: the replica committee, protocol parameters and
//! feature flags. Configuration is loaded once at startup and never changes
//! for the lifetime of the run.

use crypto::{KeyPair, NodeId, PublicKey};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("node {0} is not in the committee")]
    NotInCommittee(NodeId),
    #[error("failed to read config file '{file}': {message}")]
    ImportError { file: String, message: String },
    #[error("failed to write config file '{file}': {message}")]
    ExportError { file: String, message: String },
}

/// Reads a config struct from a YAML file.
pub trait Import: DeserializeOwned {
    fn import(path: &Path) -> Result<Self, ConfigError> {
        let reader = || -> Result<Self, serde_yaml::Error> {
            let data = fs::read_to_string(path).map_err(serde::de::Error::custom)?;
            serde_yaml::from_str(&data)
        };
        reader().map_err(|e| ConfigError::ImportError {
            file: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

/// Writes a config struct to a YAML file.
pub trait Export: Serialize {
    fn export(&self, path: &Path) -> Result<(), ConfigError> {
        let writer = || -> Result<(), serde_yaml::Error> {
            let data = serde_yaml::to_string(self)?;
            fs::write(path, data).map_err(serde::ser::Error::custom)
        };
        writer().map_err(|e| ConfigError::ExportError {
            file: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

/// One replica of the committee.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Authority {
    /// The key this authority signs protocol messages and shares with.
    pub protocol_key: PublicKey,
    /// Network address of the authority.
    pub address: SocketAddr,
}

/// A client node admitted to submit batches.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientAuthority {
    pub key: PublicKey,
    pub address: SocketAddr,
}

/// The fixed replica set. `n = 3f + 1`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Committee {
    /// Replicas keyed by node id. Ids are dense in `[0, n)`.
    pub authorities: BTreeMap<NodeId, Authority>,
    /// Client nodes keyed by node id. Ids start at `n`.
    pub clients: BTreeMap<NodeId, ClientAuthority>,
}

impl Committee {
    /// Number of replicas in the committee.
    pub fn size(&self) -> usize {
        self.authorities.len()
    }

    /// The maximum number of Byzantine replicas tolerated, `f = (n - 1) / 3`.
    pub fn min_faulty(&self) -> u64 {
        (self.size() as u64 - 1) / 3
    }

    /// Votes needed to certify a phase, `2f + 1`.
    pub fn quorum_threshold(&self) -> u64 {
        2 * self.min_faulty() + 1
    }

    /// Matching responses guaranteeing at least one honest voice, `f + 1`.
    pub fn validity_threshold(&self) -> u64 {
        self.min_faulty() + 1
    }

    /// The leader of `view` in consensus instance `instance`.
    pub fn leader(&self, instance: u64, view: u64) -> NodeId {
        (view + instance) % self.size() as u64
    }

    pub fn authority(&self, node: NodeId) -> Result<&Authority, ConfigError> {
        self.authorities
            .get(&node)
            .ok_or(ConfigError::NotInCommittee(node))
    }

    pub fn protocol_key(&self, node: NodeId) -> Result<&PublicKey, ConfigError> {
        Ok(&self.authority(node)?.protocol_key)
    }

    pub fn client_key(&self, node: NodeId) -> Result<&PublicKey, ConfigError> {
        self.clients
            .get(&node)
            .map(|c| &c.key)
            .ok_or(ConfigError::NotInCommittee(node))
    }

    /// Every replica id except `node`.
    pub fn others(&self, node: NodeId) -> Vec<NodeId> {
        self.authorities
            .keys()
            .copied()
            .filter(|id| *id != node)
            .collect()
    }

    pub fn is_replica(&self, node: NodeId) -> bool {
        self.authorities.contains_key(&node)
    }

    pub fn is_client(&self, node: NodeId) -> bool {
        self.clients.contains_key(&node)
    }
}

impl Import for Committee {}
impl Export for Committee {}

/// Feature toggles, the explicit counterpart of the original build-time
/// switches.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Verify every threshold share carried by incoming certificates.
    /// When disabled, certificates are accepted on distinct-voter count
    /// alone (MAC-trust deployments).
    #[serde(default = "flag_on")]
    pub threshold_sigs: bool,
    /// Run the dedicated proposal task, allowing a leader to pipeline
    /// proposals ahead of the last decided batch.
    #[serde(default = "flag_on")]
    pub proposal_thread: bool,
    /// Arm per-instance view-change timers.
    #[serde(default = "flag_on")]
    pub view_changes: bool,
}

fn flag_on() -> bool {
    true
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            threshold_sigs: true,
            proposal_thread: true,
            view_changes: true,
        }
    }
}

/// Protocol parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Parameters {
    /// Client transactions per batch.
    #[serde(default = "Parameters::default_batch_size")]
    pub batch_size: u64,
    /// Executed batches between two checkpoints.
    #[serde(default = "Parameters::default_txn_per_checkpoint")]
    pub txn_per_checkpoint: u64,
    /// Number of concurrent consensus instances. `1` disables the
    /// parallel-primary mode.
    #[serde(default = "Parameters::default_instances")]
    pub instances: u64,
    /// View-change timeout in milliseconds.
    #[serde(default = "Parameters::default_view_timeout_ms")]
    pub view_timeout_ms: u64,
    /// How long a replica keeps serving after startup, in milliseconds.
    /// `0` means run until interrupted.
    #[serde(default)]
    pub done_timer_ms: u64,
    /// Bound of every internal work queue.
    #[serde(default = "Parameters::default_channel_capacity")]
    pub channel_capacity: usize,
    /// Batches ahead of the last stable checkpoint a replica is willing to
    /// keep in flight, expressed in checkpoint periods.
    #[serde(default = "Parameters::default_in_flight_periods")]
    pub in_flight_periods: u64,
    #[serde(default)]
    pub flags: FeatureFlags,
}

impl Parameters {
    fn default_batch_size() -> u64 {
        100
    }
    fn default_txn_per_checkpoint() -> u64 {
        100
    }
    fn default_instances() -> u64 {
        1
    }
    fn default_view_timeout_ms() -> u64 {
        2_000
    }
    fn default_channel_capacity() -> usize {
        1_000
    }
    fn default_in_flight_periods() -> u64 {
        4
    }

    /// Highest batch index accepted while `last_stable` is the latest
    /// stable checkpoint.
    pub fn in_flight_window(&self) -> u64 {
        self.in_flight_periods * self.txn_per_checkpoint
    }

    pub fn tracing(&self) {
        info!("Batch size set to {}", self.batch_size);
        info!("Checkpoint period set to {}", self.txn_per_checkpoint);
        info!("Consensus instances set to {}", self.instances);
        info!("View timeout set to {}ms", self.view_timeout_ms);
    }
}

impl Default for Parameters {
    fn default() -> Self {
        // Field defaults above are the source of truth.
        serde_yaml::from_str("{}").unwrap()
    }
}

impl Import for Parameters {}
impl Export for Parameters {}

/// Builds a committee with fresh keys on sequential localhost ports.
/// Returns the committee along with the replica and client keypairs.
pub fn committee_fixture(
    replicas: usize,
    clients: usize,
    base_port: u16,
) -> (Committee, Vec<KeyPair>, Vec<KeyPair>) {
    let mut seed = [0u8; 32];
    let replica_keys: Vec<KeyPair> = (0..replicas)
        .map(|i| {
            seed[0] = i as u8;
            seed[1] = 0xa5;
            KeyPair::from_seed(seed)
        })
        .collect();
    let client_keys: Vec<KeyPair> = (0..clients)
        .map(|i| {
            seed[0] = i as u8;
            seed[1] = 0x5a;
            KeyPair::from_seed(seed)
        })
        .collect();

    let authorities = replica_keys
        .iter()
        .enumerate()
        .map(|(i, kp)| {
            (
                i as NodeId,
                Authority {
                    protocol_key: kp.public(),
                    address: ([127, 0, 0, 1], base_port + i as u16).into(),
                },
            )
        })
        .collect();
    let clients = client_keys
        .iter()
        .enumerate()
        .map(|(i, kp)| {
            (
                (replicas + i) as NodeId,
                ClientAuthority {
                    key: kp.public(),
                    address: ([127, 0, 0, 1], base_port + (replicas + i) as u16).into(),
                },
            )
        })
        .collect();

    (
        Committee {
            authorities,
            clients,
        },
        replica_keys,
        client_keys,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_for_four_replicas() {
        let (committee, _, _) = committee_fixture(4, 1, 7000);
        assert_eq!(committee.size(), 4);
        assert_eq!(committee.min_faulty(), 1);
        assert_eq!(committee.quorum_threshold(), 3);
        assert_eq!(committee.validity_threshold(), 2);
    }

    #[test]
    fn leader_rotates_per_view_and_instance() {
        let (committee, _, _) = committee_fixture(4, 0, 7000);
        // Single instance: leader of view v is v mod n.
        assert_eq!(committee.leader(0, 0), 0);
        assert_eq!(committee.leader(0, 5), 1);
        // Parallel instances are offset by the instance id.
        assert_eq!(committee.leader(1, 0), 1);
        assert_eq!(committee.leader(2, 3), 1);
        assert_eq!(committee.leader(3, 2), 1);
    }

    #[test]
    fn single_node_committee_degenerates() {
        let (committee, _, _) = committee_fixture(1, 0, 7000);
        assert_eq!(committee.min_faulty(), 0);
        assert_eq!(committee.quorum_threshold(), 1);
        assert_eq!(committee.leader(0, 42), 0);
    }

    #[test]
    fn committee_roundtrips_through_yaml() {
        let (committee, _, _) = committee_fixture(4, 2, 7000);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("committee.yaml");
        committee.export(&path).unwrap();
        let restored = Committee::import(&path).unwrap();
        assert_eq!(restored.size(), 4);
        assert_eq!(restored.clients.len(), 2);
        assert_eq!(
            restored.protocol_key(2).unwrap(),
            committee.protocol_key(2).unwrap()
        );
    }

    #[test]
    fn parameters_defaults() {
        let params = Parameters::default();
        assert_eq!(params.batch_size, 100);
        assert_eq!(params.instances, 1);
        assert!(params.flags.view_changes);
        assert_eq!(params.in_flight_window(), 400);
    }
}
