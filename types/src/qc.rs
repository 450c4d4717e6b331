// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{ConsensusError, ConsensusResult};
use config::Committee;
use crypto::{Hash, KeyPair, NodeId, SignatureShare};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The phase a certificate or vote belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QcKind {
    Prepare,
    PreCommit,
    Commit,
}

impl QcKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QcKind::Prepare => "prepare",
            QcKind::PreCommit => "precommit",
            QcKind::Commit => "commit",
        }
    }
}

/// An aggregate of `2f + 1` matching votes certifying one phase of one
/// batch. The wire layout is the serde derivation under bincode's fixint
/// little-endian encoding: tag, genesis flag, the three view fields, the
/// two length-prefixed hashes, the optional grand-parent pair and the
/// length-prefixed `node id -> share` map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    pub kind: QcKind,
    /// Marks the bootstrap certificate every instance starts from.
    pub genesis: bool,
    pub view: u64,
    pub parent_view: u64,
    /// Global batch index this certificate refers to.
    pub height: u64,
    pub batch_hash: Hash,
    pub parent_hash: Hash,
    /// View and hash of the grand-parent batch, absent near genesis.
    pub grand: Option<(u64, Hash)>,
    pub shares: BTreeMap<NodeId, SignatureShare>,
}

impl QuorumCertificate {
    /// The certificate every instance is bootstrapped with.
    pub fn genesis() -> Self {
        Self {
            kind: QcKind::Prepare,
            genesis: true,
            view: 0,
            parent_view: 0,
            height: 0,
            batch_hash: Hash::default(),
            parent_hash: Hash::default(),
            grand: None,
            shares: BTreeMap::new(),
        }
    }

    /// Canonical bytes a phase vote signs: `(kind, view, batch_hash)`.
    pub fn signing_bytes(kind: QcKind, view: u64, batch_hash: &Hash) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + 8 + crypto::DIGEST_LENGTH);
        bytes.push(kind as u8);
        bytes.extend_from_slice(&view.to_le_bytes());
        bytes.extend_from_slice(batch_hash.as_bytes());
        bytes
    }

    pub fn own_signing_bytes(&self) -> Vec<u8> {
        Self::signing_bytes(self.kind, self.view, &self.batch_hash)
    }

    /// A certificate is valid iff it carries at least `2f + 1` distinct
    /// shares from committee members, each verifying over the canonical
    /// bytes. Share verification can be skipped in MAC-trust deployments;
    /// the distinct-voter count always applies. The genesis certificate
    /// is valid by construction.
    pub fn verify(&self, committee: &Committee, check_shares: bool) -> ConsensusResult<()> {
        if self.genesis {
            return Ok(());
        }
        ensure!(
            self.shares.len() as u64 >= committee.quorum_threshold(),
            ConsensusError::CertificateTooWeak {
                got: self.shares.len(),
                need: committee.quorum_threshold(),
            }
        );
        let bytes = self.own_signing_bytes();
        for (node, share) in &self.shares {
            let key = committee
                .protocol_key(*node)
                .map_err(|_| ConsensusError::UnknownSender(*node))?;
            if check_shares {
                key.verify_share(&bytes, share)
                    .map_err(|_| ConsensusError::InvalidShare(*node))?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for QuorumCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.genesis {
            write!(f, "QC({}, genesis)", self.kind.as_str())
        } else {
            write!(
                f,
                "QC({}, v{}, {})",
                self.kind.as_str(),
                self.view,
                self.batch_hash
            )
        }
    }
}

/// A single replica's vote for one phase of one batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub phase: QcKind,
    pub txn_id: u64,
    pub instance: u64,
    pub view: u64,
    pub batch_hash: Hash,
    pub voter: NodeId,
    pub share: SignatureShare,
}

impl Vote {
    pub fn new(
        phase: QcKind,
        txn_id: u64,
        instance: u64,
        view: u64,
        batch_hash: Hash,
        voter: NodeId,
        keypair: &KeyPair,
    ) -> Self {
        let share = keypair.share_sign(&QuorumCertificate::signing_bytes(phase, view, &batch_hash));
        Self {
            phase,
            txn_id,
            instance,
            view,
            batch_hash,
            voter,
            share,
        }
    }

    /// Checks the embedded share against the voter's committee key.
    pub fn verify(&self, committee: &Committee) -> ConsensusResult<()> {
        let key = committee
            .protocol_key(self.voter)
            .map_err(|_| ConsensusError::UnknownSender(self.voter))?;
        let bytes = QuorumCertificate::signing_bytes(self.phase, self.view, &self.batch_hash);
        key.verify_share(&bytes, &self.share)
            .map_err(|_| ConsensusError::InvalidShare(self.voter))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::committee_fixture;

    fn certified(kind: QcKind, view: u64, keys: &[KeyPair], signers: usize) -> QuorumCertificate {
        let batch_hash = Hash::digest(b"batch");
        let bytes = QuorumCertificate::signing_bytes(kind, view, &batch_hash);
        QuorumCertificate {
            kind,
            genesis: false,
            view,
            parent_view: 0,
            height: 1,
            batch_hash,
            parent_hash: Hash::default(),
            grand: None,
            shares: keys
                .iter()
                .take(signers)
                .enumerate()
                .map(|(i, kp)| (i as NodeId, kp.share_sign(&bytes)))
                .collect(),
        }
    }

    #[test]
    fn genesis_always_verifies() {
        let (committee, _, _) = committee_fixture(4, 0, 7100);
        assert!(QuorumCertificate::genesis()
            .verify(&committee, true)
            .is_ok());
    }

    #[test]
    fn quorum_of_shares_verifies() {
        let (committee, keys, _) = committee_fixture(4, 0, 7100);
        let qc = certified(QcKind::Prepare, 3, &keys, 3);
        assert!(qc.verify(&committee, true).is_ok());
    }

    #[test]
    fn too_few_shares_rejected() {
        let (committee, keys, _) = committee_fixture(4, 0, 7100);
        let qc = certified(QcKind::Prepare, 3, &keys, 2);
        assert_eq!(
            qc.verify(&committee, true),
            Err(ConsensusError::CertificateTooWeak { got: 2, need: 3 })
        );
    }

    #[test]
    fn tampered_share_rejected_only_when_checked() {
        let (committee, keys, _) = committee_fixture(4, 0, 7100);
        let mut qc = certified(QcKind::Commit, 2, &keys, 3);
        // Replace node 0's share with a share over different bytes.
        let bogus = keys[0].share_sign(b"unrelated");
        qc.shares.insert(0, bogus);
        assert_eq!(
            qc.verify(&committee, true),
            Err(ConsensusError::InvalidShare(0))
        );
        // MAC-trust mode only counts distinct voters.
        assert!(qc.verify(&committee, false).is_ok());
    }

    #[test]
    fn serialization_is_byte_stable() {
        let (_, keys, _) = committee_fixture(4, 0, 7100);
        let qc = certified(QcKind::PreCommit, 7, &keys, 3);
        let bytes = bincode::serialize(&qc).unwrap();
        let restored: QuorumCertificate = bincode::deserialize(&bytes).unwrap();
        let bytes_again = bincode::serialize(&restored).unwrap();
        assert_eq!(bytes, bytes_again);
        assert_eq!(qc, restored);
    }

    #[test]
    fn vote_share_matches_certificate_bytes() {
        let (committee, keys, _) = committee_fixture(4, 0, 7100);
        let hash = Hash::digest(b"batch");
        let vote = Vote::new(QcKind::Prepare, 99, 0, 4, hash, 1, &keys[1]);
        assert!(vote.verify(&committee).is_ok());

        let mut forged = vote.clone();
        forged.voter = 2;
        assert_eq!(
            forged.verify(&committee),
            Err(ConsensusError::InvalidShare(2))
        );
    }
}
