// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-batch protocol state. A manager exists from the first sighting of a
//! batch id (proposal or early vote) until a stable checkpoint garbage
//! collects it. Phase flags are monotonic: once set they are never
//! cleared.

use crate::aggregators::VotesAggregator;
use crypto::Hash;
use types::{PhaseCertificate, Proposal, QcKind, QuorumCertificate, Vote};

pub struct TxnManager {
    /// Global id of the last transaction in the batch; the batch index is
    /// `txn_id / batch_size`.
    pub txn_id: u64,
    pub instance: u64,
    /// View of the latest proposal slot for this batch.
    pub view: u64,
    pub batch_hash: Hash,
    pub parent_hash: Hash,

    pub prepared: bool,
    pub precommitted: bool,
    pub committed: bool,
    pub executed: bool,
    pub new_viewed: bool,

    pub prepare_votes: VotesAggregator,
    pub precommit_votes: VotesAggregator,
    pub commit_votes: VotesAggregator,

    pub prepared_qc: Option<QuorumCertificate>,
    pub precommitted_qc: Option<QuorumCertificate>,
    pub committed_qc: Option<QuorumCertificate>,

    /// Votes that arrived before the proposal, drained once it lands.
    pub buffered_votes: Vec<Vote>,
    /// Phase certificates that arrived before the proposal.
    pub buffered_certs: Vec<(QcKind, PhaseCertificate)>,

    /// The original proposal, kept for re-broadcast after a view change
    /// and for serving batch requests.
    pub proposal: Option<Proposal>,
}

impl TxnManager {
    pub fn new(txn_id: u64, instance: u64) -> Self {
        Self {
            txn_id,
            instance,
            view: 0,
            batch_hash: Hash::default(),
            parent_hash: Hash::default(),
            prepared: false,
            precommitted: false,
            committed: false,
            executed: false,
            new_viewed: false,
            prepare_votes: VotesAggregator::new(QcKind::Prepare, 0, Hash::default()),
            precommit_votes: VotesAggregator::new(QcKind::PreCommit, 0, Hash::default()),
            commit_votes: VotesAggregator::new(QcKind::Commit, 0, Hash::default()),
            prepared_qc: None,
            precommitted_qc: None,
            committed_qc: None,
            buffered_votes: Vec::new(),
            buffered_certs: Vec::new(),
            proposal: None,
        }
    }

    pub fn has_proposal(&self) -> bool {
        self.proposal.is_some()
    }

    /// Binds the manager to a proposal slot. Vote aggregation restarts at
    /// the new view; phase flags survive, they only ever move forward.
    pub fn begin_view(&mut self, proposal: Proposal) {
        self.view = proposal.view;
        self.batch_hash = proposal.batch_hash;
        self.parent_hash = proposal.justify.batch_hash;
        self.prepare_votes = VotesAggregator::new(QcKind::Prepare, proposal.view, proposal.batch_hash);
        self.precommit_votes =
            VotesAggregator::new(QcKind::PreCommit, proposal.view, proposal.batch_hash);
        self.commit_votes = VotesAggregator::new(QcKind::Commit, proposal.view, proposal.batch_hash);
        self.proposal = Some(proposal);
    }

    /// The aggregator collecting `phase` votes.
    pub fn aggregator(&mut self, phase: QcKind) -> &mut VotesAggregator {
        match phase {
            QcKind::Prepare => &mut self.prepare_votes,
            QcKind::PreCommit => &mut self.precommit_votes,
            QcKind::Commit => &mut self.commit_votes,
        }
    }

    /// Whether the phase a certificate of `kind` closes has already been
    /// applied to this manager.
    pub fn phase_done(&self, kind: QcKind) -> bool {
        match kind {
            QcKind::Prepare => self.prepared,
            QcKind::PreCommit => self.precommitted,
            QcKind::Commit => self.committed,
        }
    }

    /// Completes a certificate skeleton emitted by an aggregator with this
    /// batch's lineage: height, parent and grand-parent linkage.
    pub fn complete_certificate(&self, mut qc: QuorumCertificate, batch_size: u64) -> QuorumCertificate {
        qc.height = self.txn_id / batch_size;
        if let Some(proposal) = &self.proposal {
            let justify = &proposal.justify;
            qc.parent_view = justify.view;
            qc.parent_hash = justify.batch_hash;
            qc.grand = if justify.genesis {
                None
            } else {
                Some((justify.parent_view, justify.parent_hash))
            };
        }
        qc
    }

    /// Takes every buffered early arrival for replay against the freshly
    /// bound proposal.
    pub fn drain_buffers(&mut self) -> (Vec<Vote>, Vec<(QcKind, PhaseCertificate)>) {
        (
            std::mem::take(&mut self.buffered_votes),
            std::mem::take(&mut self.buffered_certs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::committee_fixture;

    fn proposal(view: u64, hash_tag: &[u8]) -> Proposal {
        let batch = types::ClientBatch {
            client: 4,
            requests: vec![types::Request {
                client: 4,
                seq: 0,
                payload: hash_tag.to_vec(),
            }],
        };
        Proposal {
            txn_id: 0,
            instance: 0,
            view,
            batch_hash: batch.digest(),
            justify: QuorumCertificate::genesis(),
            batch,
        }
    }

    #[test]
    fn early_votes_buffer_until_proposal_arrives() {
        let (committee, keys, _) = committee_fixture(4, 0, 7400);
        let mut tm = TxnManager::new(0, 0);
        let prop = proposal(0, b"batch");
        let hash = prop.batch_hash;

        // Two votes arrive before the proposal.
        for (i, kp) in keys.iter().take(2).enumerate() {
            tm.buffered_votes.push(Vote::new(
                QcKind::Prepare,
                0,
                0,
                0,
                hash,
                i as crypto::NodeId,
                kp,
            ));
        }
        assert!(!tm.has_proposal());

        tm.begin_view(prop);
        let (votes, certs) = tm.drain_buffers();
        assert_eq!(votes.len(), 2);
        assert!(certs.is_empty());

        // Replaying the drained votes plus one live vote reaches quorum.
        let mut formed = None;
        for vote in votes {
            formed = tm.aggregator(QcKind::Prepare).append(&vote, &committee).unwrap();
        }
        assert!(formed.is_none());
        let last = Vote::new(QcKind::Prepare, 0, 0, 0, hash, 2, &keys[2]);
        let qc = tm
            .aggregator(QcKind::Prepare)
            .append(&last, &committee)
            .unwrap();
        assert!(qc.is_some());
    }

    #[test]
    fn certificate_completion_links_parents() {
        let mut tm = TxnManager::new(399, 0);
        let mut prop = proposal(8, b"child");
        prop.txn_id = 399;
        let parent_hash = Hash::digest(b"parent");
        prop.justify = QuorumCertificate {
            kind: QcKind::Prepare,
            genesis: false,
            view: 4,
            parent_view: 0,
            height: 2,
            batch_hash: parent_hash,
            parent_hash: Hash::digest(b"grand"),
            grand: None,
            shares: Default::default(),
        };
        tm.begin_view(prop);

        let skeleton = QuorumCertificate {
            kind: QcKind::Prepare,
            genesis: false,
            view: 8,
            parent_view: 0,
            height: 0,
            batch_hash: tm.batch_hash,
            parent_hash: Hash::default(),
            grand: None,
            shares: Default::default(),
        };
        let qc = tm.complete_certificate(skeleton, 100);
        assert_eq!(qc.height, 3);
        assert_eq!(qc.parent_view, 4);
        assert_eq!(qc.parent_hash, parent_hash);
        assert_eq!(qc.grand, Some((0, Hash::digest(b"grand"))));
    }

    #[test]
    fn rebinding_to_a_later_view_resets_aggregation() {
        let (committee, keys, _) = committee_fixture(4, 0, 7400);
        let mut tm = TxnManager::new(0, 0);
        let prop = proposal(0, b"batch");
        let hash = prop.batch_hash;
        tm.begin_view(prop.clone());

        tm.aggregator(QcKind::Prepare)
            .append(&Vote::new(QcKind::Prepare, 0, 0, 0, hash, 1, &keys[1]), &committee)
            .unwrap();
        assert_eq!(tm.prepare_votes.votes(), 1);

        // Same batch re-proposed at view 1 after a view change.
        let mut reprop = prop;
        reprop.view = 1;
        tm.begin_view(reprop);
        assert_eq!(tm.prepare_votes.votes(), 0);
        assert_eq!(tm.view, 1);

        // Votes from the old view no longer count.
        let stale = Vote::new(QcKind::Prepare, 0, 0, 0, hash, 2, &keys[2]);
        assert!(tm
            .aggregator(QcKind::Prepare)
            .append(&stale, &committee)
            .is_err());
    }
}
