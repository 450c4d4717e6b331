// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Vote accumulation. Each aggregator dedups contributors, enforces the
//! one-vote-per-phase-and-view rule and emits its certificate exactly once
//! when the quorum threshold is reached.

use config::Committee;
use crypto::{Hash, NodeId, SignatureShare};
use std::collections::BTreeMap;
use types::{
    ensure, ConsensusError, ConsensusResult, NewView, QcKind, QuorumCertificate, Vote,
};

/// Collects one phase's votes for one batch at one view.
pub struct VotesAggregator {
    phase: QcKind,
    view: u64,
    batch_hash: Hash,
    shares: BTreeMap<NodeId, SignatureShare>,
    used: bool,
}

impl VotesAggregator {
    pub fn new(phase: QcKind, view: u64, batch_hash: Hash) -> Self {
        Self {
            phase,
            view,
            batch_hash,
            shares: BTreeMap::new(),
            used: false,
        }
    }

    pub fn phase(&self) -> QcKind {
        self.phase
    }

    pub fn view(&self) -> u64 {
        self.view
    }

    pub fn votes(&self) -> usize {
        self.shares.len()
    }

    /// Adds a vote and returns the certificate skeleton once `2f + 1`
    /// distinct voters contributed. Parent linkage and height are filled
    /// by the caller, which owns the batch context.
    pub fn append(&mut self, vote: &Vote, committee: &Committee) -> ConsensusResult<Option<QuorumCertificate>> {
        ensure!(
            vote.phase == self.phase,
            ConsensusError::CertificateKindMismatch {
                expected: self.phase,
                got: vote.phase,
            }
        );
        ensure!(
            vote.view == self.view,
            ConsensusError::StaleView {
                received: vote.view,
                current: self.view,
            }
        );
        ensure!(
            vote.batch_hash == self.batch_hash,
            ConsensusError::ConflictingVote {
                voter: vote.voter,
                view: vote.view,
            }
        );
        ensure!(
            self.shares.insert(vote.voter, vote.share).is_none(),
            ConsensusError::DuplicateVote {
                voter: vote.voter,
                view: vote.view,
            }
        );

        if !self.used && self.shares.len() as u64 >= committee.quorum_threshold() {
            self.used = true;
            return Ok(Some(QuorumCertificate {
                kind: self.phase,
                genesis: false,
                view: self.view,
                parent_view: 0,
                height: 0,
                batch_hash: self.batch_hash,
                parent_hash: Hash::default(),
                grand: None,
                shares: self.shares.clone(),
            }));
        }
        Ok(None)
    }
}

/// Collects `NewView` messages for one (instance, view) and remembers the
/// highest-view justify certificate among them.
pub struct NewViewAggregator {
    view: u64,
    voters: Vec<NodeId>,
    best: QuorumCertificate,
    used: bool,
}

impl NewViewAggregator {
    pub fn new(view: u64) -> Self {
        Self {
            view,
            voters: Vec::new(),
            best: QuorumCertificate::genesis(),
            used: false,
        }
    }

    /// Returns the highest certificate carried by a quorum of NewViews,
    /// exactly once.
    pub fn append(
        &mut self,
        voter: NodeId,
        message: &NewView,
        committee: &Committee,
    ) -> ConsensusResult<Option<QuorumCertificate>> {
        ensure!(
            message.new_view == self.view,
            ConsensusError::StaleView {
                received: message.new_view,
                current: self.view,
            }
        );
        ensure!(
            !self.voters.contains(&voter),
            ConsensusError::DuplicateVote {
                voter,
                view: self.view,
            }
        );
        self.voters.push(voter);
        if crate::safety::fresher(&message.high_qc, &self.best) {
            self.best = message.high_qc.clone();
        }
        if !self.used && self.voters.len() as u64 >= committee.quorum_threshold() {
            self.used = true;
            return Ok(Some(self.best.clone()));
        }
        Ok(None)
    }
}

/// Collects checkpoint notices for one batch index. A checkpoint becomes
/// stable when `2f + 1` replicas agree on the same state digest.
pub struct CheckpointAggregator {
    index: u64,
    votes: BTreeMap<Hash, Vec<NodeId>>,
    stable: bool,
}

impl CheckpointAggregator {
    pub fn new(index: u64) -> Self {
        Self {
            index,
            votes: BTreeMap::new(),
            stable: false,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn is_stable(&self) -> bool {
        self.stable
    }

    /// Returns true exactly once, when the digest gathers a quorum.
    pub fn append(
        &mut self,
        node: NodeId,
        digest: Hash,
        committee: &Committee,
    ) -> ConsensusResult<bool> {
        let voters = self.votes.entry(digest).or_default();
        ensure!(
            !voters.contains(&node),
            ConsensusError::DuplicateVote {
                voter: node,
                view: self.index,
            }
        );
        voters.push(node);
        if !self.stable && voters.len() as u64 >= committee.quorum_threshold() {
            self.stable = true;
            return Ok(true);
        }
        Ok(false)
    }
}
