// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The per-instance protocol worker. Every message of a consensus
//! instance is routed to the one worker owning it, which gives each
//! transaction manager a single writer without any further locking.

use crate::engine::{Effect, Outbound, ProposerCommand};
use crate::metrics::ConsensusMetrics;
use crate::safety;
use crate::state::EngineState;
use crate::timer::ViewTimer;
use crate::txn_manager::TxnManager;
use crypto::{Hash, KeyPair, NodeId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tracing::{debug, info, instrument, warn};
use types::{
    ensure, metered_channel::{Receiver, Sender},
    BatchRequest, ConditionalBroadcastReceiver, ConsensusError, ConsensusResult, ExecuteNotify,
    Message, NewView, PhaseCertificate, Proposal, QcKind, QuorumCertificate, Vote,
};

use crate::aggregators::NewViewAggregator;

#[cfg(test)]
#[path = "tests/worker_tests.rs"]
pub mod worker_tests;

pub struct Worker {
    node: NodeId,
    instance: u64,
    keypair: Arc<KeyPair>,
    state: Arc<EngineState>,

    /// The view this instance is at. Decides advance it by `n` (the
    /// leader keeps its slot), view changes by one (leadership rotates).
    view: u64,
    /// Batch hash voted for, per view and phase; enforces the at most one
    /// vote per (phase, view, instance) rule.
    voted: BTreeMap<(u64, u8), Hash>,
    /// NewView collection per target view.
    new_view_aggs: BTreeMap<u64, NewViewAggregator>,
    /// Batch hash decided per view; two conflicting decides are a local
    /// safety violation and abort the process.
    decided: BTreeMap<u64, Hash>,
    /// Proposed but not yet decided transaction ids.
    inflight: BTreeSet<u64>,
    timer: ViewTimer,

    rx_work: Receiver<(NodeId, Message)>,
    tx_output: Sender<Outbound>,
    tx_execute: Sender<ExecuteNotify>,
    tx_proposer: Sender<ProposerCommand>,
    rx_shutdown: ConditionalBroadcastReceiver,
    metrics: Arc<ConsensusMetrics>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn spawn(
        instance: u64,
        keypair: Arc<KeyPair>,
        state: Arc<EngineState>,
        rx_work: Receiver<(NodeId, Message)>,
        tx_output: Sender<Outbound>,
        tx_execute: Sender<ExecuteNotify>,
        tx_proposer: Sender<ProposerCommand>,
        rx_shutdown: ConditionalBroadcastReceiver,
        metrics: Arc<ConsensusMetrics>,
    ) -> JoinHandle<()> {
        let timeout = Duration::from_millis(state.parameters.view_timeout_ms);
        tokio::spawn(async move {
            Self {
                node: state.node_id,
                instance,
                keypair,
                state,
                view: 0,
                voted: BTreeMap::new(),
                new_view_aggs: BTreeMap::new(),
                decided: BTreeMap::new(),
                inflight: BTreeSet::new(),
                timer: ViewTimer::new(timeout),
                rx_work,
                tx_output,
                tx_execute,
                tx_proposer,
                rx_shutdown,
                metrics,
            }
            .run()
            .await;
        })
    }

    fn leader(&self, view: u64) -> NodeId {
        self.state.committee.leader(self.instance, view)
    }

    fn is_leader(&self, view: u64) -> bool {
        self.leader(view) == self.node
    }

    fn check_shares(&self) -> bool {
        self.state.parameters.flags.threshold_sigs
    }

    fn batch_size(&self) -> u64 {
        self.state.parameters.batch_size
    }

    /// Records a vote for `(view, phase)`. Returns false when this slot
    /// was already voted with a different hash (equivocation).
    fn record_vote(&mut self, view: u64, phase: QcKind, hash: Hash) -> Option<bool> {
        match self.voted.get(&(view, phase as u8)) {
            Some(prev) if *prev == hash => None,
            Some(_) => Some(false),
            None => {
                self.voted.insert((view, phase as u8), hash);
                Some(true)
            }
        }
    }

    // ---- proposal path ------------------------------------------------

    #[instrument(level = "debug", skip_all, fields(instance = self.instance, txn = proposal.txn_id, view = proposal.view))]
    fn handle_proposal(
        &mut self,
        src: NodeId,
        proposal: Proposal,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<()> {
        let expected = self.leader(proposal.view);
        ensure!(
            src == expected,
            ConsensusError::WrongLeader {
                received: src,
                expected,
                view: proposal.view,
            }
        );
        ensure!(
            proposal.batch.digest() == proposal.batch_hash,
            ConsensusError::WireFormat("proposal batch does not match its hash".into())
        );
        proposal
            .justify
            .verify(&self.state.committee, self.check_shares())?;

        let locked = self.state.locked_qc(self.instance);
        ensure!(
            safety::safe_node(&proposal.justify, &locked),
            ConsensusError::UnsafeProposal {
                view: proposal.view
            }
        );

        // One prepare vote per view; a conflicting proposal in a voted
        // view is leader equivocation.
        match self.record_vote(proposal.view, QcKind::Prepare, proposal.batch_hash) {
            None => return Ok(()), // duplicate delivery of the same proposal
            Some(false) => {
                return Err(ConsensusError::ConflictingVote {
                    voter: src,
                    view: proposal.view,
                })
            }
            Some(true) => {}
        }

        let txn_id = proposal.txn_id;
        let view = proposal.view;
        let justify = proposal.justify.clone();
        let own = src == self.node;

        let formed = {
            let mut tm = self.state.txn_table.get_or_create(txn_id, self.instance)?;
            if tm.phase_done(QcKind::Commit) || (tm.has_proposal() && tm.view >= view) {
                return Ok(());
            }
            tm.begin_view(proposal);
            self.state
                .index_batch(self.instance, tm.batch_hash, txn_id);
            if !justify.genesis {
                self.state.try_update_prepared(self.instance, &justify);
                self.state.record_qc(self.instance, &justify);
            }

            let vote = Vote::new(
                QcKind::Prepare,
                txn_id,
                self.instance,
                view,
                tm.batch_hash,
                self.node,
                &self.keypair,
            );
            self.metrics.votes_sent.with_label_values(&["prepare"]).inc();

            let mut formed = None;
            if own {
                // The leader's own share is the first vote.
                formed = tm
                    .aggregator(QcKind::Prepare)
                    .append(&vote, &self.state.committee)?;
            } else {
                effects.push(Effect::Send(Outbound::Unicast {
                    dest: expected,
                    message: Message::PrepareVote(vote),
                }));
            }
            formed.map(|skeleton| tm.complete_certificate(skeleton, self.batch_size()))
        };

        self.inflight.insert(txn_id);
        if self.state.parameters.flags.view_changes {
            self.timer.arm();
        }

        if let Some(qc) = formed {
            self.on_certificate_formed(txn_id, qc, effects)?;
        }

        // Early arrivals may already complete one or more phases.
        self.replay_buffers(txn_id, effects)?;
        Ok(())
    }

    /// Replays votes and certificates that arrived before the proposal.
    fn replay_buffers(&mut self, txn_id: u64, effects: &mut Vec<Effect>) -> ConsensusResult<()> {
        let (votes, certs) = match self.state.txn_table.get_mut(txn_id) {
            Some(mut tm) => tm.drain_buffers(),
            None => return Ok(()),
        };
        for vote in votes {
            if let Err(e) = self.handle_vote(vote.voter, vote, effects) {
                debug!("buffered vote dropped: {e}");
            }
        }
        for (kind, cert) in certs {
            let src = self.leader(cert.view);
            if let Err(e) = self.handle_phase_certificate(kind, src, cert, effects) {
                debug!("buffered certificate dropped: {e}");
            }
        }
        Ok(())
    }

    // ---- vote path (leader) -------------------------------------------

    #[instrument(level = "debug", skip_all, fields(instance = self.instance, txn = vote.txn_id, view = vote.view, phase = ?vote.phase))]
    fn handle_vote(
        &mut self,
        src: NodeId,
        vote: Vote,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<()> {
        ensure!(vote.voter == src, ConsensusError::UnknownSender(src));
        ensure!(
            self.is_leader(vote.view),
            ConsensusError::UnexpectedMessage("vote sent to a non-leader")
        );
        if self.check_shares() {
            vote.verify(&self.state.committee)?;
        } else {
            ensure!(
                self.state.committee.is_replica(src),
                ConsensusError::UnknownSender(src)
            );
        }

        let txn_id = vote.txn_id;
        let formed = {
            let mut tm = self
                .state
                .txn_table
                .get_or_create(txn_id, self.instance)?;
            if !tm.has_proposal() || tm.view < vote.view {
                // The matching proposal has not been processed yet.
                tm.buffered_votes.push(vote);
                return Ok(());
            }
            ensure!(
                tm.view == vote.view,
                ConsensusError::StaleView {
                    received: vote.view,
                    current: tm.view,
                }
            );
            match tm.aggregator(vote.phase).append(&vote, &self.state.committee) {
                Ok(Some(skeleton)) => {
                    Some(tm.complete_certificate(skeleton, self.batch_size()))
                }
                Ok(None) => None,
                Err(e @ ConsensusError::DuplicateVote { .. }) => {
                    // Idempotent: a retransmitted vote changes nothing.
                    debug!("{e}");
                    None
                }
                Err(e) => return Err(e),
            }
        };

        if let Some(qc) = formed {
            self.on_certificate_formed(txn_id, qc, effects)?;
        }
        Ok(())
    }

    /// A quorum certificate was just assembled from collected votes. The
    /// leader applies it locally, broadcasts it and contributes its own
    /// share to the next phase, which may cascade (it does when `f = 0`).
    fn on_certificate_formed(
        &mut self,
        txn_id: u64,
        qc: QuorumCertificate,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<()> {
        self.metrics
            .qcs_formed
            .with_label_values(&[qc.kind.as_str()])
            .inc();
        self.state.record_qc(self.instance, &qc);

        let view = qc.view;
        let hash = qc.batch_hash;
        let cert = PhaseCertificate {
            txn_id,
            instance: self.instance,
            view,
            qc: qc.clone(),
        };

        let next_phase = match qc.kind {
            QcKind::Prepare => {
                self.state.try_update_prepared(self.instance, &qc);
                {
                    let mut tm = self.expect_manager(txn_id)?;
                    tm.prepared = true;
                    tm.prepared_qc = Some(qc);
                }
                effects.push(Effect::Send(Outbound::Broadcast {
                    message: Message::PreCommit(cert),
                }));
                Some(QcKind::PreCommit)
            }
            QcKind::PreCommit => {
                // Forming the pre-committed certificate locks the batch.
                self.state.try_update_locked(self.instance, &qc);
                {
                    let mut tm = self.expect_manager(txn_id)?;
                    tm.precommitted = true;
                    tm.precommitted_qc = Some(qc);
                }
                effects.push(Effect::Send(Outbound::Broadcast {
                    message: Message::Commit(cert),
                }));
                Some(QcKind::Commit)
            }
            QcKind::Commit => {
                {
                    let mut tm = self.expect_manager(txn_id)?;
                    tm.committed = true;
                    tm.committed_qc = Some(qc);
                }
                self.metrics.committed_batches.inc();
                effects.push(Effect::Send(Outbound::Broadcast {
                    message: Message::Decide(cert),
                }));
                self.on_decided(txn_id, view, effects)?;
                None
            }
        };

        if let Some(phase) = next_phase {
            if self.record_vote(view, phase, hash) == Some(true) {
                let vote = Vote::new(
                    phase,
                    txn_id,
                    self.instance,
                    view,
                    hash,
                    self.node,
                    &self.keypair,
                );
                self.metrics
                    .votes_sent
                    .with_label_values(&[phase.as_str()])
                    .inc();
                let formed = {
                    let mut tm = self.expect_manager(txn_id)?;
                    match tm.aggregator(phase).append(&vote, &self.state.committee) {
                        Ok(maybe) => {
                            maybe.map(|s| tm.complete_certificate(s, self.batch_size()))
                        }
                        Err(e) => {
                            debug!("self vote not recorded: {e}");
                            None
                        }
                    }
                };
                if let Some(next_qc) = formed {
                    self.on_certificate_formed(txn_id, next_qc, effects)?;
                }
            }
        }
        Ok(())
    }

    // ---- certificate path (replica) -----------------------------------

    #[instrument(level = "debug", skip_all, fields(instance = self.instance, txn = cert.txn_id, view = cert.view, kind = ?kind))]
    fn handle_phase_certificate(
        &mut self,
        kind: QcKind,
        src: NodeId,
        cert: PhaseCertificate,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<()> {
        ensure!(
            cert.qc.kind == kind,
            ConsensusError::CertificateKindMismatch {
                expected: kind,
                got: cert.qc.kind,
            }
        );
        ensure!(
            !cert.qc.genesis && cert.qc.view == cert.view,
            ConsensusError::WireFormat("malformed phase certificate".into())
        );
        let expected = self.leader(cert.view);
        ensure!(
            src == expected || src == self.node,
            ConsensusError::WrongLeader {
                received: src,
                expected,
                view: cert.view,
            }
        );
        cert.qc.verify(&self.state.committee, self.check_shares())?;

        let txn_id = cert.txn_id;
        let qc = cert.qc.clone();
        {
            let mut tm = self
                .state
                .txn_table
                .get_or_create(txn_id, self.instance)?;
            if !tm.has_proposal() {
                // Certificate before proposal: hold it and fetch the batch.
                tm.buffered_certs.push((kind, cert));
                effects.push(Effect::Send(Outbound::Unicast {
                    dest: src,
                    message: Message::BatchRequest(BatchRequest {
                        instance: self.instance,
                        batch_hash: qc.batch_hash,
                        requester: self.node,
                    }),
                }));
                return Ok(());
            }
            // Decided batches never re-enter the vote pipeline; everything
            // else is deduplicated per (view, phase) by the vote record.
            if tm.phase_done(QcKind::Commit) {
                return Ok(());
            }
            ensure!(
                cert.view == tm.view,
                ConsensusError::StaleView {
                    received: cert.view,
                    current: tm.view,
                }
            );
        }

        self.state.record_qc(self.instance, &qc);
        let (reply_phase, done) = match kind {
            QcKind::Prepare => {
                self.state.try_update_prepared(self.instance, &qc);
                let mut tm = self.expect_manager(txn_id)?;
                tm.prepared = true;
                tm.prepared_qc = Some(qc.clone());
                (Some(QcKind::PreCommit), false)
            }
            QcKind::PreCommit => {
                // The lock step: safety hinges on taking the lock here.
                self.state.try_update_locked(self.instance, &qc);
                let mut tm = self.expect_manager(txn_id)?;
                tm.precommitted = true;
                tm.precommitted_qc = Some(qc.clone());
                (Some(QcKind::Commit), false)
            }
            QcKind::Commit => {
                let mut tm = self.expect_manager(txn_id)?;
                tm.committed = true;
                tm.committed_qc = Some(qc.clone());
                (None, true)
            }
        };

        if let Some(phase) = reply_phase {
            if self.record_vote(cert.view, phase, qc.batch_hash) == Some(true) {
                let vote = Vote::new(
                    phase,
                    txn_id,
                    self.instance,
                    cert.view,
                    qc.batch_hash,
                    self.node,
                    &self.keypair,
                );
                self.metrics
                    .votes_sent
                    .with_label_values(&[phase.as_str()])
                    .inc();
                effects.push(Effect::Send(Outbound::Unicast {
                    dest: expected,
                    message: match phase {
                        QcKind::PreCommit => Message::PreCommitVote(vote),
                        QcKind::Commit => Message::CommitVote(vote),
                        QcKind::Prepare => unreachable!("prepare votes answer proposals"),
                    },
                }));
            }
            // Valid progress: restart the countdown.
            if self.state.parameters.flags.view_changes {
                self.timer.arm();
            }
        }
        if done {
            self.metrics.committed_batches.inc();
            self.on_decided(txn_id, cert.view, effects)?;
        }
        Ok(())
    }

    /// A batch decided at `view`. Hand it to the execute stage, advance
    /// the instance view (the leader keeps its slot modulo `n`) and let
    /// the proposer know.
    fn on_decided(
        &mut self,
        txn_id: u64,
        view: u64,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<()> {
        let (hash, notify) = {
            let mut tm = self.expect_manager(txn_id)?;
            tm.new_viewed = false;
            let notify = tm.proposal.as_ref().map(|p| ExecuteNotify {
                txn_id,
                instance: self.instance,
                view,
                batch: p.batch.clone(),
            });
            (tm.batch_hash, notify)
        };
        if let Some(previous) = self.decided.insert(view, hash) {
            // Two distinct valid committed certificates for one view is a
            // safety bug, not a network condition.
            assert_eq!(
                previous, hash,
                "safety violation: conflicting decides at view {view} of instance {}",
                self.instance
            );
        }
        match notify {
            Some(notify) => effects.push(Effect::Execute(notify)),
            None => warn!("decided batch {txn_id} has no proposal body"),
        }

        self.inflight.remove(&txn_id);
        let n = self.state.committee.size() as u64;
        let next = view + n;
        if next > self.view {
            self.view = next;
            self.state.advance_view(self.instance, next);
        }
        effects.push(Effect::Proposer(ProposerCommand::Decided {
            instance: self.instance,
        }));
        effects.push(Effect::Proposer(ProposerCommand::ViewReady {
            instance: self.instance,
            view: self.view,
        }));

        if self.inflight.is_empty() {
            self.timer.disarm();
        } else if self.state.parameters.flags.view_changes {
            self.timer.arm();
        }

        // Bounded memory: votes for long-decided views can go.
        let horizon = self
            .view
            .saturating_sub(n * self.state.parameters.in_flight_window());
        self.voted.retain(|(view, _), _| *view >= horizon);
        self.new_view_aggs.retain(|view, _| *view >= horizon);
        self.decided.retain(|view, _| *view >= horizon);
        Ok(())
    }

    // ---- view change ---------------------------------------------------

    #[instrument(level = "info", skip_all, fields(instance = self.instance, view = self.view))]
    fn on_view_timeout(&mut self, effects: &mut Vec<Effect>) -> ConsensusResult<()> {
        let failed = self.leader(self.view);
        self.state.stopped_nodes.insert(failed);
        self.metrics.view_changes.inc();
        info!(
            "view {} of instance {} expired, leader {} deemed failed",
            self.view, self.instance, failed
        );

        // Rotate to the next leader, skipping replicas already deemed
        // failed.
        let n = self.state.committee.size() as u64;
        let mut next = self.view + 1;
        let mut tried = 0;
        while tried < n && self.state.stopped_nodes.contains(&self.leader(next)) {
            next += 1;
            tried += 1;
        }
        self.view = next;
        self.state.advance_view(self.instance, next);

        let message = NewView {
            instance: self.instance,
            new_view: next,
            voter: self.node,
            high_qc: self.state.prepared_qc(self.instance),
        };
        // Force-broadcast: every replica learns the timeout, not only the
        // incoming leader, so views re-align quickly.
        effects.push(Effect::Send(Outbound::Broadcast {
            message: Message::NewView(message.clone()),
        }));
        self.append_new_view(self.node, message, effects)?;

        self.timer.arm();
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(instance = self.instance, new_view = message.new_view))]
    fn handle_new_view(
        &mut self,
        src: NodeId,
        message: NewView,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<()> {
        ensure!(message.voter == src, ConsensusError::UnknownSender(src));
        ensure!(
            message.new_view >= self.view,
            ConsensusError::StaleView {
                received: message.new_view,
                current: self.view,
            }
        );
        message
            .high_qc
            .verify(&self.state.committee, self.check_shares())?;
        self.append_new_view(src, message, effects)
    }

    fn append_new_view(
        &mut self,
        src: NodeId,
        message: NewView,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<()> {
        let target = message.new_view;
        let agg = self
            .new_view_aggs
            .entry(target)
            .or_insert_with(|| NewViewAggregator::new(target));
        let quorum = match agg.append(src, &message, &self.state.committee) {
            Ok(maybe) => maybe,
            Err(e @ ConsensusError::DuplicateVote { .. }) => {
                debug!("{e}");
                None
            }
            Err(e) => return Err(e),
        };
        if let Some(best) = quorum {
            self.on_new_view_quorum(target, best, effects)?;
        }
        Ok(())
    }

    /// `2f + 1` replicas agreed to move to `view`. Adopt the highest
    /// justify certificate among them; the new leader re-proposes the
    /// undecided tip or starts fresh.
    fn on_new_view_quorum(
        &mut self,
        view: u64,
        best: QuorumCertificate,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<()> {
        if view > self.view {
            self.view = view;
            self.state.advance_view(self.instance, view);
        }
        if !best.genesis {
            self.state.try_update_prepared(self.instance, &best);
            self.state.record_qc(self.instance, &best);
        }
        self.new_view_aggs.retain(|v, _| *v > view);

        if !self.is_leader(view) {
            if self.state.parameters.flags.view_changes {
                self.timer.arm();
            }
            return Ok(());
        }

        let n = self.state.committee.size() as u64;
        let reproposal = if best.genesis {
            None
        } else {
            self.state
                .txn_for_hash(self.instance, &best.batch_hash)
                .and_then(|txn_id| {
                    let tm = self.state.txn_table.get_mut(txn_id)?;
                    if tm.phase_done(QcKind::Commit) {
                        None
                    } else {
                        tm.proposal.clone()
                    }
                })
        };

        match reproposal {
            Some(mut proposal) => {
                info!(
                    "instance {} leader of view {view} re-proposes batch {}",
                    self.instance, proposal.txn_id
                );
                proposal.view = view;
                proposal.justify = best;
                self.metrics.proposals_made.inc();
                effects.push(Effect::Send(Outbound::Broadcast {
                    message: Message::Proposal(proposal.clone()),
                }));
                effects.push(Effect::Proposer(ProposerCommand::Reset {
                    instance: self.instance,
                    next_view: view + n,
                    inflight: 1,
                }));
                self.handle_proposal(self.node, proposal, effects)?;
            }
            None => {
                effects.push(Effect::Proposer(ProposerCommand::Reset {
                    instance: self.instance,
                    next_view: view,
                    inflight: 0,
                }));
            }
        }
        Ok(())
    }

    // ---- batch recovery ------------------------------------------------

    fn handle_batch_request(
        &mut self,
        request: BatchRequest,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<()> {
        let proposal = self
            .state
            .txn_for_hash(self.instance, &request.batch_hash)
            .and_then(|txn_id| {
                self.state
                    .txn_table
                    .get_mut(txn_id)
                    .and_then(|tm| tm.proposal.clone())
            });
        if let Some(proposal) = proposal {
            effects.push(Effect::Send(Outbound::Unicast {
                dest: request.requester,
                message: Message::Proposal(proposal),
            }));
        }
        Ok(())
    }

    // ---- plumbing -------------------------------------------------------

    fn expect_manager(
        &self,
        txn_id: u64,
    ) -> ConsensusResult<dashmap::mapref::one::RefMut<'_, u64, TxnManager>> {
        self.state
            .txn_table
            .get_mut(txn_id)
            .ok_or(ConsensusError::TooOld {
                txn_id,
                last_deleted: self.state.txn_table.last_deleted(),
            })
    }

    fn handle_message(
        &mut self,
        src: NodeId,
        message: Message,
        effects: &mut Vec<Effect>,
    ) -> ConsensusResult<()> {
        match message {
            Message::Proposal(p) => self.handle_proposal(src, p, effects),
            Message::PrepareVote(v) | Message::PreCommitVote(v) | Message::CommitVote(v) => {
                self.handle_vote(src, v, effects)
            }
            Message::PreCommit(c) => {
                self.handle_phase_certificate(QcKind::Prepare, src, c, effects)
            }
            Message::Commit(c) => {
                self.handle_phase_certificate(QcKind::PreCommit, src, c, effects)
            }
            Message::Decide(c) => self.handle_phase_certificate(QcKind::Commit, src, c, effects),
            Message::NewView(nv) => self.handle_new_view(src, nv, effects),
            Message::BatchRequest(r) => self.handle_batch_request(r, effects),
            other => Err(ConsensusError::UnexpectedMessage(other.kind())),
        }
    }

    async fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            let closed = match effect {
                Effect::Send(outbound) => self.tx_output.send(outbound).await.is_err(),
                Effect::Execute(notify) => self.tx_execute.send(notify).await.is_err(),
                Effect::Proposer(command) => self.tx_proposer.send(command).await.is_err(),
            };
            if closed {
                debug!("downstream channel closed, node is shutting down");
                return;
            }
        }
    }

    /// Logs worker errors as appropriate and counts drops.
    fn process_result(&self, result: &ConsensusResult<()>) {
        match result {
            Ok(()) => (),
            Err(e) => {
                self.metrics
                    .dropped_messages
                    .with_label_values(&[e.kind()])
                    .inc();
                match e {
                    ConsensusError::ShuttingDown
                    | ConsensusError::TooOld { .. }
                    | ConsensusError::StaleView { .. }
                    | ConsensusError::DuplicateVote { .. } => debug!("{e}"),
                    e => warn!("{e}"),
                }
            }
        }
        self.metrics
            .txn_table_size
            .set(self.state.txn_table.len() as i64);
    }

    // Main loop listening to routed messages and the view timer.
    pub async fn run(mut self) {
        info!(
            "Worker for instance {} on node {} has started successfully.",
            self.instance, self.node
        );
        loop {
            let mut effects = Vec::new();
            let deadline = self.timer.deadline();
            let result = tokio::select! {
                Some((src, message)) = self.rx_work.recv() => {
                    self.handle_message(src, message, &mut effects)
                },

                () = sleep_until(deadline), if self.timer.is_armed() => {
                    if self.state.parameters.flags.view_changes {
                        self.on_view_timeout(&mut effects)
                    } else {
                        self.timer.disarm();
                        Ok(())
                    }
                },

                _ = self.rx_shutdown.receiver.recv() => {
                    return;
                }
            };
            self.apply_effects(effects).await;
            self.process_result(&result);
        }
    }
}
