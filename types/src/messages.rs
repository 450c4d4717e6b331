// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{ConsensusError, ConsensusResult};
use crate::qc::{QuorumCertificate, Vote};
use bytes::Bytes;
use config::Committee;
use crypto::{Hash, KeyPair, NodeId, PublicKey, Signature};
use serde::{Deserialize, Serialize};

/// One client operation. The payload is opaque to consensus; the execution
/// layer interprets it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub client: NodeId,
    pub seq: u64,
    pub payload: Vec<u8>,
}

/// `batch_size` requests packed by one client, the atomic unit of
/// consensus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientBatch {
    pub client: NodeId,
    pub requests: Vec<Request>,
}

impl ClientBatch {
    /// The canonical batch identity: SHA-256 over the serialized requests.
    pub fn digest(&self) -> Hash {
        let bytes = bincode::serialize(&self.requests).expect("serializing requests cannot fail");
        Hash::digest(&bytes)
    }
}

/// Sent back to the owning client once a batch has executed. Clients
/// accept a result after `f + 1` responses agreeing on
/// `(txn_id, result_digest)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub txn_id: u64,
    pub instance: u64,
    pub view: u64,
    pub node: NodeId,
    pub result_digest: Hash,
}

/// Leader broadcast opening the prepare phase for one batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    /// Global id of the last transaction in the batch; the batch index is
    /// `txn_id / batch_size`.
    pub txn_id: u64,
    pub instance: u64,
    pub view: u64,
    pub batch_hash: Hash,
    /// The highest prepared certificate known to the leader, justifying
    /// this extension.
    pub justify: QuorumCertificate,
    pub batch: ClientBatch,
}

/// Leader broadcast carrying the certificate that closes a phase:
/// `PreCommit` carries the prepared QC, `Commit` the pre-committed QC and
/// `Decide` the committed QC.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseCertificate {
    pub txn_id: u64,
    pub instance: u64,
    pub view: u64,
    pub qc: QuorumCertificate,
}

/// Announces a view change, carrying the sender's highest valid QC for the
/// instance so the new leader can extend from it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewView {
    pub instance: u64,
    pub new_view: u64,
    pub voter: NodeId,
    pub high_qc: QuorumCertificate,
}

/// Periodic stable-state marker. `2f + 1` matching checkpoints allow
/// garbage collection of everything at or below `index`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Batch index this checkpoint covers.
    pub index: u64,
    pub state_digest: Hash,
    pub node: NodeId,
}

/// Asks a peer for the batch body behind a hash, used by replicas that saw
/// certificates before the proposal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub instance: u64,
    pub batch_hash: Hash,
    pub requester: NodeId,
}

/// Hand-off of a committed batch to the execute stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecuteNotify {
    pub txn_id: u64,
    pub instance: u64,
    pub view: u64,
    pub batch: ClientBatch,
}

impl ExecuteNotify {
    pub fn batch_index(&self, batch_size: u64) -> u64 {
        self.txn_id / batch_size
    }
}

/// Every message kind of the protocol, wire-stable under bincode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    KeyExchange { node: NodeId, key: PublicKey },
    Ready { node: NodeId },
    InitDone { node: NodeId },
    ClientBatch(ClientBatch),
    ClientResponse(ClientResponse),
    BatchRequest(BatchRequest),
    Proposal(Proposal),
    PrepareVote(Vote),
    PreCommit(PhaseCertificate),
    PreCommitVote(Vote),
    Commit(PhaseCertificate),
    CommitVote(Vote),
    Decide(PhaseCertificate),
    NewView(NewView),
    Checkpoint(Checkpoint),
    ExecuteNotify(ExecuteNotify),
}

impl Message {
    /// Stable name, used for log lines and drop metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::KeyExchange { .. } => "key_exchange",
            Message::Ready { .. } => "ready",
            Message::InitDone { .. } => "init_done",
            Message::ClientBatch(_) => "client_batch",
            Message::ClientResponse(_) => "client_response",
            Message::BatchRequest(_) => "batch_request",
            Message::Proposal(_) => "proposal",
            Message::PrepareVote(_) => "prepare_vote",
            Message::PreCommit(_) => "pre_commit",
            Message::PreCommitVote(_) => "pre_commit_vote",
            Message::Commit(_) => "commit",
            Message::CommitVote(_) => "commit_vote",
            Message::Decide(_) => "decide",
            Message::NewView(_) => "new_view",
            Message::Checkpoint(_) => "checkpoint",
            Message::ExecuteNotify(_) => "execute_notify",
        }
    }

    /// The consensus instance a message belongs to; messages outside any
    /// instance map to 0.
    pub fn instance(&self) -> u64 {
        match self {
            Message::Proposal(p) => p.instance,
            Message::PrepareVote(v) | Message::PreCommitVote(v) | Message::CommitVote(v) => {
                v.instance
            }
            Message::PreCommit(c) | Message::Commit(c) | Message::Decide(c) => c.instance,
            Message::NewView(nv) => nv.instance,
            Message::BatchRequest(r) => r.instance,
            Message::ExecuteNotify(e) => e.instance,
            _ => 0,
        }
    }

    /// The transaction id a message refers to, if any.
    pub fn txn_id(&self) -> Option<u64> {
        match self {
            Message::Proposal(p) => Some(p.txn_id),
            Message::PrepareVote(v) | Message::PreCommitVote(v) | Message::CommitVote(v) => {
                Some(v.txn_id)
            }
            Message::PreCommit(c) | Message::Commit(c) | Message::Decide(c) => Some(c.txn_id),
            Message::ExecuteNotify(e) => Some(e.txn_id),
            _ => None,
        }
    }
}

/// A signed message as it travels on the wire. The header carries source,
/// destination hint and the sender's signature over the serialized
/// message body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub src: NodeId,
    pub dest: NodeId,
    pub message: Message,
    pub signature: Signature,
}

impl Envelope {
    pub fn new(
        src: NodeId,
        dest: NodeId,
        message: Message,
        keypair: &KeyPair,
    ) -> ConsensusResult<Self> {
        let bytes = bincode::serialize(&message)?;
        let signature = keypair.sign(&bytes);
        Ok(Self {
            src,
            dest,
            message,
            signature,
        })
    }

    /// Verifies the header signature against the sender's committee key.
    /// Replica and client senders are looked up in their respective maps.
    pub fn verify(&self, committee: &Committee) -> ConsensusResult<()> {
        let key = if committee.is_replica(self.src) {
            committee
                .protocol_key(self.src)
                .map_err(|_| ConsensusError::UnknownSender(self.src))?
        } else {
            committee
                .client_key(self.src)
                .map_err(|_| ConsensusError::UnknownSender(self.src))?
        };
        let bytes = bincode::serialize(&self.message)?;
        key.verify(&bytes, &self.signature)
            .map_err(|_| ConsensusError::InvalidSignature)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> ConsensusResult<Bytes> {
        Ok(bincode::serialize(self)?.into())
    }

    pub fn from_bytes(bytes: &[u8]) -> ConsensusResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qc::QcKind;
    use config::committee_fixture;

    fn batch(client: NodeId, len: usize) -> ClientBatch {
        ClientBatch {
            client,
            requests: (0..len as u64)
                .map(|seq| Request {
                    client,
                    seq,
                    payload: vec![0xab; 8],
                })
                .collect(),
        }
    }

    #[test]
    fn batch_digest_covers_request_order() {
        let b = batch(4, 4);
        let mut reordered = b.clone();
        reordered.requests.swap(0, 3);
        assert_ne!(b.digest(), reordered.digest());
    }

    #[test]
    fn envelope_roundtrip_and_verify() {
        let (committee, keys, _) = committee_fixture(4, 0, 7200);
        let hash = Hash::digest(b"b");
        let vote = Vote::new(QcKind::Prepare, 3, 0, 0, hash, 1, &keys[1]);
        let env = Envelope::new(1, 0, Message::PrepareVote(vote), &keys[1]).unwrap();

        let bytes = env.to_bytes().unwrap();
        let restored = Envelope::from_bytes(&bytes).unwrap();
        assert!(restored.verify(&committee).is_ok());
        assert_eq!(restored.message.kind(), "prepare_vote");
        assert_eq!(restored.message.txn_id(), Some(3));
    }

    #[test]
    fn envelope_with_wrong_signer_rejected() {
        let (committee, keys, _) = committee_fixture(4, 0, 7200);
        let msg = Message::Ready { node: 2 };
        // Node 2 claims authorship but node 3 signed.
        let env = Envelope::new(2, 0, msg, &keys[3]).unwrap();
        assert_eq!(
            env.verify(&committee),
            Err(ConsensusError::InvalidSignature)
        );
    }

    #[test]
    fn client_batch_signed_by_client_key() {
        let (committee, _, client_keys) = committee_fixture(4, 1, 7200);
        let env = Envelope::new(4, 0, Message::ClientBatch(batch(4, 2)), &client_keys[0]).unwrap();
        assert!(env.verify(&committee).is_ok());
    }

    #[test]
    fn unknown_sender_rejected() {
        let (committee, keys, _) = committee_fixture(4, 0, 7200);
        let env = Envelope::new(77, 0, Message::Ready { node: 77 }, &keys[0]).unwrap();
        assert_eq!(env.verify(&committee), Err(ConsensusError::UnknownSender(77)));
    }
}
