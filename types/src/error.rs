// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crypto::{CryptoError, NodeId};
use thiserror::Error;

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            return Err($e);
        }
    };
}

pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// Every failure the protocol layer can observe. Recoverable variants are
/// logged and dropped at a single choke point; none of them ever crosses
/// back onto the network.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConsensusError {
    #[error("node is shutting down")]
    ShuttingDown,

    #[error("malformed wire payload: {0}")]
    WireFormat(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("message from unknown node {0}")]
    UnknownSender(NodeId),

    #[error("message from {received} but leader of view {view} is {expected}")]
    WrongLeader {
        received: NodeId,
        expected: NodeId,
        view: u64,
    },

    #[error("message at view {received} is stale, instance is at view {current}")]
    StaleView { received: u64, current: u64 },

    #[error("proposal at view {view} fails the safety predicate")]
    UnsafeProposal { view: u64 },

    #[error("certificate carries {got} shares, quorum is {need}")]
    CertificateTooWeak { got: usize, need: u64 },

    #[error("certificate share from node {0} fails verification")]
    InvalidShare(NodeId),

    #[error("expected a {expected:?} certificate, got {got:?}")]
    CertificateKindMismatch {
        expected: crate::QcKind,
        got: crate::QcKind,
    },

    #[error("txn {txn_id} already garbage collected (watermark {last_deleted})")]
    TooOld { txn_id: u64, last_deleted: u64 },

    #[error("txn {txn_id} is beyond the in-flight window ending at {horizon}")]
    BeyondWindow { txn_id: u64, horizon: u64 },

    #[error("duplicate vote from node {voter} at view {view}")]
    DuplicateVote { voter: NodeId, view: u64 },

    #[error("node {voter} voted for conflicting batches at view {view}")]
    ConflictingVote { voter: NodeId, view: u64 },

    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),

    #[error("network error: {0}")]
    NetworkError(String),
}

impl ConsensusError {
    /// Stable short code, used as the label of the drop metric.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusError::ShuttingDown => "shutting_down",
            ConsensusError::WireFormat(_) => "wire_format",
            ConsensusError::InvalidSignature => "invalid_signature",
            ConsensusError::UnknownSender(_) => "unknown_sender",
            ConsensusError::WrongLeader { .. } => "wrong_leader",
            ConsensusError::StaleView { .. } => "stale_view",
            ConsensusError::UnsafeProposal { .. } => "unsafe_proposal",
            ConsensusError::CertificateTooWeak { .. } => "certificate_too_weak",
            ConsensusError::InvalidShare(_) => "invalid_share",
            ConsensusError::CertificateKindMismatch { .. } => "certificate_kind_mismatch",
            ConsensusError::TooOld { .. } => "too_old",
            ConsensusError::BeyondWindow { .. } => "beyond_window",
            ConsensusError::DuplicateVote { .. } => "duplicate_vote",
            ConsensusError::ConflictingVote { .. } => "conflicting_vote",
            ConsensusError::UnexpectedMessage(_) => "unexpected_message",
            ConsensusError::NetworkError(_) => "network_error",
        }
    }
}

impl From<CryptoError> for ConsensusError {
    fn from(_: CryptoError) -> Self {
        ConsensusError::InvalidSignature
    }
}

impl From<bincode::Error> for ConsensusError {
    fn from(e: bincode::Error) -> Self {
        ConsensusError::WireFormat(e.to_string())
    }
}
