// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Signing keys, digests and the threshold-share surface used by the
//! consensus protocol. A share is an ed25519 signature by a single
//! authority over the canonical bytes of a quorum certificate; a set of
//! `2f + 1` distinct valid shares certifies the phase.

use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use thiserror::Error;

/// Replica identity, `node_id ∈ [0, n)`. Client nodes are numbered from `n`.
pub type NodeId = u64;

pub const DIGEST_LENGTH: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("malformed key bytes")]
    MalformedKey,
}

/// A SHA-256 digest.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Hash([u8; DIGEST_LENGTH]);

impl Hash {
    pub fn new(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }

    /// SHA-256 over `bytes`.
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LENGTH] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; DIGEST_LENGTH]
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// An authority's public key.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(ed25519_dalek::VerifyingKey);

impl PublicKey {
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        self.0
            .verify(msg, &signature.0)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Verifies a single threshold share over the canonical QC bytes.
    pub fn verify_share(&self, msg: &[u8], share: &SignatureShare) -> Result<(), CryptoError> {
        self.0
            .verify(msg, &share.0)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0.to_bytes()[..8]))
    }
}

/// A full signature over a message envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(ed25519_dalek::Signature);

/// One authority's contribution to a quorum certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureShare(ed25519_dalek::Signature);

/// The signing half of an authority identity.
pub struct KeyPair {
    secret: ed25519_dalek::SigningKey,
}

impl KeyPair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            secret: ed25519_dalek::SigningKey::generate(rng),
        }
    }

    /// Generates a keypair from the thread-local CSPRNG.
    pub fn random() -> Self {
        Self::generate(&mut OsRng)
    }

    /// Deterministic keypair, used by tests and committee fixtures.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            secret: ed25519_dalek::SigningKey::from_bytes(&seed),
        }
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.secret.verifying_key())
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.secret.sign(msg))
    }

    /// Produces this authority's threshold share over `msg`.
    pub fn share_sign(&self, msg: &[u8]) -> SignatureShare {
        SignatureShare(self.secret.sign(msg))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({:?})", self.public())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = KeyPair::from_seed([7u8; 32]);
        let sig = kp.sign(b"payload");
        assert!(kp.public().verify(b"payload", &sig).is_ok());
        assert!(kp.public().verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn share_verifies_under_signer_key_only() {
        let kp = KeyPair::from_seed([1u8; 32]);
        let other = KeyPair::from_seed([2u8; 32]);
        let share = kp.share_sign(b"qc bytes");
        assert!(kp.public().verify_share(b"qc bytes", &share).is_ok());
        assert!(other.public().verify_share(b"qc bytes", &share).is_err());
    }

    #[test]
    fn digest_is_stable() {
        let d1 = Hash::digest(b"batch");
        let d2 = Hash::digest(b"batch");
        assert_eq!(d1, d2);
        assert_ne!(d1, Hash::digest(b"other"));
        assert!(!d1.is_zero());
        assert!(Hash::default().is_zero());
    }

    #[test]
    fn keys_and_signatures_roundtrip_through_bincode() {
        let kp = KeyPair::from_seed([3u8; 32]);
        let pk = kp.public();
        let bytes = bincode::serialize(&pk).unwrap();
        let back: PublicKey = bincode::deserialize(&bytes).unwrap();
        assert_eq!(pk, back);

        let share = kp.share_sign(b"msg");
        let bytes = bincode::serialize(&share).unwrap();
        let back: SignatureShare = bincode::deserialize(&bytes).unwrap();
        assert_eq!(share, back);
    }
}
