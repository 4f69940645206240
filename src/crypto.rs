use libp2p_identity::ed25519;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::Kid;

/// Algorithm tag prefix for KIDs carrying an Ed25519 public key.
const ED25519_KID_PREFIX: &str = "0120";
/// Trailing byte closing every KID.
const KID_SUFFIX: &str = "0a";

/// Errors raised by signature verification.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("kid {kid} does not embed a usable public key")]
    MalformedKid { kid: Kid },
    #[error("signature encoding is invalid")]
    MalformedSignature,
    #[error("signature rejected for kid {kid}")]
    BadSignature { kid: Kid },
}

/// Content hashing capability used to derive link ids.
pub trait Hasher: Send + Sync {
    fn digest(&self, bytes: &[u8]) -> [u8; 32];
}

/// SHA-256, the protocol's canonical content hash.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256Hasher;

impl Hasher for Sha256Hasher {
    fn digest(&self, bytes: &[u8]) -> [u8; 32] {
        let out = Sha256::digest(bytes);
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&out);
        arr
    }
}

/// Signature verification capability.
///
/// `verify_reverse_signature` checks the countersignature a delegating
/// link carries from the newly delegated key; callers hand it the inner
/// payload re-serialized with the reverse-signature field nulled out.
pub trait Verifier: Send + Sync {
    fn verify_signature(&self, kid: &Kid, payload: &[u8], sig: &[u8]) -> Result<(), CryptoError>;

    fn verify_reverse_signature(
        &self,
        delegated: &Kid,
        nulled_payload: &[u8],
        sig: &[u8],
    ) -> Result<(), CryptoError> {
        self.verify_signature(delegated, nulled_payload, sig)
    }
}

/// Ed25519 verifier for KIDs that embed their public key directly
/// (`0120` ‖ key ‖ `0a`), which makes verification registry-free.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Verifier;

impl Ed25519Verifier {
    /// Builds the KID encoding of an Ed25519 public key.
    #[must_use]
    pub fn kid_for(public: &ed25519::PublicKey) -> Kid {
        Kid::new(format!(
            "{ED25519_KID_PREFIX}{}{KID_SUFFIX}",
            hex::encode(public.to_bytes())
        ))
    }

    /// Extracts the public key embedded in a KID, if it carries one.
    pub fn public_key_of(kid: &Kid) -> Option<ed25519::PublicKey> {
        let s = kid.as_str();
        let body = s
            .strip_prefix(ED25519_KID_PREFIX)?
            .strip_suffix(KID_SUFFIX)?;
        let bytes = hex::decode(body).ok()?;
        ed25519::PublicKey::try_from_bytes(&bytes).ok()
    }
}

impl Verifier for Ed25519Verifier {
    fn verify_signature(&self, kid: &Kid, payload: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
        let public = Self::public_key_of(kid).ok_or_else(|| CryptoError::MalformedKid {
            kid: kid.clone(),
        })?;
        if sig.len() != 64 {
            return Err(CryptoError::MalformedSignature);
        }
        if public.verify(payload, sig) {
            Ok(())
        } else {
            Err(CryptoError::BadSignature { kid: kid.clone() })
        }
    }
}
