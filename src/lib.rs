//! Loader and verifier for append-only signed identity chains.
//!
//! Every user owns a *sigchain*: an append-only log of signed statements
//! (key delegations, revocations, device registrations, per-user-key
//! rotations, wallet bindings). This crate fetches a user's chain from an
//! untrusted server, splices it with locally cached links, verifies its
//! structural and cryptographic integrity end to end, segments it into
//! subchains separated by account resets, and computes the authoritative
//! key state at the chain tip.
//!
//! The crate is read-side only: it never signs or mutates a chain, and it
//! never holds private key material. External collaborators (the HTTP
//! API, the local store, the merkle tree) are reached through the
//! [`transport::Transport`], [`store::LocalStore`], and
//! [`merkle::MerkleOracle`] capabilities.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Chain container, structural verification, freshness, and local overlay.
pub mod chain;
/// Hashing and signature verification capabilities.
pub mod crypto;
/// Computed key state accumulated by replaying a subchain.
pub mod keystate;
/// Chain link model, import, and payload classification.
pub mod link;
/// Loader pipeline orchestrating storage, transport, and verification.
pub mod loader;
/// Merkle-tree attestation types and the lookup capability.
pub mod merkle;
/// Local persistence capability and its disk-backed implementation.
pub mod store;
/// Server transport capability and the sig/get wire format.
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use chain::SigChain;
pub use keystate::{ComputedKeyInfos, KeyFamily};
pub use link::ChainLink;
pub use loader::{ChainKind, LoadError, SigChainLoader, UserInfo};
pub use merkle::{MerkleTriple, MerkleUserLeaf};

/// Chain position. Dense from 1; 0 is the "none" sentinel used for
/// subchain starts and high-skip anchors.
pub type Seqno = u64;

/// How long a local overlay (from [`SigChain::bump`]) is trusted before a
/// server load must confirm it.
pub const SERVER_UPDATE_LAG: Duration = Duration::from_secs(60);

/// Version stamp carried by every [`ComputedKeyInfos`]. Bumping this
/// invalidates all cached key state, persisted or in memory.
pub const COMPUTED_KEY_INFOS_VERSION_CURRENT: u32 = 3;

/// Key identifier: hex string embedding the algorithm tag and public key
/// (`0120` ‖ ed25519 key ‖ `0a` for the keys this crate verifies itself).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kid(String);

impl Kid {
    pub fn new(hex: impl Into<String>) -> Self {
        let s: String = hex.into();
        Self(s.to_lowercase())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// User identifier: protocol-assigned hex string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    pub fn new(hex: impl Into<String>) -> Self {
        let s: String = hex.into();
        Self(s.to_lowercase())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Username, normalized to lowercase at construction so comparisons are
/// case-insensitive.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Username(String);

impl Username {
    pub fn new(name: impl Into<String>) -> Self {
        let s: String = name.into();
        Self(s.to_lowercase())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Username {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<Username> for String {
    fn from(name: Username) -> Self {
        name.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content hash of a link's canonical byte form. For v2 links this covers
/// the outer link; for v1, the inner payload.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId([u8; 32]);

impl LinkId {
    #[must_use]
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The all-zeros id anchoring the high-skip chain.
    #[must_use]
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for LinkId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for LinkId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid link id hex"))
    }
}

/// Signature identifier: hex string (hash of the signature blob plus a
/// one-byte suffix).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SigId(String);

impl SigId {
    pub fn new(hex: impl Into<String>) -> Self {
        let s: String = hex.into();
        Self(s.to_lowercase())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
