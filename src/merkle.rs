// This file is part of Tantu and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Kid, LinkId, Seqno, SigId, Uid};

/// Summary of a chain tail: `(seqno, link id, sig id)`. Sourced either
/// from the merkle tree the client trusts separately, or from a locally
/// pending bump.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleTriple {
    pub seqno: Seqno,
    pub link_id: LinkId,
    #[serde(default)]
    pub sig_id: Option<SigId>,
}

impl MerkleTriple {
    pub fn new(seqno: Seqno, link_id: LinkId, sig_id: Option<SigId>) -> Self {
        Self {
            seqno,
            link_id,
            sig_id,
        }
    }

    /// Ordering by chain position only; ids at equal seqnos are compared
    /// by the freshness check, not here.
    #[must_use]
    pub fn is_behind(&self, other: &MerkleTriple) -> bool {
        self.seqno < other.seqno
    }
}

/// Per-user leaf of the global merkle tree: the attested tails of the
/// public and private chains plus the account's current eldest key.
/// Absent triples mean the server has no visible chain of that kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MerkleUserLeaf {
    pub public: Option<MerkleTriple>,
    pub private: Option<MerkleTriple>,
    pub eldest: Option<Kid>,
}

/// Lookup capability for the externally trusted merkle tree.
#[async_trait]
pub trait MerkleOracle: Send + Sync {
    async fn lookup_user(&self, uid: &Uid) -> AnyResult<MerkleUserLeaf>;
}
