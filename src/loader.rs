// This file is part of Tantu and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};

use crate::chain::{
    is_subchain_start, ChainError, ComputeKeysError, FreshnessError, SigChain,
};
use crate::crypto::{Ed25519Verifier, Hasher, Sha256Hasher, Verifier};
use crate::keystate::KeyFamily;
use crate::link::{ChainLink, LinkError};
use crate::merkle::{MerkleOracle, MerkleTriple, MerkleUserLeaf};
use crate::store::{DbType, LocalStore};
use crate::transport::{Transport, SC_DELETED, SC_OK};
use crate::{Seqno, Uid, Username};

/// Which of a user's chains to load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainKind {
    Public,
    Private,
}

impl ChainKind {
    #[must_use]
    pub fn db_type(self) -> DbType {
        match self {
            Self::Public => DbType::SigChainTailPublic,
            Self::Private => DbType::SigChainTailPrivate,
        }
    }

    #[must_use]
    pub fn triple(self, leaf: &MerkleUserLeaf) -> Option<&MerkleTriple> {
        match self {
            Self::Public => leaf.public.as_ref(),
            Self::Private => leaf.private.as_ref(),
        }
    }
}

/// The user record a load runs against.
#[derive(Clone, Debug)]
pub struct UserInfo {
    pub uid: Uid,
    pub username: Username,
    pub key_family: KeyFamily,
}

/// Loader errors. Capability failures keep their source; everything
/// else is typed.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("user is deleted")]
    UserDeleted,
    #[error("server rejected sig/get with status {code} ({name})")]
    BadStatus { code: u32, name: String },
    #[error("server response did not reach the attested tail at seqno {seqno}")]
    TailNotReached { seqno: Seqno },
    #[error("server link at seqno {seqno} does not match the merkle attestation")]
    WrongServerTail { seqno: Seqno },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Freshness(#[from] FreshnessError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    ComputeKeys(#[from] ComputeKeysError),
    #[error("transport failure")]
    Transport(#[source] anyhow::Error),
    #[error("local store failure")]
    Store(#[source] anyhow::Error),
    #[error("merkle lookup failure")]
    Merkle(#[source] anyhow::Error),
}

/// Runs one full chain load: local splice, freshness, server fetch,
/// verification, key-state computation, persistence.
///
/// Loads for the same uid must be serialized by the caller; the loader
/// is not re-entrant on a single chain.
pub struct SigChainLoader {
    user: UserInfo,
    self_load: bool,
    kind: ChainKind,
    preload: Option<SigChain>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn LocalStore>,
    merkle: Arc<dyn MerkleOracle>,
    verifier: Arc<dyn Verifier>,
    hasher: Arc<dyn Hasher>,
}

impl SigChainLoader {
    pub fn new(
        user: UserInfo,
        kind: ChainKind,
        transport: Arc<dyn Transport>,
        store: Arc<dyn LocalStore>,
        merkle: Arc<dyn MerkleOracle>,
    ) -> Self {
        Self {
            user,
            self_load: false,
            kind,
            preload: None,
            transport,
            store,
            merkle,
            verifier: Arc::new(Ed25519Verifier),
            hasher: Arc::new(Sha256Hasher),
        }
    }

    /// Marks this as a load of the caller's own chain, so freshly
    /// fetched links are tagged as self-originated.
    #[must_use]
    pub fn for_self(mut self) -> Self {
        self.self_load = true;
        self
    }

    /// Adopts an already-loaded chain (with its caches) instead of
    /// reading links back from storage.
    #[must_use]
    pub fn with_preload(mut self, chain: SigChain) -> Self {
        self.preload = Some(chain);
        self
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    #[must_use]
    pub fn with_hasher(mut self, hasher: Arc<dyn Hasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Main entry point: loads, verifies, and evaluates the chain.
    pub async fn load(mut self) -> Result<SigChain, LoadError> {
        let uid = self.user.uid.clone();
        debug!(%uid, kind = ?self.kind, "sigchain load");

        let mut chain = match self.preload.take() {
            Some(chain) => {
                debug!("adopting preloaded chain");
                chain
            }
            None => {
                let (links, subchain_start) = self.load_links_from_storage().await?;
                SigChain::new(
                    uid.clone(),
                    self.user.username.clone(),
                    links,
                    subchain_start,
                )
            }
        };

        verify_chain_with_retry(&mut chain)?;

        let leaf = self
            .merkle
            .lookup_user(&uid)
            .await
            .map_err(LoadError::Merkle)?;
        let server_triple = self.kind.triple(&leaf).cloned();
        let current = chain.check_freshness(server_triple.as_ref(), Instant::now())?;

        let mut dirty_tail = None;
        if !current {
            dirty_tail = self
                .load_from_server(&mut chain, server_triple.as_ref())
                .await?;
        } else if chain.computed_key_infos_with_version_bust().is_none() {
            // New signatures may have shown up since the snapshot was
            // cached, or the version moved on.
            debug!("chain tip has no usable cached key state; reverifying");
        } else if !merkle_eldest_matches_tail(&leaf, &chain) {
            // The tip hasn't moved but the account may have reset;
            // proceed with the full pipeline.
            debug!("merkle leaf eldest does not match the chain tip");
        } else {
            debug!("sigchain fully cached; short-circuiting verification");
            chain.set_was_fully_cached(true);
            // Historical subchains are still re-evaluated so downstream
            // caches stay coherent.
            chain.verify_sigs_and_compute_keys(
                leaf.eldest.as_ref(),
                &self.user.key_family,
                self.verifier.as_ref(),
            )?;
            return Ok(chain);
        }

        verify_chain_with_retry(&mut chain)?;

        chain.verify_sigs_and_compute_keys(
            leaf.eldest.as_ref(),
            &self.user.key_family,
            self.verifier.as_ref(),
        )?;

        // Links are only persisted once fully verified. Persistence
        // failures are logged; the caller still gets a verified chain.
        if let Err(err) = self.store_chain(&chain).await {
            warn!(%uid, %err, "continuing past error storing chain links");
        }
        if let Some(tail) = &dirty_tail {
            debug!(seqno = tail.seqno, "storing dirty tail");
            if let Err(err) = self.store.put_tail(self.kind.db_type(), &uid, tail).await {
                warn!(%uid, %err, "continuing past error storing chain tail");
            }
        }

        Ok(chain)
    }

    /// Walks backward from the stored tail through each link's prev
    /// pointer, recording the current subchain start on the way. A gap
    /// in storage degrades to an empty chain rather than failing.
    async fn load_links_from_storage(&self) -> Result<(Vec<ChainLink>, Seqno), LoadError> {
        let uid = &self.user.uid;
        let Some(tail) = self
            .store
            .get_tail(self.kind.db_type(), uid)
            .await
            .map_err(LoadError::Store)?
        else {
            debug!(%uid, "no stored tail; starting from an empty chain");
            return Ok((Vec::new(), 0));
        };
        let Some(stored) = self
            .store
            .get_link(uid, &tail.link_id)
            .await
            .map_err(LoadError::Store)?
        else {
            debug!(link_id = %tail.link_id, "stored tail link missing");
            return Ok((Vec::new(), 0));
        };

        let mut current = ChainLink::import_from_storage(stored, self.hasher.as_ref())?;
        let mut links = Vec::new();
        let mut subchain_start = 0;
        loop {
            if current.seqno() == 1 {
                if subchain_start == 0 {
                    subchain_start = 1;
                }
                links.push(current);
                break;
            }
            let Some(prev_id) = current.prev() else {
                warn!(seqno = current.seqno(), "stored link has no prev pointer");
                return Ok((Vec::new(), 0));
            };
            let Some(stored_prev) = self
                .store
                .get_link(uid, &prev_id)
                .await
                .map_err(LoadError::Store)?
            else {
                debug!(link_id = %prev_id, "link missing from storage; discarding local chain");
                return Ok((Vec::new(), 0));
            };
            let prev = ChainLink::import_from_storage(stored_prev, self.hasher.as_ref())?;
            if subchain_start == 0 && is_subchain_start(&current, &prev) {
                subchain_start = current.seqno();
            }
            links.push(current);
            current = prev;
        }
        links.reverse();
        debug!(count = links.len(), "loaded links from storage");
        Ok((links, subchain_start))
    }

    /// Fetches links above the last loaded seqno and splices them onto
    /// the chain, checking the stream against the attested tail.
    async fn load_from_server(
        &self,
        chain: &mut SigChain,
        server_triple: Option<&MerkleTriple>,
    ) -> Result<Option<MerkleTriple>, LoadError> {
        let uid = &self.user.uid;
        let low = chain.last_loaded_seqno();
        debug!(%uid, low, "loading sigchain from server");

        let resp = self
            .transport
            .fetch_sigs(uid, low)
            .await
            .map_err(LoadError::Transport)?;
        if resp.status.code == SC_DELETED {
            return Err(LoadError::UserDeleted);
        }
        if resp.status.code != SC_OK {
            return Err(LoadError::BadStatus {
                code: resp.status.code,
                name: resp.status.name.unwrap_or_default(),
            });
        }

        let self_uid = self.self_load.then_some(uid);
        let mut found_tail = false;
        let mut links = Vec::new();
        let mut dirty_tail = None;
        for raw in resp.sigs {
            if raw.seqno <= low {
                continue;
            }
            let link = ChainLink::import_from_server(raw, self.hasher.as_ref(), self_uid)?;
            if link.is_own_new_link_from_server() {
                debug!(seqno = link.seqno(), "own new link from server");
            }
            if !found_tail {
                if let Some(t) = server_triple {
                    if link.seqno() == t.seqno {
                        if !link.matches_triple(t) {
                            return Err(LoadError::WrongServerTail { seqno: t.seqno });
                        }
                        found_tail = true;
                    }
                }
            }
            dirty_tail = Some(link.to_merkle_triple());
            links.push(link);
        }
        debug!(count = links.len(), "got new entries from server");

        if let Some(t) = server_triple {
            if !found_tail {
                return Err(LoadError::TailNotReached { seqno: t.seqno });
            }
        }

        if let Some(tail) = &dirty_tail {
            chain.clear_overlay_if_superseded(tail);
        }
        chain.append_links(links);
        Ok(dirty_tail)
    }

    /// Writes verified links tail-first, stopping at the first one the
    /// store already holds.
    async fn store_chain(&self, chain: &SigChain) -> anyhow::Result<()> {
        for link in chain.links().iter().rev() {
            if !link.is_chain_verified() {
                continue;
            }
            let newly = self
                .store
                .put_link(&self.user.uid, &link.id(), &link.to_stored())
                .await?;
            if !newly {
                break;
            }
        }
        Ok(())
    }
}

fn verify_chain_with_retry(chain: &mut SigChain) -> Result<(), ChainError> {
    match chain.verify_chain(false) {
        Err(ChainError::UserReverifyNeeded) => {
            debug!("cached state requires full chain reverification");
            chain.verify_chain(true)
        }
        other => other,
    }
}

fn merkle_eldest_matches_tail(leaf: &MerkleUserLeaf, chain: &SigChain) -> bool {
    match (leaf.eldest.as_ref(), chain.last_link().and_then(ChainLink::to_eldest_kid)) {
        (Some(leaf_eldest), Some(tail_eldest)) => leaf_eldest == tail_eldest,
        _ => false,
    }
}
