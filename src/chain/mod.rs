// This file is part of Tantu and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use std::ops::Range;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::Verifier;
use crate::keystate::{ComputedKeyInfos, Delegation, KeyFamily, KeyRole, KeyStateError};
use crate::link::{ChainLink, HighSkip, LinkError};
use crate::merkle::MerkleTriple;
use crate::{Kid, LinkId, Seqno, SigId, Uid, Username, SERVER_UPDATE_LAG};

/// Subchain evaluation: replaying links over a key family.
pub mod eval;
/// Subchain segmentation at account resets.
pub mod subchain;

pub use eval::EvalError;
pub use subchain::{crop_to_rightmost_subchain, is_subchain_start};

/// Structural chain verification errors.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("prev hash mismatch at seqno {seqno}")]
    PrevHashMismatch { seqno: Seqno },
    #[error("chain seqno mismatch at seqno {seqno} (previous {prev})")]
    WrongSeqno { seqno: Seqno, prev: Seqno },
    #[error("wanted a chain starting at seqno 1, got seqno {got}")]
    WrongStart { got: Seqno },
    #[error("link at seqno {seqno} is bound to a different username or uid")]
    NameOrIdMismatch { seqno: Seqno },
    #[error("high-prev mismatch at seqno {seqno}: declared {declared:?}, expected {expected:?}")]
    HighPrevMismatch {
        seqno: Seqno,
        declared: HighSkip,
        expected: HighSkip,
    },
    #[error("the final chain link is unexpectedly stubbed")]
    StubbedFinalLink,
    #[error("cached chain state requires full reverification")]
    UserReverifyNeeded,
    #[error("internal chain error: {reason}")]
    Internal { reason: &'static str },
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Freshness comparison failures between the local and server tails.
#[derive(Debug, Error)]
pub enum FreshnessError {
    #[error("server claims not to have this user (local tail at seqno {local})")]
    ServerForgotUser { local: Seqno },
    #[error("server rollback suspected: local seqno {local} > server seqno {server}")]
    ServerRollback { local: Seqno, server: Seqno },
    #[error("server returned the wrong chain tail at seqno {seqno}")]
    WrongTail { seqno: Seqno },
}

/// Errors from the combined verify-and-compute-keys step.
#[derive(Debug, Error)]
pub enum ComputeKeysError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// A user's sigchain: every link we know about, starting at seqno 1,
/// plus the local overlay for actions the server has not reflected yet.
#[derive(Clone, Debug)]
pub struct SigChain {
    uid: Uid,
    username: Username,
    links: Vec<ChainLink>,
    was_fully_cached: bool,

    // A locally delegated key is not in the loaded chain yet; its
    // effect on key state is kept here until a server load reflects it.
    local_cki: Option<ComputedKeyInfos>,

    // Local chain modifications the server may lag behind on.
    local_tail: Option<MerkleTriple>,
    local_next_high_prev_override: Option<HighSkip>,
    local_update_time: Option<Instant>,

    // Seqno of the first link of the current subchain; 0 when the user
    // is new or just reset and has no subchain yet.
    current_subchain_start: Seqno,

    // Historical subchains, oldest first, as index ranges into `links`.
    prev_subchains: Vec<Range<usize>>,
}

impl SigChain {
    pub fn new(
        uid: Uid,
        username: Username,
        links: Vec<ChainLink>,
        current_subchain_start: Seqno,
    ) -> Self {
        Self {
            uid,
            username,
            links,
            was_fully_cached: false,
            local_cki: None,
            local_tail: None,
            local_next_high_prev_override: None,
            local_update_time: None,
            current_subchain_start,
            prev_subchains: Vec::new(),
        }
    }

    #[must_use]
    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    #[must_use]
    pub fn username(&self) -> &Username {
        &self.username
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    #[must_use]
    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }

    #[must_use]
    pub fn first_link(&self) -> Option<&ChainLink> {
        self.links.first()
    }

    #[must_use]
    pub fn last_link(&self) -> Option<&ChainLink> {
        self.links.last()
    }

    #[must_use]
    pub fn first_seqno(&self) -> Seqno {
        self.links.first().map_or(0, ChainLink::seqno)
    }

    #[must_use]
    pub fn link_with_seqno(&self, seqno: Seqno) -> Option<&ChainLink> {
        self.links.iter().find(|l| l.seqno() == seqno)
    }

    #[must_use]
    pub fn link_with_sig_id(&self, sig_id: &SigId) -> Option<&ChainLink> {
        self.links.iter().find(|l| l.sig_id() == sig_id)
    }

    /// Seqno of the current subchain's first link; 0 when none exists.
    #[must_use]
    pub fn eldest_seqno(&self) -> Seqno {
        self.current_subchain_start
    }

    #[must_use]
    pub fn current_subchain_start(&self) -> Seqno {
        self.current_subchain_start
    }

    /// Historical subchains, oldest first.
    #[must_use]
    pub fn prev_subchains(&self) -> &[Range<usize>] {
        &self.prev_subchains
    }

    #[must_use]
    pub fn was_fully_cached(&self) -> bool {
        self.was_fully_cached
    }

    pub(crate) fn set_was_fully_cached(&mut self, v: bool) {
        self.was_fully_cached = v;
    }

    #[must_use]
    pub fn last_loaded_seqno(&self) -> Seqno {
        self.links.last().map_or(0, ChainLink::seqno)
    }

    #[must_use]
    pub fn last_loaded_id(&self) -> Option<LinkId> {
        self.links.last().map(ChainLink::id)
    }

    /// Last seqno including any pending local bump. The overlay is only
    /// consulted within the server update lag window.
    #[must_use]
    pub fn last_known_seqno(&self, now: Instant) -> Seqno {
        self.future_chain_tail(now)
            .map_or_else(|| self.last_loaded_seqno(), |t| t.seqno)
    }

    /// Last link id including any pending local bump.
    #[must_use]
    pub fn last_known_id(&self, now: Instant) -> Option<LinkId> {
        self.future_chain_tail(now)
            .map(|t| t.link_id)
            .or_else(|| self.last_loaded_id())
    }

    #[must_use]
    pub fn current_tail_triple(&self) -> Option<MerkleTriple> {
        self.links.last().map(ChainLink::to_merkle_triple)
    }

    /// The locally bumped tail, while it is still within the server
    /// update lag window.
    #[must_use]
    pub fn future_chain_tail(&self, now: Instant) -> Option<&MerkleTriple> {
        let updated = self.local_update_time?;
        if now.duration_since(updated) < SERVER_UPDATE_LAG {
            self.local_tail.as_ref()
        } else {
            None
        }
    }

    /// The high-prev a newly signed link must declare. Only valid after
    /// `verify_chain` has run.
    pub fn expected_next_high_prev(&self) -> Result<HighSkip, ChainError> {
        if let Some(overridden) = &self.local_next_high_prev_override {
            return Ok(overridden.clone());
        }
        match self.links.last() {
            None => Ok(HighSkip::initial()),
            Some(last) => last
                .expected_next_high_prev()
                .ok_or(ChainError::UserReverifyNeeded),
        }
    }

    /// Key state at the tip: the local overlay wins over the cached
    /// snapshot on the tail link.
    #[must_use]
    pub fn computed_key_infos(&self) -> Option<&ComputedKeyInfos> {
        if let Some(local) = &self.local_cki {
            return Some(local);
        }
        self.links
            .last()
            .and_then(|l| l.cki_cache())
            .map(|arc| arc.as_ref())
    }

    /// Like [`Self::computed_key_infos`], but drops snapshots computed
    /// by an older implementation version.
    #[must_use]
    pub fn computed_key_infos_with_version_bust(&self) -> Option<&ComputedKeyInfos> {
        let cki = self.computed_key_infos()?;
        if cki.is_stale_version() {
            debug!(version = cki.version(), "dropping stale computed key infos");
            return None;
        }
        Some(cki)
    }

    /// Records a local chain bump the server has not caught up to. The
    /// triple's seqno is forced to the next position after the last
    /// known one.
    pub fn bump(&mut self, mut triple: MerkleTriple, is_high_delegator: bool, now: Instant) {
        triple.seqno = self.last_known_seqno(now) + 1;
        debug!(seqno = triple.seqno, "bumping local chain tail");
        if is_high_delegator {
            self.local_next_high_prev_override =
                Some(HighSkip::new(triple.seqno, triple.link_id));
        }
        self.local_tail = Some(triple);
        self.local_update_time = Some(now);
    }

    /// Reflects a just-issued local key delegation in the overlay key
    /// state, ahead of the server.
    pub fn local_delegate(
        &mut self,
        kid: &Kid,
        sig_id: Option<&SigId>,
        signing_kid: &Kid,
        is_sibkey: bool,
        hash_meta: Option<String>,
        first_appeared: Seqno,
    ) {
        debug!(%kid, %signing_kid, is_sibkey, "local delegate");
        let mut cki = match self.local_cki.take() {
            Some(cki) => cki,
            None => match self.links.last().and_then(|l| l.cki_cache()) {
                // Deep copy: the cached tail snapshot must not observe
                // the local delegation.
                Some(cached) => cached.as_ref().clone(),
                None => {
                    debug!(%signing_kid, "local delegate: starting fresh key state");
                    let mut cki = ComputedKeyInfos::new();
                    cki.insert_local_eldest(signing_kid.clone());
                    cki
                }
            },
        };
        if sig_id.is_some() {
            cki.delegate(Delegation {
                kid: kid.clone(),
                role: if is_sibkey {
                    KeyRole::Sibkey
                } else {
                    KeyRole::Subkey
                },
                sig_id: sig_id.cloned(),
                signer: Some(signing_kid.clone()),
                delegated_at: None,
                first_appeared: if first_appeared > 0 {
                    Some(first_appeared)
                } else {
                    None
                },
                hash_meta,
            });
        }
        self.local_cki = Some(cki);
    }

    /// Reflects a just-issued local per-user-key rotation in the overlay.
    pub fn local_delegate_per_user_key(
        &mut self,
        puk: crate::keystate::PerUserKeyInfo,
    ) -> Result<(), KeyStateError> {
        let mut cki = match self.local_cki.take() {
            Some(cki) => cki,
            None => match self.links.last().and_then(|l| l.cki_cache()) {
                Some(cached) => cached.as_ref().clone(),
                None => return Err(KeyStateError::NoComputedKeyInfo),
            },
        };
        let result = cki.delegate_per_user_key(puk);
        self.local_cki = Some(cki);
        result
    }

    pub(crate) fn append_links(&mut self, links: Vec<ChainLink>) {
        self.links.extend(links);
    }

    /// Drops the overlay once a server load has reached or passed it.
    pub(crate) fn clear_overlay_if_superseded(&mut self, dirty_tail: &MerkleTriple) {
        if let Some(local) = &self.local_tail {
            if local.is_behind(dirty_tail) {
                debug!(
                    local = local.seqno,
                    server = dirty_tail.seqno,
                    "clearing cached local tail"
                );
                self.local_tail = None;
                self.local_next_high_prev_override = None;
                self.local_cki = None;
                self.local_update_time = None;
            }
        }
    }

    /// Structural verification over the whole link list.
    ///
    /// Backward pass: prev pointers, seqno density, name/uid binding,
    /// short-circuiting at the first already-verified link unless
    /// `reverify` is set. Forward pass: high-prev propagation from the
    /// pass boundary to the tail.
    pub fn verify_chain(&mut self, reverify: bool) -> Result<(), ChainError> {
        let len = self.links.len();
        let mut expected = HighSkip::initial();
        let mut first_unverified = 0;

        for i in (0..len).rev() {
            if !reverify && self.links[i].is_chain_verified() {
                expected = self.links[i]
                    .expected_next_high_prev()
                    .ok_or(ChainError::UserReverifyNeeded)?;
                first_unverified = i + 1;
                debug!(index = i, "chain verification short-circuit");
                break;
            }
            self.links[i].verify_link()?;
            if i > 0 {
                let prev_id = self.links[i - 1].id();
                let prev_seqno = self.links[i - 1].seqno();
                let curr = &self.links[i];
                // For v2 links the id covers the outer form; prev
                // pointers chain outer hashes.
                if curr.prev() != Some(prev_id) {
                    return Err(ChainError::PrevHashMismatch {
                        seqno: curr.seqno(),
                    });
                }
                if prev_seqno + 1 != curr.seqno() {
                    return Err(ChainError::WrongSeqno {
                        seqno: curr.seqno(),
                        prev: prev_seqno,
                    });
                }
            }
            let curr = &self.links[i];
            let name_ok = curr.username().map_or(true, |u| *u == self.username);
            let uid_ok = curr.uid().map_or(true, |u| *u == self.uid);
            if !name_ok || !uid_ok {
                return Err(ChainError::NameOrIdMismatch {
                    seqno: curr.seqno(),
                });
            }
            self.links[i].chain_verified = true;
        }

        for i in first_unverified..len {
            self.links[i].computed_high_prev = Some(expected.clone());
            if let Some(declared) = self.links[i].high_skip().cloned() {
                if declared != expected {
                    return Err(ChainError::HighPrevMismatch {
                        seqno: self.links[i].seqno(),
                        declared,
                        expected,
                    });
                }
            }
            expected = self.links[i]
                .expected_next_high_prev()
                .ok_or(ChainError::Internal {
                    reason: "high-prev state missing during forward pass",
                })?;
        }

        Ok(())
    }

    /// Compares the local tail against the server-attested one.
    /// Returns true when the local chain is current and no fetch is
    /// needed.
    pub fn check_freshness(
        &self,
        server: Option<&MerkleTriple>,
        now: Instant,
    ) -> Result<bool, FreshnessError> {
        let client = self.current_tail_triple();
        let future = self.future_chain_tail(now);

        let server = match (server, &client) {
            (None, Some(cli)) => {
                return Err(FreshnessError::ServerForgotUser { local: cli.seqno })
            }
            (None, None) => {
                debug!("no server or local tail; chain is trivially fresh");
                return Ok(true);
            }
            (Some(srv), _) => srv,
        };

        let mut current = false;
        let local_seqno = client.as_ref().map_or(0, |c| c.seqno);
        if local_seqno > server.seqno {
            return Err(FreshnessError::ServerRollback {
                local: local_seqno,
                server: server.seqno,
            });
        }
        if let Some(cli) = &client {
            if cli.seqno == server.seqno {
                debug!(seqno = cli.seqno, "local chain is up to date");
                if cli.link_id != server.link_id {
                    return Err(FreshnessError::WrongTail { seqno: cli.seqno });
                }
                current = true;
            } else {
                debug!(
                    local = cli.seqno,
                    server = server.seqno,
                    "local chain is out of date"
                );
            }
        }

        if current {
            if let Some(future) = future {
                if client.as_ref().map_or(0, |c| c.seqno) < future.seqno {
                    debug!(
                        pending = future.seqno,
                        "pending local bump forces a reload"
                    );
                    current = false;
                }
            }
        }

        Ok(current)
    }

    /// Verifies signatures and computes key state for the current
    /// subchain, then for every historical subchain. Historical
    /// failures are logged and swallowed: they mean the server served
    /// malformed history, not that the current state is wrong.
    ///
    /// Returns true when every evaluated subchain hit its cache.
    pub fn verify_sigs_and_compute_keys(
        &mut self,
        eldest: Option<&Kid>,
        kf: &KeyFamily,
        verifier: &dyn Verifier,
    ) -> Result<bool, ComputeKeysError> {
        let (cached, consumed) = self.verify_sigs_and_compute_keys_current(eldest, kf, verifier)?;
        if kf.is_empty() {
            return Ok(cached);
        }
        let mut all_cached = cached;
        let historical_upper = self.links.len() - consumed;
        if historical_upper > 0 {
            debug!(
                consumed,
                historical = historical_upper,
                "examining historical subchains"
            );
            if !self.verify_sigs_and_compute_keys_historical(historical_upper, kf, verifier) {
                all_cached = false;
            }
        }
        Ok(all_cached)
    }

    fn verify_sigs_and_compute_keys_current(
        &mut self,
        eldest: Option<&Kid>,
        kf: &KeyFamily,
        verifier: &dyn Verifier,
    ) -> Result<(bool, usize), ComputeKeysError> {
        self.verify_chain(false)?;

        if let Some(first) = self.links.first() {
            if first.seqno() != 1 {
                return Err(ChainError::WrongStart {
                    got: first.seqno(),
                }
                .into());
            }
        }

        // Recorded during local loading; recompute from scratch here.
        // Stays 0 for a new user or an empty post-reset subchain.
        self.current_subchain_start = 0;

        let eldest = match eldest {
            Some(eldest) if !kf.is_empty() => eldest,
            _ => {
                debug!("no key family or eldest key; key computation short-circuits");
                self.local_cki = Some(ComputedKeyInfos::new());
                return Ok((false, 0));
            }
        };

        let range = crop_to_rightmost_subchain(&self.links, eldest)?;
        if range.is_empty() {
            debug!(%eldest, "current subchain is empty for this eldest key");
            let mut cki = ComputedKeyInfos::new();
            cki.insert_server_eldest(eldest.clone());
            self.local_cki = Some(cki);
            return Ok((false, 0));
        }

        self.current_subchain_start = self.links[range.start].seqno();
        let consumed = range.len();
        let (cached, _) = eval::verify_subchain(kf, &mut self.links[range], verifier)?;
        Ok((cached, consumed))
    }

    fn verify_sigs_and_compute_keys_historical(
        &mut self,
        mut upper: usize,
        kf: &KeyFamily,
        verifier: &dyn Verifier,
    ) -> bool {
        let mut all_cached = true;
        let mut prev_subchains: Vec<Range<usize>> = Vec::new();

        loop {
            if upper == 0 {
                debug!("no further historical links");
                break;
            }
            let Some(eldest) = self.links[upper - 1].to_eldest_kid().cloned() else {
                debug!(index = upper - 1, "historical walk stops at nil eldest");
                break;
            };
            let range = match crop_to_rightmost_subchain(&self.links[..upper], &eldest) {
                Ok(range) if !range.is_empty() => range,
                Ok(_) => break,
                Err(err) => {
                    warn!(uid = %self.uid, %err, "error backtracking historical subchain");
                    break;
                }
            };
            let tail_seqno = self.links[range.end - 1].seqno();
            match eval::verify_subchain(kf, &mut self.links[range.clone()], verifier) {
                Ok((cached, _)) => {
                    if !cached {
                        all_cached = false;
                    }
                }
                Err(err) => {
                    warn!(
                        uid = %self.uid,
                        tail_seqno,
                        %err,
                        "error verifying historical subchain; server served malformed history"
                    );
                    break;
                }
            }
            upper = range.start;
            prev_subchains.push(range);
        }

        prev_subchains.reverse();
        debug!(count = prev_subchains.len(), "loaded historical subchains");
        self.prev_subchains = prev_subchains;
        all_cached
    }
}
