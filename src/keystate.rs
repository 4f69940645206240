use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::link::payload::DeviceSection;
use crate::{Kid, Seqno, SigId, COMPUTED_KEY_INFOS_VERSION_CURRENT};

/// Errors raised while mutating computed key state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyStateError {
    #[error("per-user-key generation {got} does not follow {have}")]
    NonMonotonicGeneration { have: u32, got: u32 },
    #[error("no computed key info available")]
    NoComputedKeyInfo,
}

/// Role a key plays within its subchain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyRole {
    Eldest,
    Sibkey,
    Subkey,
}

/// Snapshot of a single key: how it was delegated and whether it has
/// been revoked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComputedKeyInfo {
    pub role: KeyRole,
    pub delegated_at: Option<u64>,
    pub revoked_at: Option<u64>,
    pub delegation_sig_id: Option<SigId>,
    pub delegation_signer: Option<Kid>,
    pub active_pgp_hash: Option<String>,
    pub first_appeared: Option<Seqno>,
    pub hash_meta: Option<String>,
}

impl ComputedKeyInfo {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }

    #[must_use]
    pub fn is_sibkey(&self) -> bool {
        matches!(self.role, KeyRole::Sibkey)
    }
}

/// Provenance bundle for one delegation.
#[derive(Clone, Debug)]
pub struct Delegation {
    pub kid: Kid,
    pub role: KeyRole,
    pub sig_id: Option<SigId>,
    pub signer: Option<Kid>,
    pub delegated_at: Option<u64>,
    pub first_appeared: Option<Seqno>,
    pub hash_meta: Option<String>,
}

/// One generation of the user's per-user key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerUserKeyInfo {
    pub generation: u32,
    pub signing_kid: Kid,
    pub encryption_kid: Kid,
    pub seqno: Seqno,
}

/// All public keys the user record claims to have ever possessed. The
/// evaluator only trusts keys it can re-derive from the chain; the
/// family bounds what a delegation may introduce.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyFamily {
    all_kids: BTreeSet<Kid>,
}

impl KeyFamily {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_kids<I: IntoIterator<Item = Kid>>(kids: I) -> Self {
        Self {
            all_kids: kids.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, kid: Kid) {
        self.all_kids.insert(kid);
    }

    #[must_use]
    pub fn contains(&self, kid: &Kid) -> bool {
        self.all_kids.contains(kid)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.all_kids.is_empty()
    }
}

/// Computed key state at one point in a chain: every KID the user has
/// possessed with its delegation provenance and revocation status, plus
/// the device and per-user-key maps that ride along.
///
/// Working copies for local overlays are plain deep clones; the type is
/// a pure value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComputedKeyInfos {
    version: u32,
    eldest: Option<Kid>,
    infos: BTreeMap<Kid, ComputedKeyInfo>,
    sig_id_to_kid: BTreeMap<SigId, Kid>,
    devices: BTreeMap<String, DeviceSection>,
    kid_to_device_id: BTreeMap<Kid, String>,
    per_user_keys: BTreeMap<u32, PerUserKeyInfo>,
}

impl Default for ComputedKeyInfos {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputedKeyInfos {
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: COMPUTED_KEY_INFOS_VERSION_CURRENT,
            eldest: None,
            infos: BTreeMap::new(),
            sig_id_to_kid: BTreeMap::new(),
            devices: BTreeMap::new(),
            kid_to_device_id: BTreeMap::new(),
            per_user_keys: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Whether this instance was computed by an older implementation and
    /// must be discarded.
    #[must_use]
    pub fn is_stale_version(&self) -> bool {
        self.version != COMPUTED_KEY_INFOS_VERSION_CURRENT
    }

    fn insert_eldest(
        &mut self,
        kid: Kid,
        delegated_at: Option<u64>,
        first_appeared: Option<Seqno>,
    ) {
        self.infos.insert(
            kid.clone(),
            ComputedKeyInfo {
                role: KeyRole::Eldest,
                delegated_at,
                revoked_at: None,
                delegation_sig_id: None,
                delegation_signer: None,
                active_pgp_hash: None,
                first_appeared,
                hash_meta: None,
            },
        );
        self.eldest = Some(kid);
    }

    /// Registers the eldest key from the first link of a subchain.
    pub fn insert_eldest_link(&mut self, kid: Kid, delegated_at: Option<u64>, seqno: Seqno) {
        self.insert_eldest(kid, delegated_at, Some(seqno));
    }

    /// Registers an eldest key for a just-issued local delegation, before
    /// any link exists.
    pub fn insert_local_eldest(&mut self, kid: Kid) {
        self.insert_eldest(kid, None, None);
    }

    /// Registers the server-asserted eldest key when the current subchain
    /// is empty (new or just-reset account).
    pub fn insert_server_eldest(&mut self, kid: Kid) {
        self.insert_eldest(kid, None, None);
    }

    /// Installs a delegated key, recording provenance.
    pub fn delegate(&mut self, d: Delegation) {
        if let Some(sig_id) = &d.sig_id {
            self.sig_id_to_kid.insert(sig_id.clone(), d.kid.clone());
        }
        self.infos.insert(
            d.kid,
            ComputedKeyInfo {
                role: d.role,
                delegated_at: d.delegated_at,
                revoked_at: None,
                delegation_sig_id: d.sig_id,
                delegation_signer: d.signer,
                active_pgp_hash: None,
                first_appeared: d.first_appeared,
                hash_meta: d.hash_meta,
            },
        );
    }

    /// Marks a key revoked. Unknown kids are ignored; the server may
    /// reference keys outside the family we replay.
    pub fn revoke_kid(&mut self, kid: &Kid, at: Option<u64>) {
        if let Some(info) = self.infos.get_mut(kid) {
            info.revoked_at = at.or(Some(0));
        }
    }

    /// Revokes the key a previous delegation signature installed.
    pub fn revoke_sig(&mut self, sig_id: &SigId, at: Option<u64>) {
        if let Some(kid) = self.sig_id_to_kid.get(sig_id).cloned() {
            self.revoke_kid(&kid, at);
        }
    }

    /// Refreshes the active PGP full hash for a known key.
    pub fn set_active_pgp_hash(&mut self, kid: &Kid, hash: String) {
        if let Some(info) = self.infos.get_mut(kid) {
            info.active_pgp_hash = Some(hash);
        }
    }

    /// Records or refreshes a device registration.
    pub fn update_device(&mut self, device: DeviceSection) {
        if let Some(kid) = &device.kid {
            self.kid_to_device_id.insert(kid.clone(), device.id.clone());
        }
        self.devices.insert(device.id.clone(), device);
    }

    /// Records a new per-user-key generation; generations are dense.
    pub fn delegate_per_user_key(&mut self, puk: PerUserKeyInfo) -> Result<(), KeyStateError> {
        let have = self.per_user_keys.keys().next_back().copied().unwrap_or(0);
        if puk.generation != have + 1 {
            return Err(KeyStateError::NonMonotonicGeneration {
                have,
                got: puk.generation,
            });
        }
        self.per_user_keys.insert(puk.generation, puk);
        Ok(())
    }

    #[must_use]
    pub fn eldest(&self) -> Option<&Kid> {
        self.eldest.as_ref()
    }

    #[must_use]
    pub fn get(&self, kid: &Kid) -> Option<&ComputedKeyInfo> {
        self.infos.get(kid)
    }

    /// Whether a key exists and has not been revoked.
    #[must_use]
    pub fn is_kid_active(&self, kid: &Kid) -> bool {
        self.infos.get(kid).map_or(false, ComputedKeyInfo::is_active)
    }

    #[must_use]
    pub fn device(&self, device_id: &str) -> Option<&DeviceSection> {
        self.devices.get(device_id)
    }

    #[must_use]
    pub fn device_id_for_kid(&self, kid: &Kid) -> Option<&str> {
        self.kid_to_device_id.get(kid).map(String::as_str)
    }

    #[must_use]
    pub fn per_user_key(&self, generation: u32) -> Option<&PerUserKeyInfo> {
        self.per_user_keys.get(&generation)
    }

    #[must_use]
    pub fn latest_per_user_key(&self) -> Option<&PerUserKeyInfo> {
        self.per_user_keys.values().next_back()
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        self.infos.len()
    }
}
