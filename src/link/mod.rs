#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::Hasher;
use crate::keystate::ComputedKeyInfos;
use crate::merkle::MerkleTriple;
use crate::{Kid, LinkId, Seqno, SigId, Uid, Username};

/// Link payload classification and stubbing policy.
pub mod payload;

pub use payload::{InnerBody, LinkPayload, LinkType, RevokeSection};

/// Errors raised while importing or structurally checking a single link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to parse link at seqno {seqno}: {reason}")]
    Parse { seqno: Seqno, reason: String },
    #[error("unsupported sig_version {got} at seqno {seqno}")]
    UnsupportedVersion { seqno: Seqno, got: u8 },
    #[error("outer/inner disagreement on {field} at seqno {seqno}")]
    FieldDisagreement { field: &'static str, seqno: Seqno },
    #[error("missing {field} in link at seqno {seqno}")]
    MissingField { field: &'static str, seqno: Seqno },
    #[error("link of type {link_type} lacks its {field} section")]
    MissingSection {
        link_type: String,
        field: &'static str,
    },
    #[error("seqno must be positive")]
    BadSeqno,
    #[error("prev pointer must be present exactly when seqno > 1 (seqno {seqno})")]
    PrevPresence { seqno: Seqno },
}

/// Sparse skip pointer to an earlier high-priority link.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighSkip {
    pub seqno: Seqno,
    pub hash: LinkId,
}

impl HighSkip {
    pub fn new(seqno: Seqno, hash: LinkId) -> Self {
        Self { seqno, hash }
    }

    /// Anchor of the high-skip chain, before any high link exists.
    #[must_use]
    pub fn initial() -> Self {
        Self {
            seqno: 0,
            hash: LinkId::zero(),
        }
    }
}

/// One element of a `sig/get` response, and the payload half of a
/// [`StoredLink`]. The `payload_json` and `outer_json` strings are kept
/// verbatim; link ids and signatures cover their exact bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawLink {
    pub seqno: Seqno,
    pub sig_version: u8,
    pub sig_id: SigId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outer_json: Option<String>,
}

/// Inner (v1-style) payload: the full JSON statement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InnerLink {
    pub seqno: Seqno,
    #[serde(default)]
    pub prev: Option<LinkId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_skip: Option<HighSkip>,
    pub body: InnerBody,
}

/// Outer (v2) link: the compact form the signature covers, hoisting the
/// essentials of the inner payload it points to through `curr`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OuterLink {
    pub version: u8,
    pub seqno: Seqno,
    #[serde(default)]
    pub prev: Option<LinkId>,
    pub curr: LinkId,
    #[serde(rename = "type")]
    pub link_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eldest_kid: Option<Kid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_skip: Option<HighSkip>,
}

/// Serialized form of a link in the local store: the raw wire link plus
/// the verification bits, which ride with it across loads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredLink {
    pub raw: RawLink,
    pub chain_verified: bool,
    pub sig_verified: bool,
}

/// One imported chain link. Immutable once imported, apart from the
/// monotonic verification bits and the cached key state.
#[derive(Clone, Debug)]
pub struct ChainLink {
    pub(crate) seqno: Seqno,
    pub(crate) id: LinkId,
    pub(crate) sig_id: SigId,
    pub(crate) sig_version: u8,
    pub(crate) prev: Option<LinkId>,
    pub(crate) link_type: LinkType,
    pub(crate) eldest_kid: Option<Kid>,
    pub(crate) signing_kid: Option<Kid>,
    pub(crate) high_skip: Option<HighSkip>,
    pub(crate) sig: Option<Vec<u8>>,
    pub(crate) inner: Option<InnerLink>,
    pub(crate) payload: Option<LinkPayload>,
    pub(crate) payload_bytes: Option<Vec<u8>>,
    pub(crate) outer_bytes: Option<Vec<u8>>,
    pub(crate) raw: RawLink,
    pub(crate) is_own_new_link_from_server: bool,
    pub(crate) chain_verified: bool,
    pub(crate) sig_verified: bool,
    pub(crate) cki_cache: Option<Arc<ComputedKeyInfos>>,
    pub(crate) computed_high_prev: Option<HighSkip>,
}

impl ChainLink {
    /// Imports a link from a server response. Parses outer and inner
    /// forms, computes the link id, and enforces outer/inner agreement.
    /// Signatures are not verified here.
    pub fn import_from_server(
        raw: RawLink,
        hasher: &dyn Hasher,
        self_uid: Option<&Uid>,
    ) -> Result<Self, LinkError> {
        let mut link = Self::import(raw, hasher)?;
        if let (Some(me), Some(owner)) = (self_uid, link.uid()) {
            if me == owner {
                link.is_own_new_link_from_server = true;
            }
        }
        Ok(link)
    }

    /// Imports a link from the local store, restoring the persisted
    /// verification bits.
    pub fn import_from_storage(stored: StoredLink, hasher: &dyn Hasher) -> Result<Self, LinkError> {
        let mut link = Self::import(stored.raw, hasher)?;
        link.chain_verified = stored.chain_verified;
        link.sig_verified = stored.sig_verified;
        Ok(link)
    }

    fn import(raw: RawLink, hasher: &dyn Hasher) -> Result<Self, LinkError> {
        let seqno = raw.seqno;
        let parse = |reason: String| LinkError::Parse { seqno, reason };

        let sig = match &raw.sig {
            Some(s) => Some(hex::decode(s).map_err(|e| parse(format!("sig hex: {e}")))?),
            None => None,
        };

        match raw.sig_version {
            1 => {
                let payload_json = raw
                    .payload_json
                    .as_deref()
                    .ok_or(LinkError::MissingField {
                        field: "payload_json",
                        seqno,
                    })?;
                let inner: InnerLink = serde_json::from_str(payload_json)
                    .map_err(|e| parse(format!("inner payload: {e}")))?;
                if inner.seqno != seqno {
                    return Err(LinkError::FieldDisagreement {
                        field: "seqno",
                        seqno,
                    });
                }
                let payload_bytes = payload_json.as_bytes().to_vec();
                let id = LinkId::new(hasher.digest(&payload_bytes));
                if sig.is_none() {
                    return Err(LinkError::MissingField { field: "sig", seqno });
                }
                let payload = LinkPayload::classify(&inner.body)?;
                Ok(Self {
                    seqno,
                    id,
                    sig_id: raw.sig_id.clone(),
                    sig_version: 1,
                    prev: inner.prev,
                    link_type: LinkType::from_wire(&inner.body.link_type),
                    eldest_kid: inner.body.key.eldest_kid.clone(),
                    signing_kid: Some(inner.body.key.kid.clone()),
                    high_skip: inner.high_skip.clone(),
                    sig,
                    inner: Some(inner),
                    payload: Some(payload),
                    payload_bytes: Some(payload_bytes),
                    outer_bytes: None,
                    raw,
                    is_own_new_link_from_server: false,
                    chain_verified: false,
                    sig_verified: false,
                    cki_cache: None,
                    computed_high_prev: None,
                })
            }
            2 => {
                let outer_json = raw.outer_json.as_deref().ok_or(LinkError::MissingField {
                    field: "outer_json",
                    seqno,
                })?;
                let outer: OuterLink = serde_json::from_str(outer_json)
                    .map_err(|e| parse(format!("outer link: {e}")))?;
                if outer.version != 2 {
                    return Err(parse(format!("outer version {} is not 2", outer.version)));
                }
                if outer.seqno != seqno {
                    return Err(LinkError::FieldDisagreement {
                        field: "seqno",
                        seqno,
                    });
                }
                let outer_bytes = outer_json.as_bytes().to_vec();
                let id = LinkId::new(hasher.digest(&outer_bytes));

                let mut link = Self {
                    seqno,
                    id,
                    sig_id: raw.sig_id.clone(),
                    sig_version: 2,
                    prev: outer.prev,
                    link_type: LinkType::from_wire(&outer.link_type),
                    eldest_kid: outer.eldest_kid.clone(),
                    signing_kid: None,
                    high_skip: outer.high_skip.clone(),
                    sig: None,
                    inner: None,
                    payload: None,
                    payload_bytes: None,
                    outer_bytes: Some(outer_bytes),
                    raw,
                    is_own_new_link_from_server: false,
                    chain_verified: false,
                    sig_verified: false,
                    cki_cache: None,
                    computed_high_prev: None,
                };

                match link.raw.payload_json.clone() {
                    None => {
                        // Stubbed: outer only, no inner, no signature.
                        if sig.is_some() {
                            return Err(LinkError::FieldDisagreement {
                                field: "sig",
                                seqno,
                            });
                        }
                        Ok(link)
                    }
                    Some(payload_json) => {
                        let inner: InnerLink = serde_json::from_str(&payload_json)
                            .map_err(|e| parse(format!("inner payload: {e}")))?;
                        let payload_bytes = payload_json.into_bytes();
                        let disagree = |field: &'static str| LinkError::FieldDisagreement {
                            field,
                            seqno,
                        };
                        if inner.seqno != outer.seqno {
                            return Err(disagree("seqno"));
                        }
                        if inner.prev != outer.prev {
                            return Err(disagree("prev"));
                        }
                        if inner.body.link_type != outer.link_type {
                            return Err(disagree("type"));
                        }
                        if let Some(inner_eldest) = &inner.body.key.eldest_kid {
                            if outer.eldest_kid.as_ref() != Some(inner_eldest) {
                                return Err(disagree("eldest_kid"));
                            }
                        }
                        let curr = LinkId::new(hasher.digest(&payload_bytes));
                        if curr != outer.curr {
                            return Err(disagree("curr"));
                        }
                        if sig.is_none() {
                            return Err(LinkError::MissingField { field: "sig", seqno });
                        }
                        link.signing_kid = Some(inner.body.key.kid.clone());
                        link.payload = Some(LinkPayload::classify(&inner.body)?);
                        link.inner = Some(inner);
                        link.payload_bytes = Some(payload_bytes);
                        link.sig = sig;
                        Ok(link)
                    }
                }
            }
            got => Err(LinkError::UnsupportedVersion { seqno, got }),
        }
    }

    /// Structural per-link checks: required fields are present and the
    /// prev pointer matches the seqno. Not a cryptographic check.
    pub fn verify_link(&self) -> Result<(), LinkError> {
        if self.seqno == 0 {
            return Err(LinkError::BadSeqno);
        }
        if (self.seqno == 1) != self.prev.is_none() {
            return Err(LinkError::PrevPresence { seqno: self.seqno });
        }
        if !self.is_stubbed() {
            if self.sig.as_deref().map_or(true, <[u8]>::is_empty) {
                return Err(LinkError::MissingField {
                    field: "sig",
                    seqno: self.seqno,
                });
            }
            if self.signing_kid.is_none() {
                return Err(LinkError::MissingField {
                    field: "kid",
                    seqno: self.seqno,
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn seqno(&self) -> Seqno {
        self.seqno
    }

    #[must_use]
    pub fn id(&self) -> LinkId {
        self.id
    }

    #[must_use]
    pub fn sig_id(&self) -> &SigId {
        &self.sig_id
    }

    #[must_use]
    pub fn sig_version(&self) -> u8 {
        self.sig_version
    }

    #[must_use]
    pub fn prev(&self) -> Option<LinkId> {
        self.prev
    }

    #[must_use]
    pub fn link_type(&self) -> &LinkType {
        &self.link_type
    }

    #[must_use]
    pub fn payload(&self) -> Option<&LinkPayload> {
        self.payload.as_ref()
    }

    #[must_use]
    pub fn signing_kid(&self) -> Option<&Kid> {
        self.signing_kid.as_ref()
    }

    #[must_use]
    pub fn eldest_kid(&self) -> Option<&Kid> {
        self.eldest_kid.as_ref()
    }

    /// The account's eldest key at signing time. Very old v1 links omit
    /// the field, in which case the signing key is assumed eldest.
    #[must_use]
    pub fn to_eldest_kid(&self) -> Option<&Kid> {
        self.eldest_kid.as_ref().or(self.signing_kid.as_ref())
    }

    #[must_use]
    pub fn uid(&self) -> Option<&Uid> {
        self.inner.as_ref().map(|i| &i.body.key.uid)
    }

    #[must_use]
    pub fn username(&self) -> Option<&Username> {
        self.inner.as_ref().map(|i| &i.body.key.username)
    }

    #[must_use]
    pub fn ctime(&self) -> Option<u64> {
        self.inner.as_ref().and_then(|i| i.ctime)
    }

    #[must_use]
    pub fn high_skip(&self) -> Option<&HighSkip> {
        self.high_skip.as_ref()
    }

    #[must_use]
    pub fn is_stubbed(&self) -> bool {
        self.inner.is_none()
    }

    /// Whether this link is on the embedded known-bad list and must be
    /// ignored during replay.
    #[must_use]
    pub fn is_bad(&self) -> bool {
        payload::is_known_bad(&self.sig_id)
    }

    #[must_use]
    pub fn revocations(&self) -> Option<&RevokeSection> {
        self.inner
            .as_ref()
            .and_then(|i| i.body.revoke.as_ref())
            .filter(|r| !r.is_empty())
    }

    #[must_use]
    pub fn has_revocations(&self) -> bool {
        self.revocations().is_some()
    }

    /// Whether the link participates in the high-skip chain, either by
    /// type or by carrying revocations.
    #[must_use]
    pub fn is_high(&self) -> bool {
        self.link_type.is_high() || self.has_revocations()
    }

    #[must_use]
    pub fn is_chain_verified(&self) -> bool {
        self.chain_verified
    }

    #[must_use]
    pub fn is_sig_verified(&self) -> bool {
        self.sig_verified
    }

    #[must_use]
    pub fn is_own_new_link_from_server(&self) -> bool {
        self.is_own_new_link_from_server
    }

    #[must_use]
    pub fn cki_cache(&self) -> Option<&Arc<ComputedKeyInfos>> {
        self.cki_cache.as_ref()
    }

    /// The bytes the link's signature covers: the outer form for v2, the
    /// inner payload for v1. `None` for stubbed links.
    #[must_use]
    pub fn signature_payload(&self) -> Option<&[u8]> {
        if self.is_stubbed() {
            return None;
        }
        match self.sig_version {
            2 => self.outer_bytes.as_deref(),
            _ => self.payload_bytes.as_deref(),
        }
    }

    #[must_use]
    pub fn signature(&self) -> Option<&[u8]> {
        self.sig.as_deref()
    }

    /// The inner payload re-serialized with the delegation section's
    /// `reverse_sig` nulled out: the bytes the newly delegated key
    /// countersigned. Serialization is canonical (sorted keys, compact).
    pub fn reverse_sig_payload(&self) -> Result<Vec<u8>, LinkError> {
        let seqno = self.seqno;
        let bytes = self.payload_bytes.as_deref().ok_or(LinkError::MissingField {
            field: "payload_json",
            seqno,
        })?;
        let mut value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| LinkError::Parse {
                seqno,
                reason: format!("inner payload: {e}"),
            })?;
        let section = match self.payload {
            Some(LinkPayload::Sibkey { .. }) => "sibkey",
            Some(LinkPayload::PerUserKey { .. }) => "per_user_key",
            _ => {
                return Err(LinkError::MissingSection {
                    link_type: self.link_type.as_wire().to_string(),
                    field: "reverse_sig",
                })
            }
        };
        if let Some(sec) = value
            .get_mut("body")
            .and_then(|b| b.get_mut(section))
            .and_then(|s| s.as_object_mut())
        {
            sec.insert("reverse_sig".to_string(), serde_json::Value::Null);
        }
        serde_json::to_vec(&value).map_err(|e| LinkError::Parse {
            seqno,
            reason: format!("reverse sig payload: {e}"),
        })
    }

    /// Whether this link is the tail a merkle triple attests to.
    #[must_use]
    pub fn matches_triple(&self, t: &MerkleTriple) -> bool {
        self.seqno == t.seqno
            && self.id == t.link_id
            && t.sig_id.as_ref().map_or(true, |s| *s == self.sig_id)
    }

    #[must_use]
    pub fn to_merkle_triple(&self) -> MerkleTriple {
        MerkleTriple::new(self.seqno, self.id, Some(self.sig_id.clone()))
    }

    /// The high-prev a successor link must declare: this link's own
    /// position if it is high, else the value computed at this link
    /// during the forward pass. `None` when that state is unavailable
    /// (fresh import from storage); the verifier maps that to a full
    /// reverification.
    #[must_use]
    pub fn expected_next_high_prev(&self) -> Option<HighSkip> {
        if self.is_high() {
            Some(HighSkip::new(self.seqno, self.id))
        } else {
            self.computed_high_prev.clone()
        }
    }

    /// Serialized form for the local store.
    #[must_use]
    pub fn to_stored(&self) -> StoredLink {
        StoredLink {
            raw: self.raw.clone(),
            chain_verified: self.chain_verified,
            sig_verified: self.sig_verified,
        }
    }
}
