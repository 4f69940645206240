use serde::{Deserialize, Serialize};

use crate::link::LinkError;
use crate::{Kid, SigId, Username};

/// Links whose payloads were historically served corrupted. Replay skips
/// them instead of failing the whole chain.
const KNOWN_BAD_SIG_IDS: [&str; 2] = [
    "f6a1c7d04e1a2b8e33d09b6f1d9f5c4b72aa10588c8f3ec29de6be0a6be9340f0f",
    "3c51d9152f4a6a18ea6bd9a07f39c1f5d84cbb27d90b1571e4f0a6660bdcd2a50f",
];

/// Returns whether a sig id belongs to the embedded known-bad set.
#[must_use]
pub fn is_known_bad(sig_id: &SigId) -> bool {
    KNOWN_BAD_SIG_IDS.contains(&sig_id.as_str())
}

/// One member of the known-bad set, for exercising the skip path.
#[cfg(test)]
pub(crate) fn test_bad_sig_id() -> SigId {
    SigId::new(KNOWN_BAD_SIG_IDS[0])
}

/// Semantic link type, classified from the wire `type` string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkType {
    Eldest,
    Sibkey,
    Subkey,
    Revoke,
    PgpUpdate,
    PerUserKey,
    Device,
    WalletStellar,
    Track,
    Other(String),
}

impl LinkType {
    #[must_use]
    pub fn from_wire(name: &str) -> Self {
        match name {
            "eldest" => Self::Eldest,
            "sibkey" => Self::Sibkey,
            "subkey" => Self::Subkey,
            "revoke" => Self::Revoke,
            "pgp_update" => Self::PgpUpdate,
            "per_user_key" => Self::PerUserKey,
            "device" => Self::Device,
            "wallet.stellar" => Self::WalletStellar,
            "track" => Self::Track,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_wire(&self) -> &str {
        match self {
            Self::Eldest => "eldest",
            Self::Sibkey => "sibkey",
            Self::Subkey => "subkey",
            Self::Revoke => "revoke",
            Self::PgpUpdate => "pgp_update",
            Self::PerUserKey => "per_user_key",
            Self::Device => "device",
            Self::WalletStellar => "wallet.stellar",
            Self::Track => "track",
            Self::Other(name) => name,
        }
    }

    /// Types the server may send as outer-only stubs. Key-material types
    /// must always arrive inflated.
    #[must_use]
    pub fn allows_stubbing(&self) -> bool {
        matches!(self, Self::Track | Self::WalletStellar | Self::Other(_))
    }

    /// Types that participate in the high-skip chain.
    #[must_use]
    pub fn is_high(&self) -> bool {
        matches!(
            self,
            Self::Eldest | Self::Sibkey | Self::Subkey | Self::Revoke | Self::PgpUpdate
        )
    }
}

/// Key section common to every inner payload: who signed, under which
/// eldest key, and for which account.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeySection {
    pub uid: crate::Uid,
    pub username: Username,
    pub kid: Kid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eldest_kid: Option<Kid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SibkeySection {
    pub kid: Kid,
    #[serde(default)]
    pub reverse_sig: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubkeySection {
    pub kid: Kid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_kid: Option<Kid>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RevokeSection {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kids: Vec<Kid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sig_ids: Vec<SigId>,
}

impl RevokeSection {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kids.is_empty() && self.sig_ids.is_empty()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PgpUpdateSection {
    pub kid: Kid,
    pub full_hash: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PerUserKeySection {
    pub kid: Kid,
    pub encryption_kid: Kid,
    pub generation: u32,
    #[serde(default)]
    pub reverse_sig: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSection {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<Kid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalletSection {
    pub address: String,
    pub network: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<Username>,
}

/// Body of an inner payload. The `type` string selects which optional
/// section is meaningful; a `revoke` section may additionally ride on a
/// link of any type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InnerBody {
    #[serde(rename = "type")]
    pub link_type: String,
    pub key: KeySection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sibkey: Option<SibkeySection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subkey: Option<SubkeySection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke: Option<RevokeSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgp_update: Option<PgpUpdateSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_user_key: Option<PerUserKeySection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<WalletSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<TrackSection>,
}

/// Classified payload driving the evaluator's dispatch.
#[derive(Clone, Debug)]
pub enum LinkPayload {
    Eldest {
        kid: Kid,
    },
    Sibkey {
        kid: Kid,
        reverse_sig: Option<String>,
    },
    Subkey {
        kid: Kid,
    },
    Revoke,
    PgpUpdate {
        kid: Kid,
        full_hash: String,
    },
    PerUserKey {
        kid: Kid,
        encryption_kid: Kid,
        generation: u32,
        reverse_sig: Option<String>,
    },
    Device {
        device: DeviceSection,
    },
    WalletStellar {
        address: String,
        network: String,
    },
    Track,
    Other,
}

impl LinkPayload {
    /// Classifies an inner body, checking that the section its type
    /// requires is present.
    pub fn classify(body: &InnerBody) -> Result<Self, LinkError> {
        let link_type = LinkType::from_wire(&body.link_type);
        let missing = |field: &'static str| LinkError::MissingSection {
            link_type: body.link_type.clone(),
            field,
        };
        Ok(match link_type {
            LinkType::Eldest => Self::Eldest {
                kid: body.key.kid.clone(),
            },
            LinkType::Sibkey => {
                let s = body.sibkey.as_ref().ok_or_else(|| missing("sibkey"))?;
                Self::Sibkey {
                    kid: s.kid.clone(),
                    reverse_sig: s.reverse_sig.clone(),
                }
            }
            LinkType::Subkey => {
                let s = body.subkey.as_ref().ok_or_else(|| missing("subkey"))?;
                Self::Subkey { kid: s.kid.clone() }
            }
            LinkType::Revoke => {
                if body.revoke.as_ref().map_or(true, RevokeSection::is_empty) {
                    return Err(missing("revoke"));
                }
                Self::Revoke
            }
            LinkType::PgpUpdate => {
                let s = body
                    .pgp_update
                    .as_ref()
                    .ok_or_else(|| missing("pgp_update"))?;
                Self::PgpUpdate {
                    kid: s.kid.clone(),
                    full_hash: s.full_hash.clone(),
                }
            }
            LinkType::PerUserKey => {
                let s = body
                    .per_user_key
                    .as_ref()
                    .ok_or_else(|| missing("per_user_key"))?;
                Self::PerUserKey {
                    kid: s.kid.clone(),
                    encryption_kid: s.encryption_kid.clone(),
                    generation: s.generation,
                    reverse_sig: s.reverse_sig.clone(),
                }
            }
            LinkType::Device => {
                let s = body.device.as_ref().ok_or_else(|| missing("device"))?;
                Self::Device { device: s.clone() }
            }
            LinkType::WalletStellar => {
                let s = body.wallet.as_ref().ok_or_else(|| missing("wallet"))?;
                Self::WalletStellar {
                    address: s.address.clone(),
                    network: s.network.clone(),
                }
            }
            LinkType::Track => Self::Track,
            LinkType::Other(_) => Self::Other,
        })
    }

    /// Whether this payload installs a new key (sibkey or subkey).
    /// Eldest registration and per-user keys are handled separately.
    #[must_use]
    pub fn is_delegating(&self) -> bool {
        matches!(self, Self::Sibkey { .. } | Self::Subkey { .. })
    }

    /// The reverse signature the payload carries, with the kid expected
    /// to have produced it.
    #[must_use]
    pub fn reverse_sig(&self) -> Option<(&Kid, Option<&str>)> {
        match self {
            Self::Sibkey { kid, reverse_sig } => Some((kid, reverse_sig.as_deref())),
            Self::PerUserKey {
                kid, reverse_sig, ..
            } => Some((kid, reverse_sig.as_deref())),
            _ => None,
        }
    }
}
