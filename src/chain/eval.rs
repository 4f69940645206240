use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::crypto::{CryptoError, Verifier};
use crate::keystate::{ComputedKeyInfos, Delegation, KeyFamily, KeyRole, PerUserKeyInfo};
use crate::link::{ChainLink, LinkError, LinkPayload, LinkType};
use crate::{Kid, Seqno};

/// Errors raised while replaying a subchain over a key family.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("subchain evaluation requires at least one link")]
    EmptySubchain,
    #[error("first link of a subchain may not be stubbed")]
    StubbedFirstLink,
    #[error("stubbed link of type {link_type} needs its signature")]
    StubbedSignatureNeeded { link_type: String },
    #[error("stubbed wallet link after an inflated one")]
    StubbedDisallowed,
    #[error("wallet links require sig_version >= 2 (got {got})")]
    SigchainV2Required { got: u8 },
    #[error("link at seqno {seqno} signed by unusable key {kid}")]
    InactiveSigningKey { seqno: Seqno, kid: Kid },
    #[error("signature rejected at seqno {seqno}")]
    SignatureInvalid {
        seqno: Seqno,
        #[source]
        source: CryptoError,
    },
    #[error("reverse signature missing at seqno {seqno}")]
    ReverseSignatureMissing { seqno: Seqno },
    #[error("reverse signature rejected at seqno {seqno}")]
    ReverseSignatureInvalid {
        seqno: Seqno,
        #[source]
        source: CryptoError,
    },
    #[error("delegation rejected at seqno {seqno}: {reason}")]
    DelegationInvalid { seqno: Seqno, reason: String },
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Replays one subchain, producing the key state at its tail.
///
/// Returns `(cached, cki)`; `cached` is true when the tail already
/// carried a current-version snapshot and no replay was needed. On a
/// full replay the resulting snapshot is cached on the tail link.
pub(crate) fn verify_subchain(
    kf: &KeyFamily,
    links: &mut [ChainLink],
    verifier: &dyn Verifier,
) -> Result<(bool, Arc<ComputedKeyInfos>), EvalError> {
    if links.is_empty() {
        return Err(EvalError::EmptySubchain);
    }

    if let Some(cached) = links.last().and_then(ChainLink::cki_cache) {
        if cached.is_stale_version() {
            debug!(version = cached.version(), "ignoring stale cached key state");
        } else {
            return Ok((true, cached.clone()));
        }
    }

    let mut cki = ComputedKeyInfos::new();
    let mut first = true;
    let mut seen_inflated_wallet = false;
    let len = links.len();

    for idx in 0..len {
        let link = &links[idx];
        if link.is_bad() {
            debug!(sig_id = %link.sig_id(), "skipping known-bad link");
            continue;
        }

        if link.is_stubbed() {
            if first {
                return Err(EvalError::StubbedFirstLink);
            }
            if !link.link_type().allows_stubbing() {
                return Err(EvalError::StubbedSignatureNeeded {
                    link_type: link.link_type().as_wire().to_string(),
                });
            }
            if matches!(link.link_type(), LinkType::WalletStellar) && seen_inflated_wallet {
                // The server must not be able to roll back the active
                // wallet address by stubbing newer wallet links.
                return Err(EvalError::StubbedDisallowed);
            }
            continue;
        }

        let seqno = link.seqno();
        let ctime = link.ctime();
        let payload = link.payload().cloned().ok_or(LinkError::MissingField {
            field: "payload_json",
            seqno,
        })?;

        if first {
            register_eldest(&mut cki, link)?;
            first = false;
        }

        let is_delegating = payload.is_delegating();
        let is_modifying = is_delegating || matches!(payload, LinkPayload::PgpUpdate { .. });
        let is_final = idx == len - 1;
        let has_revocations = link.has_revocations();

        if let LinkPayload::PgpUpdate { kid, full_hash } = &payload {
            cki.set_active_pgp_hash(kid, full_hash.clone());
        }

        // Signatures are only checked on links that can change key
        // state, plus the final link. This must happen before
        // revocations are applied: a link may revoke its own signer.
        if is_modifying || is_final || has_revocations {
            verify_sig_with_key_family(&links[idx], kf, &cki, verifier)?;
            links[idx].sig_verified = true;
        }

        let link = &links[idx];

        if is_delegating {
            let (kid, role) = match &payload {
                LinkPayload::Sibkey { kid, .. } => (kid, KeyRole::Sibkey),
                LinkPayload::Subkey { kid } => (kid, KeyRole::Subkey),
                _ => unreachable!("is_delegating covers sibkey and subkey only"),
            };
            if !kf.contains(kid) {
                return Err(EvalError::DelegationInvalid {
                    seqno,
                    reason: format!("delegated kid {kid} is not in the key family"),
                });
            }
            cki.delegate(Delegation {
                kid: kid.clone(),
                role,
                sig_id: Some(link.sig_id().clone()),
                signer: link.signing_kid().cloned(),
                delegated_at: ctime,
                first_appeared: Some(seqno),
                hash_meta: None,
            });
        }

        if let LinkPayload::PerUserKey {
            kid,
            encryption_kid,
            generation,
            ..
        } = &payload
        {
            cki.delegate_per_user_key(PerUserKeyInfo {
                generation: *generation,
                signing_kid: kid.clone(),
                encryption_kid: encryption_kid.clone(),
                seqno,
            })
            .map_err(|e| EvalError::DelegationInvalid {
                seqno,
                reason: e.to_string(),
            })?;
        }

        if let LinkPayload::WalletStellar { .. } = &payload {
            // Wallet links must be v2 so they can be stubbed for privacy
            // later.
            if link.sig_version() < 2 {
                return Err(EvalError::SigchainV2Required {
                    got: link.sig_version(),
                });
            }
            seen_inflated_wallet = true;
        }

        // The delegated key countersigns the statement, proving it
        // cooperated in its own delegation.
        if let Some((delegated, reverse_sig)) = payload.reverse_sig() {
            let reverse_sig =
                reverse_sig.ok_or(EvalError::ReverseSignatureMissing { seqno })?;
            let sig_bytes = hex::decode(reverse_sig).map_err(|_| {
                EvalError::ReverseSignatureInvalid {
                    seqno,
                    source: CryptoError::MalformedSignature,
                }
            })?;
            let nulled = link.reverse_sig_payload()?;
            verifier
                .verify_reverse_signature(delegated, &nulled, &sig_bytes)
                .map_err(|source| EvalError::ReverseSignatureInvalid { seqno, source })?;
        }

        if let Some(revoke) = link.revocations().cloned() {
            for kid in &revoke.kids {
                cki.revoke_kid(kid, ctime);
            }
            for sig_id in &revoke.sig_ids {
                cki.revoke_sig(sig_id, ctime);
            }
        }

        if let LinkPayload::Device { device } = payload {
            cki.update_device(device);
        }
    }

    let cki = Arc::new(cki);
    links[len - 1].cki_cache = Some(cki.clone());
    Ok((false, cki))
}

/// The first inflated link of a subchain registers the eldest key, and
/// must itself be signed by it.
fn register_eldest(cki: &mut ComputedKeyInfos, link: &ChainLink) -> Result<(), EvalError> {
    let seqno = link.seqno();
    let eldest = link
        .to_eldest_kid()
        .cloned()
        .ok_or_else(|| EvalError::DelegationInvalid {
            seqno,
            reason: "first link of subchain names no eldest key".to_string(),
        })?;
    if link.signing_kid() != Some(&eldest) {
        return Err(EvalError::DelegationInvalid {
            seqno,
            reason: "first link of subchain is not signed by its eldest key".to_string(),
        });
    }
    cki.insert_eldest_link(eldest, link.ctime(), seqno);
    Ok(())
}

fn verify_sig_with_key_family(
    link: &ChainLink,
    kf: &KeyFamily,
    cki: &ComputedKeyInfos,
    verifier: &dyn Verifier,
) -> Result<(), EvalError> {
    let seqno = link.seqno();
    let kid = link.signing_kid().ok_or(LinkError::MissingField {
        field: "kid",
        seqno,
    })?;
    if !kf.contains(kid) || !cki.is_kid_active(kid) {
        return Err(EvalError::InactiveSigningKey {
            seqno,
            kid: kid.clone(),
        });
    }
    let payload = link.signature_payload().ok_or(LinkError::MissingField {
        field: "payload_json",
        seqno,
    })?;
    let sig = link.signature().ok_or(LinkError::MissingField {
        field: "sig",
        seqno,
    })?;
    verifier
        .verify_signature(kid, payload, sig)
        .map_err(|source| EvalError::SignatureInvalid { seqno, source })
}
