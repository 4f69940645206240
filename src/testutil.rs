//! Test support: builds real signed chains in the exact wire format the
//! importer parses, plus in-memory capability fakes for loader tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use libp2p_identity::ed25519;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::crypto::{Ed25519Verifier, Sha256Hasher};
use crate::keystate::KeyFamily;
use crate::link::payload::{
    InnerBody, KeySection, PerUserKeySection, RevokeSection, SibkeySection, TrackSection,
    WalletSection,
};
use crate::link::{ChainLink, HighSkip, InnerLink, OuterLink, RawLink, StoredLink};
use crate::merkle::{MerkleOracle, MerkleTriple, MerkleUserLeaf};
use crate::store::{DbType, LocalStore};
use crate::transport::{SigGetResponse, Transport};
use crate::{Kid, LinkId, Seqno, SigId, Uid, Username};

/// Canonical JSON: sorted keys, compact. Signatures and link ids in the
/// tests cover exactly these bytes.
fn canonical<T: Serialize>(value: &T) -> String {
    let v = serde_json::to_value(value).expect("serializable");
    serde_json::to_string(&v).expect("canonical json")
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let out = Sha256::digest(bytes);
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

#[derive(Default)]
struct PushOpts {
    stubbed: bool,
    garbage_sig: bool,
    sig_id_override: Option<SigId>,
    high_skip_override: Option<HighSkip>,
    seqno_gap: bool,
}

/// Builds syntactically and cryptographically valid chains link by link.
pub(crate) struct ChainBuilder {
    uid: Uid,
    username: Username,
    keys: BTreeMap<Kid, ed25519::Keypair>,
    eldest: Kid,
    links: Vec<RawLink>,
    ids: Vec<LinkId>,
    next_seqno: Seqno,
    prev: Option<LinkId>,
    next_high_prev: HighSkip,
    ctime: u64,
}

impl ChainBuilder {
    pub fn new(username: &str) -> Self {
        let digest = sha256(username.as_bytes());
        let uid = Uid::new(format!("{}19", hex::encode(&digest[..15])));
        let eldest_kp = ed25519::Keypair::generate();
        let eldest = Ed25519Verifier::kid_for(&eldest_kp.public());
        let mut keys = BTreeMap::new();
        keys.insert(eldest.clone(), eldest_kp);
        Self {
            uid,
            username: Username::new(username),
            keys,
            eldest,
            links: Vec::new(),
            ids: Vec::new(),
            next_seqno: 1,
            prev: None,
            next_high_prev: HighSkip::initial(),
            ctime: 1_500_000_000,
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid.clone()
    }

    pub fn username(&self) -> Username {
        self.username.clone()
    }

    /// The current eldest kid (changes across resets).
    pub fn eldest_kid(&self) -> Kid {
        self.eldest.clone()
    }

    pub fn key_family(&self) -> KeyFamily {
        KeyFamily::from_kids(self.keys.keys().cloned())
    }

    pub fn raw_links(&self) -> &[RawLink] {
        &self.links
    }

    pub fn raw_links_after(&self, low: Seqno) -> Vec<RawLink> {
        self.links
            .iter()
            .filter(|l| l.seqno > low)
            .cloned()
            .collect()
    }

    pub fn import_all(&self) -> Vec<ChainLink> {
        self.links
            .iter()
            .map(|raw| {
                ChainLink::import_from_server(raw.clone(), &Sha256Hasher, None)
                    .expect("builder link imports")
            })
            .collect()
    }

    pub fn tail_triple(&self) -> MerkleTriple {
        let raw = self.links.last().expect("at least one link");
        let id = *self.ids.last().expect("id recorded");
        MerkleTriple::new(raw.seqno, id, Some(raw.sig_id.clone()))
    }

    pub fn leaf(&self) -> MerkleUserLeaf {
        MerkleUserLeaf {
            public: self.links.last().map(|_| self.tail_triple()),
            private: None,
            eldest: Some(self.eldest.clone()),
        }
    }

    fn keypair(&self, kid: &Kid) -> &ed25519::Keypair {
        self.keys.get(kid).expect("known signing key")
    }

    fn base_body(&self, link_type: &str, signer: &Kid, omit_eldest_kid: bool) -> InnerBody {
        InnerBody {
            link_type: link_type.to_string(),
            key: KeySection {
                uid: self.uid.clone(),
                username: self.username.clone(),
                kid: signer.clone(),
                eldest_kid: if omit_eldest_kid {
                    None
                } else {
                    Some(self.eldest.clone())
                },
            },
            sibkey: None,
            subkey: None,
            revoke: None,
            pgp_update: None,
            per_user_key: None,
            device: None,
            wallet: None,
            track: None,
        }
    }

    fn is_high_body(&self, body: &InnerBody) -> bool {
        matches!(
            body.link_type.as_str(),
            "eldest" | "sibkey" | "subkey" | "revoke" | "pgp_update"
        ) || body.revoke.as_ref().map_or(false, |r| !r.is_empty())
    }

    fn next_positions(&self, opts: &PushOpts) -> (Seqno, u64) {
        let seqno = if opts.seqno_gap {
            self.next_seqno + 1
        } else {
            self.next_seqno
        };
        let ctime = self.ctime + seqno;
        (seqno, ctime)
    }

    fn finish(&mut self, seqno: Seqno, id: LinkId, raw: RawLink, high: bool) {
        self.links.push(raw);
        self.ids.push(id);
        self.prev = Some(id);
        self.next_seqno = seqno + 1;
        if high {
            self.next_high_prev = HighSkip::new(seqno, id);
        }
    }

    fn push_v1(&mut self, body: InnerBody, signer: &Kid, opts: PushOpts) {
        let (seqno, ctime) = self.next_positions(&opts);
        let high = self.is_high_body(&body);
        let inner = InnerLink {
            seqno,
            prev: self.prev,
            ctime: Some(ctime),
            high_skip: None,
            body,
        };
        let payload_json = canonical(&inner);
        let sig = self.keypair(signer).sign(payload_json.as_bytes());
        let sig_id = opts
            .sig_id_override
            .unwrap_or_else(|| SigId::new(format!("{}0f", hex::encode(sha256(&sig)))));
        let id = LinkId::new(sha256(payload_json.as_bytes()));
        let raw = RawLink {
            seqno,
            sig_version: 1,
            sig_id,
            sig: Some(hex::encode(&sig)),
            payload_json: Some(payload_json),
            outer_json: None,
        };
        self.finish(seqno, id, raw, high);
    }

    fn push_v2(&mut self, body: InnerBody, signer: &Kid, opts: PushOpts) {
        let (seqno, ctime) = self.next_positions(&opts);
        let high = self.is_high_body(&body);
        let eldest_kid = body.key.eldest_kid.clone();
        let link_type = body.link_type.clone();
        let inner = InnerLink {
            seqno,
            prev: self.prev,
            ctime: Some(ctime),
            high_skip: None,
            body,
        };
        let payload_json = canonical(&inner);
        let curr = LinkId::new(sha256(payload_json.as_bytes()));
        let outer = OuterLink {
            version: 2,
            seqno,
            prev: self.prev,
            curr,
            link_type,
            eldest_kid,
            high_skip: Some(
                opts.high_skip_override
                    .clone()
                    .unwrap_or_else(|| self.next_high_prev.clone()),
            ),
        };
        let outer_json = canonical(&outer);
        let id = LinkId::new(sha256(outer_json.as_bytes()));
        let sig = if opts.garbage_sig {
            vec![0u8; 64]
        } else {
            self.keypair(signer).sign(outer_json.as_bytes())
        };
        let sig_id = opts
            .sig_id_override
            .unwrap_or_else(|| SigId::new(format!("{}0f", hex::encode(sha256(&sig)))));
        let raw = if opts.stubbed {
            RawLink {
                seqno,
                sig_version: 2,
                sig_id,
                sig: None,
                payload_json: None,
                outer_json: Some(outer_json),
            }
        } else {
            RawLink {
                seqno,
                sig_version: 2,
                sig_id,
                sig: Some(hex::encode(&sig)),
                payload_json: Some(payload_json),
                outer_json: Some(outer_json),
            }
        };
        self.finish(seqno, id, raw, high);
    }

    /// Signs `body` with a reverse signature from `delegated` placed in
    /// the section `patch` selects, then pushes the v2 link.
    fn push_v2_with_reverse_sig(
        &mut self,
        mut body: InnerBody,
        signer: &Kid,
        delegated_kp: &ed25519::Keypair,
        patch: fn(&mut InnerBody, Option<String>),
    ) {
        let seqno = self.next_seqno;
        let ctime = self.ctime + seqno;
        patch(&mut body, None);
        let draft = InnerLink {
            seqno,
            prev: self.prev,
            ctime: Some(ctime),
            high_skip: None,
            body: body.clone(),
        };
        let reverse_sig = hex::encode(delegated_kp.sign(canonical(&draft).as_bytes()));
        patch(&mut body, Some(reverse_sig));
        self.push_v2(body, signer, PushOpts::default());
    }

    pub fn eldest(&mut self) {
        let signer = self.eldest.clone();
        let body = self.base_body("eldest", &signer, false);
        self.push_v2(body, &signer, PushOpts::default());
    }

    pub fn eldest_v1(&mut self) {
        // Old first links carried no eldest_kid; the signer is assumed
        // eldest.
        let signer = self.eldest.clone();
        let body = self.base_body("eldest", &signer, true);
        self.push_v1(body, &signer, PushOpts::default());
    }

    /// Starts a new subchain the modern way: fresh eldest key plus an
    /// explicit `eldest` link.
    pub fn reset_with_eldest_link(&mut self) {
        let kp = ed25519::Keypair::generate();
        let kid = Ed25519Verifier::kid_for(&kp.public());
        self.keys.insert(kid.clone(), kp);
        self.eldest = kid.clone();
        let body = self.base_body("eldest", &kid, false);
        self.push_v2(body, &kid, PushOpts::default());
    }

    /// Starts a new subchain the ancient way: a plain v1 link signed by
    /// a brand-new key, with no eldest marker at all.
    pub fn reset_v1_new_eldest(&mut self) {
        let kp = ed25519::Keypair::generate();
        let kid = Ed25519Verifier::kid_for(&kp.public());
        self.keys.insert(kid.clone(), kp);
        self.eldest = kid.clone();
        let mut body = self.base_body("track", &kid, true);
        body.track = Some(TrackSection { username: None });
        self.push_v1(body, &kid, PushOpts::default());
    }

    fn track_body(&self, name: &str) -> InnerBody {
        let signer = self.eldest.clone();
        let mut body = self.base_body("track", &signer, false);
        body.track = Some(TrackSection {
            username: Some(Username::new(name)),
        });
        body
    }

    pub fn track(&mut self, name: &str) {
        let signer = self.eldest.clone();
        let body = self.track_body(name);
        self.push_v2(body, &signer, PushOpts::default());
    }

    pub fn track_stubbed(&mut self, name: &str) {
        let signer = self.eldest.clone();
        let body = self.track_body(name);
        self.push_v2(
            body,
            &signer,
            PushOpts {
                stubbed: true,
                ..PushOpts::default()
            },
        );
    }

    pub fn track_v1(&mut self, name: &str) {
        let signer = self.eldest.clone();
        let mut body = self.base_body("track", &signer, true);
        body.track = Some(TrackSection {
            username: Some(Username::new(name)),
        });
        self.push_v1(body, &signer, PushOpts::default());
    }

    pub fn track_v1_with_sig_id(&mut self, name: &str, sig_id: &str) {
        let signer = self.eldest.clone();
        let mut body = self.base_body("track", &signer, true);
        body.track = Some(TrackSection {
            username: Some(Username::new(name)),
        });
        self.push_v1(
            body,
            &signer,
            PushOpts {
                sig_id_override: Some(SigId::new(sig_id)),
                ..PushOpts::default()
            },
        );
    }

    pub fn track_with_garbage_sig(&mut self, name: &str) {
        let signer = self.eldest.clone();
        let body = self.track_body(name);
        self.push_v2(
            body,
            &signer,
            PushOpts {
                garbage_sig: true,
                ..PushOpts::default()
            },
        );
    }

    pub fn track_with_garbage_sig_and_id(&mut self, name: &str, sig_id: SigId) {
        let signer = self.eldest.clone();
        let body = self.track_body(name);
        self.push_v2(
            body,
            &signer,
            PushOpts {
                garbage_sig: true,
                sig_id_override: Some(sig_id),
                ..PushOpts::default()
            },
        );
    }

    pub fn track_with_seqno_gap(&mut self, name: &str) {
        let signer = self.eldest.clone();
        let body = self.track_body(name);
        self.push_v2(
            body,
            &signer,
            PushOpts {
                seqno_gap: true,
                ..PushOpts::default()
            },
        );
    }

    pub fn track_with_bogus_high_skip(&mut self, name: &str) {
        let signer = self.eldest.clone();
        let body = self.track_body(name);
        self.push_v2(
            body,
            &signer,
            PushOpts {
                high_skip_override: Some(HighSkip::new(1, LinkId::new([0xee; 32]))),
                ..PushOpts::default()
            },
        );
    }

    /// Delegates a fresh sibkey with a valid reverse signature and
    /// returns its kid.
    pub fn sibkey(&mut self) -> Kid {
        let signer = self.eldest.clone();
        self.sibkey_signed_by(&signer)
    }

    pub fn sibkey_signed_by(&mut self, signer: &Kid) -> Kid {
        let kp = ed25519::Keypair::generate();
        let kid = Ed25519Verifier::kid_for(&kp.public());
        self.keys.insert(kid.clone(), kp.clone());
        let signer = signer.clone();
        let mut body = self.base_body("sibkey", &signer, false);
        body.sibkey = Some(SibkeySection {
            kid: kid.clone(),
            reverse_sig: None,
        });
        self.push_v2_with_reverse_sig(body, &signer, &kp, |body, rsig| {
            if let Some(s) = body.sibkey.as_mut() {
                s.reverse_sig = rsig;
            }
        });
        kid
    }

    pub fn sibkey_without_reverse_sig(&mut self) -> Kid {
        let signer = self.eldest.clone();
        let kp = ed25519::Keypair::generate();
        let kid = Ed25519Verifier::kid_for(&kp.public());
        self.keys.insert(kid.clone(), kp);
        let mut body = self.base_body("sibkey", &signer, false);
        body.sibkey = Some(SibkeySection {
            kid: kid.clone(),
            reverse_sig: None,
        });
        self.push_v2(body, &signer, PushOpts::default());
        kid
    }

    pub fn sibkey_with_bad_reverse_sig(&mut self) -> Kid {
        let signer = self.eldest.clone();
        let kp = ed25519::Keypair::generate();
        let kid = Ed25519Verifier::kid_for(&kp.public());
        self.keys.insert(kid.clone(), kp.clone());
        let mut body = self.base_body("sibkey", &signer, false);
        body.sibkey = Some(SibkeySection {
            kid: kid.clone(),
            // Signed over the wrong bytes.
            reverse_sig: Some(hex::encode(kp.sign(b"not the link payload"))),
        });
        self.push_v2(body, &signer, PushOpts::default());
        kid
    }

    pub fn sibkey_stubbed(&mut self) -> Kid {
        let signer = self.eldest.clone();
        let kp = ed25519::Keypair::generate();
        let kid = Ed25519Verifier::kid_for(&kp.public());
        self.keys.insert(kid.clone(), kp.clone());
        let mut body = self.base_body("sibkey", &signer, false);
        body.sibkey = Some(SibkeySection {
            kid: kid.clone(),
            reverse_sig: None,
        });
        self.push_v2(
            body,
            &signer,
            PushOpts {
                stubbed: true,
                ..PushOpts::default()
            },
        );
        kid
    }

    pub fn revoke_kid(&mut self, kid: &Kid) {
        let signer = self.eldest.clone();
        self.revoke_kid_signed_by(kid, &signer);
    }

    pub fn revoke_kid_signed_by(&mut self, kid: &Kid, signer: &Kid) {
        let signer = signer.clone();
        let mut body = self.base_body("revoke", &signer, false);
        body.revoke = Some(RevokeSection {
            kids: vec![kid.clone()],
            sig_ids: Vec::new(),
        });
        self.push_v2(body, &signer, PushOpts::default());
    }

    pub fn wallet(&mut self, address: &str) {
        let signer = self.eldest.clone();
        let mut body = self.base_body("wallet.stellar", &signer, false);
        body.wallet = Some(WalletSection {
            address: address.to_string(),
            network: "stellar".to_string(),
        });
        self.push_v2(body, &signer, PushOpts::default());
    }

    pub fn wallet_stubbed(&mut self, address: &str) {
        let signer = self.eldest.clone();
        let mut body = self.base_body("wallet.stellar", &signer, false);
        body.wallet = Some(WalletSection {
            address: address.to_string(),
            network: "stellar".to_string(),
        });
        self.push_v2(
            body,
            &signer,
            PushOpts {
                stubbed: true,
                ..PushOpts::default()
            },
        );
    }

    pub fn wallet_v1(&mut self, address: &str) {
        let signer = self.eldest.clone();
        let mut body = self.base_body("wallet.stellar", &signer, false);
        body.wallet = Some(WalletSection {
            address: address.to_string(),
            network: "stellar".to_string(),
        });
        self.push_v1(body, &signer, PushOpts::default());
    }

    pub fn per_user_key(&mut self, generation: u32) {
        let signer = self.eldest.clone();
        let kp = ed25519::Keypair::generate();
        let kid = Ed25519Verifier::kid_for(&kp.public());
        let enc_kp = ed25519::Keypair::generate();
        let enc_kid = Kid::new(format!(
            "0121{}0a",
            hex::encode(enc_kp.public().to_bytes())
        ));
        let mut body = self.base_body("per_user_key", &signer, false);
        body.per_user_key = Some(PerUserKeySection {
            kid: kid.clone(),
            encryption_kid: enc_kid,
            generation,
            reverse_sig: None,
        });
        self.push_v2_with_reverse_sig(body, &signer, &kp, |body, rsig| {
            if let Some(s) = body.per_user_key.as_mut() {
                s.reverse_sig = rsig;
            }
        });
    }
}

/// In-memory [`LocalStore`] fake.
#[derive(Default)]
pub(crate) struct MemoryStore {
    tails: Mutex<HashMap<(DbType, Uid), MerkleTriple>>,
    links: Mutex<HashMap<(Uid, LinkId), StoredLink>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_tail(&self, db: DbType, uid: &Uid, tail: MerkleTriple) {
        self.tails
            .lock()
            .expect("tails lock")
            .insert((db, uid.clone()), tail);
    }

    pub fn seed_link(&self, uid: &Uid, id: LinkId, link: StoredLink) {
        self.links
            .lock()
            .expect("links lock")
            .insert((uid.clone(), id), link);
    }

    pub fn tail(&self, db: DbType, uid: &Uid) -> Option<MerkleTriple> {
        self.tails
            .lock()
            .expect("tails lock")
            .get(&(db, uid.clone()))
            .cloned()
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().expect("links lock").len()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get_tail(&self, db: DbType, uid: &Uid) -> AnyResult<Option<MerkleTriple>> {
        Ok(self.tail(db, uid))
    }

    async fn put_tail(&self, db: DbType, uid: &Uid, tail: &MerkleTriple) -> AnyResult<()> {
        self.seed_tail(db, uid, tail.clone());
        Ok(())
    }

    async fn get_link(&self, uid: &Uid, id: &LinkId) -> AnyResult<Option<StoredLink>> {
        Ok(self
            .links
            .lock()
            .expect("links lock")
            .get(&(uid.clone(), *id))
            .cloned())
    }

    async fn put_link(&self, uid: &Uid, id: &LinkId, link: &StoredLink) -> AnyResult<bool> {
        let mut links = self.links.lock().expect("links lock");
        let key = (uid.clone(), *id);
        if links.contains_key(&key) {
            return Ok(false);
        }
        links.insert(key, link.clone());
        Ok(true)
    }
}

/// Transport fake that serves a fixed response and counts calls.
pub(crate) struct MockTransport {
    response: Mutex<Option<SigGetResponse>>,
    pub calls: AtomicUsize,
}

impl MockTransport {
    pub fn with(response: SigGetResponse) -> Self {
        Self {
            response: Mutex::new(Some(response)),
            calls: AtomicUsize::new(0),
        }
    }

    /// A transport the test expects to never be consulted.
    pub fn never() -> Self {
        Self {
            response: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch_sigs(&self, _uid: &Uid, _low: Seqno) -> AnyResult<SigGetResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response
            .lock()
            .expect("response lock")
            .take()
            .ok_or_else(|| anyhow!("unexpected transport call"))
    }
}

/// Merkle oracle fake returning a fixed leaf.
pub(crate) struct MockOracle {
    leaf: MerkleUserLeaf,
}

impl MockOracle {
    pub fn with(leaf: MerkleUserLeaf) -> Self {
        Self { leaf }
    }
}

#[async_trait]
impl MerkleOracle for MockOracle {
    async fn lookup_user(&self, _uid: &Uid) -> AnyResult<MerkleUserLeaf> {
        Ok(self.leaf.clone())
    }
}
