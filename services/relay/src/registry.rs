//! Source registry: content-addressed lookup of registered sources.
//!
//! IDs are opaque: instance prefix + URL-safe random suffix.  A signature
//! (HMAC-SHA256 over `id:content-type:flags`, base64) is handed to the
//! registering peer so it can re-claim the same id after a reconnect — or
//! after a relay restart, since nothing here is persisted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use ferry_protocol::SourceFlags;

use crate::peers::{Peer, PeerId};

type HmacSha256 = Hmac<Sha256>;

/// Collisions tolerated at one id length before growing it for good.
const MAX_COLLISIONS_PER_DEPTH: u32 = 3;

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// A registered logical file.  The bytes never live here; a source only
/// describes them and names the peer that can push them.
///
/// The registry owns the canonical entry; running transfers hold extra
/// `Arc`s, so a source outlives its registry slot while bytes still flow.
/// The owner peer is held weakly — a source must never keep a peer alive.
pub struct Source {
    id: String,
    signature: String,
    name: String,
    content_type: String,
    size: AtomicU64,
    flags: SourceFlags,
    tags: Vec<String>,
    owner: Mutex<OwnerRef>,
    cancel: CancellationToken,
}

struct OwnerRef {
    id: PeerId,
    peer: Weak<Peer>,
}

impl Source {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Adopt a new size, e.g. when the seeder's `PUT` announces a
    /// different `Content-Length` than was registered.
    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    #[must_use]
    pub fn flags(&self) -> SourceFlags {
        self.flags
    }

    #[must_use]
    pub fn is_chunkable(&self) -> bool {
        self.flags.contains(SourceFlags::CHUNKABLE)
    }

    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// The owning peer, if it is still alive.
    #[must_use]
    pub fn owner_peer(&self) -> Option<Arc<Peer>> {
        self.owner.lock().expect("source owner lock poisoned").peer.upgrade()
    }

    #[must_use]
    pub fn owner_peer_id(&self) -> PeerId {
        self.owner.lock().expect("source owner lock poisoned").id.clone()
    }

    /// Cancellation token observed by every transfer of this source.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn rebind_owner(&self, peer: &Arc<Peer>) {
        let mut owner = self.owner.lock().expect("source owner lock poisoned");
        owner.id = peer.id().to_owned();
        owner.peer = Arc::downgrade(peer);
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.size())
            .field("flags", &self.flags)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A validated `register` element, ready for the registry.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub flags: SourceFlags,
    pub tags: Vec<String>,
    /// Present when the peer re-presents a previously issued id.
    pub claim: Option<Claim>,
}

#[derive(Debug, Clone)]
pub struct Claim {
    pub id: String,
    pub signature: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("Invalid source signature")]
    InvalidSignature,
}

struct Inner {
    by_id: HashMap<String, Arc<Source>>,
    by_peer: HashMap<PeerId, HashMap<String, Arc<Source>>>,
    /// Current total id length; grows permanently on repeated collisions.
    depth: usize,
}

/// Owner of all sources and both source indices.  All mutation goes
/// through these methods; nothing else touches the maps.
pub struct SourceRegistry {
    prefix: String,
    key: Vec<u8>,
    inner: Mutex<Inner>,
}

impl SourceRegistry {
    #[must_use]
    pub fn new(prefix: &str, key: &str, start_depth: u8) -> Self {
        Self {
            prefix: prefix.to_owned(),
            key: key.as_bytes().to_vec(),
            inner: Mutex::new(Inner {
                by_id: HashMap::new(),
                by_peer: HashMap::new(),
                depth: usize::from(start_depth),
            }),
        }
    }

    /// Register one source for `peer`.
    ///
    /// Fresh registrations mint an id and signature.  A claim with a valid
    /// signature rebinds the existing entry to `peer` (keeping the live
    /// `Source` so running transfers continue), or inserts under the
    /// claimed id when the relay has never seen it — that is what lets a
    /// seeder keep its URL across a relay restart.
    pub fn register(&self, peer: &Arc<Peer>, new: NewSource) -> Result<Arc<Source>, RegisterError> {
        if let Some(claim) = new.claim {
            let expected = self.sign(&claim.id, &new.content_type, new.flags);
            if expected != claim.signature {
                return Err(RegisterError::InvalidSignature);
            }

            let mut inner = self.inner.lock().expect("registry lock poisoned");
            if let Some(existing) = inner.by_id.get(&claim.id).cloned() {
                let old_owner = existing.owner_peer_id();
                let old_emptied = match inner.by_peer.get_mut(&old_owner) {
                    Some(of_old) => {
                        of_old.remove(&claim.id);
                        of_old.is_empty()
                    }
                    None => false,
                };
                if old_emptied {
                    inner.by_peer.remove(&old_owner);
                }
                existing.rebind_owner(peer);
                inner
                    .by_peer
                    .entry(peer.id().to_owned())
                    .or_default()
                    .insert(claim.id.clone(), Arc::clone(&existing));
                debug!(source_id = %claim.id, peer_id = %peer.id(), "source re-claimed");
                return Ok(existing);
            }

            let source = Arc::new(Source {
                id: claim.id.clone(),
                signature: claim.signature,
                name: new.name,
                content_type: new.content_type,
                size: AtomicU64::new(new.size),
                flags: new.flags,
                tags: new.tags,
                owner: Mutex::new(OwnerRef {
                    id: peer.id().to_owned(),
                    peer: Arc::downgrade(peer),
                }),
                cancel: CancellationToken::new(),
            });
            Self::index(&mut inner, peer, &source);
            info!(source_id = %source.id, name = %source.name, "source registered under claimed id");
            return Ok(source);
        }

        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let id = self.generate_id(&mut inner);
        let signature = self.sign(&id, &new.content_type, new.flags);
        let source = Arc::new(Source {
            id,
            signature,
            name: new.name,
            content_type: new.content_type,
            size: AtomicU64::new(new.size),
            flags: new.flags,
            tags: new.tags,
            owner: Mutex::new(OwnerRef {
                id: peer.id().to_owned(),
                peer: Arc::downgrade(peer),
            }),
            cancel: CancellationToken::new(),
        });
        Self::index(&mut inner, peer, &source);
        info!(source_id = %source.id, name = %source.name, "source registered");
        Ok(source)
    }

    /// Remove a source, but only when `peer` owns it.  `force` aborts any
    /// running transfers through the source's cancellation token; the
    /// default lets them drain.
    pub fn unregister(&self, peer: &Peer, id: &str, force: bool) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let Some(source) = inner.by_id.get(id).cloned() else {
            return false;
        };
        if source.owner_peer_id() != peer.id() {
            debug!(source_id = %id, peer_id = %peer.id(), "unregister by non-owner ignored");
            return false;
        }

        inner.by_id.remove(id);
        let emptied = match inner.by_peer.get_mut(peer.id()) {
            Some(of_peer) => {
                of_peer.remove(id);
                of_peer.is_empty()
            }
            None => false,
        };
        if emptied {
            inner.by_peer.remove(peer.id());
        }
        drop(inner);

        if force {
            source.cancel_token().cancel();
        }
        info!(source_id = %id, force, "source unregistered");
        true
    }

    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<Arc<Source>> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .by_id
            .get(id)
            .cloned()
    }

    /// Release everything a closed peer owned.  Active transfers see the
    /// cancellation; a later signed re-registration can claim the ids back.
    pub fn release_peer(&self, peer_id: &str) -> Vec<Arc<Source>> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let Some(of_peer) = inner.by_peer.remove(peer_id) else {
            return Vec::new();
        };
        let sources: Vec<Arc<Source>> = of_peer.into_values().collect();
        for source in &sources {
            inner.by_id.remove(source.id());
        }
        drop(inner);

        for source in &sources {
            source.cancel_token().cancel();
        }
        if !sources.is_empty() {
            info!(peer_id, released = sources.len(), "released sources of closed peer");
        }
        sources
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `base64(HMAC-SHA256(node-key, id ":" content-type ":" flags))`.
    #[must_use]
    pub fn sign(&self, id: &str, content_type: &str, flags: SourceFlags) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(format!("{id}:{content_type}:{}", flags.bits()).as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    fn index(inner: &mut Inner, peer: &Arc<Peer>, source: &Arc<Source>) {
        inner
            .by_id
            .insert(source.id().to_owned(), Arc::clone(source));
        inner
            .by_peer
            .entry(peer.id().to_owned())
            .or_default()
            .insert(source.id().to_owned(), Arc::clone(source));
    }

    /// Mint a unique id at the current depth, growing the depth for the
    /// rest of the process after repeated collisions.
    fn generate_id(&self, inner: &mut Inner) -> String {
        let mut fails = 0;
        loop {
            let suffix_len = inner.depth.saturating_sub(self.prefix.len()).max(1);
            let id = format!("{}{}", self.prefix, random_suffix(suffix_len));
            if !inner.by_id.contains_key(&id) {
                return id;
            }
            fails += 1;
            if fails >= MAX_COLLISIONS_PER_DEPTH {
                inner.depth += 1;
                fails = 0;
                debug!(depth = inner.depth, "source id depth increased after collisions");
            }
        }
    }
}

/// URL-safe random token: base64 with `/` and `+` flattened to `x` and
/// padding stripped, truncated to `len` characters.
fn random_suffix(len: usize) -> String {
    let byte_len = len.div_ceil(4) * 3;
    let mut bytes = vec![0u8; byte_len];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    encoded = encoded.replace(['/', '+'], "x");
    encoded.truncate(len);
    encoded
}
