//! Signalling peers.
//!
//! A [`Peer`] is an identified endpoint of the signalling channel,
//! independent of which transport (WebSocket or long-poll) carries it.  The
//! core only ever talks to the `send` side; each transport owns the
//! receiving half of the outbound queue and the inbound socket.
//!
//! Frames queued for one peer are delivered in send order.  No ordering is
//! promised across peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use uuid::Uuid;

/// Capacity of the per-peer outbound frame queue.
const OUTBOX_CAPACITY: usize = 64;

pub type PeerId = String;

/// The peer's outbound half could not accept a frame: the peer is gone.
#[derive(Debug, thiserror::Error)]
#[error("peer is closed")]
pub struct PeerClosed;

/// An identified signalling endpoint.
pub struct Peer {
    id: PeerId,
    outbox: mpsc::Sender<String>,
    closed: AtomicBool,
}

impl Peer {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a text frame for delivery to this peer, in send order.
    pub async fn send(&self, frame: String) -> Result<(), PeerClosed> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PeerClosed);
        }
        self.outbox.send(frame).await.map_err(|_| PeerClosed)
    }

    /// Queue a frame only if the peer has room.  For periodic traffic
    /// that must not stall on a slow or stuck client; the next period
    /// carries fresher data anyway.
    pub fn try_send(&self, frame: String) -> Result<(), PeerClosed> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PeerClosed);
        }
        self.outbox.try_send(frame).map_err(|_| PeerClosed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Owner of all live peers.
///
/// Transports create peers here on handshake and remove them on close; the
/// receiving half of the outbound queue is handed back to the transport so
/// the hub itself never blocks on a slow client.
#[derive(Default)]
pub struct PeerHub {
    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,
}

impl PeerHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a fresh peer.  Returns the peer handle and the
    /// receiving half of its outbound queue.
    pub fn create_peer(&self) -> (Arc<Peer>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let peer = Arc::new(Peer {
            id: Uuid::new_v4().simple().to_string(),
            outbox: tx,
            closed: AtomicBool::new(false),
        });
        self.peers
            .lock()
            .expect("peer table lock poisoned")
            .insert(peer.id.clone(), Arc::clone(&peer));
        (peer, rx)
    }

    #[must_use]
    pub fn lookup(&self, peer_id: &str) -> Option<Arc<Peer>> {
        self.peers
            .lock()
            .expect("peer table lock poisoned")
            .get(peer_id)
            .cloned()
    }

    /// Remove a peer from the table and mark it closed.  Returns the handle
    /// if the peer was still registered, so the caller can run lifecycle
    /// hooks exactly once.
    pub fn remove(&self, peer_id: &str) -> Option<Arc<Peer>> {
        let peer = self
            .peers
            .lock()
            .expect("peer table lock poisoned")
            .remove(peer_id);
        if let Some(peer) = &peer {
            peer.mark_closed();
        }
        peer
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.lock().expect("peer table lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
