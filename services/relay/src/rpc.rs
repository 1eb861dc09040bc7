//! JSON-RPC multiplexer over the peer transport.
//!
//! Outbound: `call` correlates a request id with a oneshot completion;
//! `notify` is fire-and-forget.  Inbound: `handle_frame` classifies a frame
//! and either resolves a pending call (responses) or hands the caller an
//! [`Incoming`] to dispatch.  Malformed frames are logged and dropped; they
//! never take the relay down.
//!
//! Every incoming request must be answered exactly once.  [`Invocation`]
//! enforces that by consuming itself in `respond`/`respond_error`; a bug
//! that drops one without responding is logged at warn.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use ferry_protocol::{
    error_frame, notification_frame, request_frame, response_frame, Envelope, RpcError,
};

use crate::peers::{Peer, PeerId};
use std::sync::Arc;

/// A failed outbound call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("peer is closed")]
    PeerClosed,
    #[error("peer error {}: {}", .0.code, .0.message)]
    Remote(RpcError),
}

/// An inbound frame the node must act on.  Responses never surface here;
/// they resolve their pending call inside `handle_frame`.
#[derive(Debug)]
pub enum Incoming {
    Request {
        method: String,
        params: Value,
        invocation: Invocation,
    },
    Notification {
        method: String,
        params: Value,
    },
}

/// A single pending answer to an inbound request.
///
/// Consuming `respond`/`respond_error` makes a duplicate response
/// unrepresentable; dropping an unanswered invocation is a bug and logs.
#[derive(Debug)]
pub struct Invocation {
    peer: Arc<Peer>,
    id: Value,
    responded: bool,
}

impl Invocation {
    pub async fn respond(mut self, result: Value) {
        self.responded = true;
        let frame = response_frame(&self.id, &result);
        if self.peer.send(frame).await.is_err() {
            debug!(peer_id = %self.peer.id(), "response dropped, peer closed");
        }
    }

    pub async fn respond_error(mut self, error: RpcError) {
        self.responded = true;
        let frame = error_frame(&self.id, &error);
        if self.peer.send(frame).await.is_err() {
            debug!(peer_id = %self.peer.id(), "error response dropped, peer closed");
        }
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        if !self.responded {
            warn!(peer_id = %self.peer.id(), id = %self.id, "invocation dropped without a response");
        }
    }
}

#[derive(Default)]
struct PeerCalls {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>,
}

/// Per-peer outbound call correlation plus inbound frame demux.
#[derive(Default)]
pub struct RpcMux {
    calls: Mutex<HashMap<PeerId, PeerCalls>>,
}

impl RpcMux {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a one-way notification to a peer.
    pub async fn notify(&self, peer: &Peer, method: &str, params: &Value) -> bool {
        peer.send(notification_frame(method, params)).await.is_ok()
    }

    /// Best-effort notification: dropped when the peer's queue is full,
    /// so a stuck client cannot stall the sender.
    pub fn notify_lossy(&self, peer: &Peer, method: &str, params: &Value) -> bool {
        peer.try_send(notification_frame(method, params)).is_ok()
    }

    /// Call a method on a peer and await its response.
    ///
    /// The id space is per peer; ids from different peers never meet.
    pub async fn call(&self, peer: &Peer, method: &str, params: &Value) -> Result<Value, CallError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut calls = self.calls.lock().expect("rpc call table lock poisoned");
            let entry = calls.entry(peer.id().to_owned()).or_default();
            entry.next_id += 1;
            let id = entry.next_id;
            entry.pending.insert(id, tx);
            id
        };

        if peer.send(request_frame(id, method, params)).await.is_err() {
            self.forget(peer.id(), id);
            return Err(CallError::PeerClosed);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(CallError::Remote(error)),
            // Sender dropped: the peer closed while the call was in flight.
            Err(_) => Err(CallError::PeerClosed),
        }
    }

    /// Classify one inbound frame.
    ///
    /// Returns `None` for responses (resolved internally), for responses
    /// with no matching pending call, and for malformed frames.
    pub fn handle_frame(&self, peer: &Arc<Peer>, frame: &str) -> Option<Incoming> {
        let envelope = match Envelope::parse(frame) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(peer_id = %peer.id(), %error, "dropping malformed frame");
                return None;
            }
        };

        match envelope {
            Envelope::Request { id, method, params } => Some(Incoming::Request {
                method,
                params,
                invocation: Invocation {
                    peer: Arc::clone(peer),
                    id,
                    responded: false,
                },
            }),
            Envelope::Notification { method, params } => {
                Some(Incoming::Notification { method, params })
            }
            Envelope::Response { id, result, error } => {
                let Some(id) = id.as_u64() else {
                    warn!(peer_id = %peer.id(), "response with non-numeric id dropped");
                    return None;
                };
                match self.take_pending(peer.id(), id) {
                    Some(tx) => {
                        let outcome = match error {
                            Some(error) => Err(error),
                            None => Ok(result),
                        };
                        // The caller may have timed out and gone away.
                        let _ = tx.send(outcome);
                    }
                    None => {
                        debug!(peer_id = %peer.id(), id, "response with no pending call dropped");
                    }
                }
                None
            }
        }
    }

    /// Drop all state for a peer, failing its outstanding calls.
    pub fn drop_peer(&self, peer_id: &str) {
        let calls = self
            .calls
            .lock()
            .expect("rpc call table lock poisoned")
            .remove(peer_id);
        if let Some(calls) = calls {
            // Dropping the senders resolves every waiter with PeerClosed.
            drop(calls);
        }
    }

    fn take_pending(
        &self,
        peer_id: &str,
        id: u64,
    ) -> Option<oneshot::Sender<Result<Value, RpcError>>> {
        self.calls
            .lock()
            .expect("rpc call table lock poisoned")
            .get_mut(peer_id)
            .and_then(|entry| entry.pending.remove(&id))
    }

    fn forget(&self, peer_id: &str, id: u64) {
        let _ = self.take_pending(peer_id, id);
    }
}
