//! Long-poll signalling transport.
//!
//! For browsers without WebSocket: `POST /transport/handshake` mints a
//! peer, `GET /transport/lp/{peer}` parks until outbound frames are ready
//! (or the poll window closes) and returns them as a JSON array, and
//! `POST /transport/lp/{peer}` delivers client frames, also as a JSON
//! array.  A peer that stops polling is reaped by the idle sweeper.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info};

use crate::peers::{Peer, PeerId};
use crate::state::AppState;

/// How long one poll parks before returning an empty batch.
const POLL_WINDOW: Duration = Duration::from_secs(25);
/// A peer that has not polled for this long is considered gone.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

struct Session {
    peer: Arc<Peer>,
    /// Receiving half of the peer's outbound queue; locked by the active poll.
    outbox: Arc<AsyncMutex<mpsc::Receiver<String>>>,
    last_seen: Instant,
}

/// Long-poll session table plus the idle sweeper's run flag.
#[derive(Default)]
pub struct LongPollSessions {
    sessions: Mutex<HashMap<PeerId, Session>>,
    sweeper_running: AtomicBool,
}

impl LongPollSessions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, peer: Arc<Peer>, outbox: mpsc::Receiver<String>) {
        self.sessions
            .lock()
            .expect("longpoll session lock poisoned")
            .insert(
                peer.id().to_owned(),
                Session {
                    peer,
                    outbox: Arc::new(AsyncMutex::new(outbox)),
                    last_seen: Instant::now(),
                },
            );
    }

    fn touch(&self, peer_id: &str) -> Option<(Arc<Peer>, Arc<AsyncMutex<mpsc::Receiver<String>>>)> {
        let mut sessions = self.sessions.lock().expect("longpoll session lock poisoned");
        let session = sessions.get_mut(peer_id)?;
        session.last_seen = Instant::now();
        Some((Arc::clone(&session.peer), Arc::clone(&session.outbox)))
    }

    /// Collect peers that have not polled within the idle window.
    fn reap_idle(&self) -> Vec<Arc<Peer>> {
        let mut sessions = self.sessions.lock().expect("longpoll session lock poisoned");
        let idle: Vec<PeerId> = sessions
            .iter()
            .filter(|(_, session)| session.last_seen.elapsed() > IDLE_TIMEOUT)
            .map(|(id, _)| id.clone())
            .collect();
        idle.iter()
            .filter_map(|id| sessions.remove(id))
            .map(|session| session.peer)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .expect("longpoll session lock poisoned")
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `POST /transport/handshake` — mint a long-poll peer.
pub async fn handshake(State(state): State<AppState>) -> impl IntoResponse {
    let (peer, outbox) = state.node.hub().create_peer();
    state.longpoll.insert(Arc::clone(&peer), outbox);
    state.node.on_peer_open(&peer);
    spawn_sweeper(&state);
    info!(peer_id = %peer.id(), "long-poll peer created");
    Json(json!({ "peer-id": peer.id() }))
}

/// `GET /transport/lp/{peer}` — park for outbound frames.
pub async fn poll(State(state): State<AppState>, Path(peer_id): Path<String>) -> Response {
    let Some((_peer, outbox)) = state.longpoll.touch(&peer_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut frames: Vec<String> = Vec::new();
    {
        let mut outbox = outbox.lock().await;
        match tokio::time::timeout(POLL_WINDOW, outbox.recv()).await {
            Ok(Some(frame)) => {
                frames.push(frame);
                // Drain whatever else is already queued.
                while let Ok(frame) = outbox.try_recv() {
                    frames.push(frame);
                }
            }
            // Window elapsed with nothing to say, or the peer was closed
            // relay-side; either way an empty batch.
            Ok(None) | Err(_) => {}
        }
    }
    Json(json!(frames)).into_response()
}

/// `POST /transport/lp/{peer}` — deliver client frames in order.
pub async fn push(
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let Some((peer, _outbox)) = state.longpoll.touch(&peer_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match body {
        Value::Array(items) => {
            for item in items {
                if let Value::String(frame) = item {
                    state.node.on_peer_frame(&peer, &frame).await;
                } else {
                    debug!(peer_id = %peer.id(), "non-string long-poll frame dropped");
                }
            }
        }
        Value::String(frame) => state.node.on_peer_frame(&peer, &frame).await,
        _ => {
            return StatusCode::BAD_REQUEST.into_response();
        }
    }
    Json(json!({ "result": true })).into_response()
}

/// One sweeper per relay, started with the first long-poll peer and gone
/// when the table empties.
fn spawn_sweeper(state: &AppState) {
    if state.longpoll.sweeper_running.swap(true, Ordering::AcqRel) {
        return;
    }
    let state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            for peer in state.longpoll.reap_idle() {
                debug!(peer_id = %peer.id(), "long-poll peer idle, closing");
                if state.node.hub().remove(peer.id()).is_some() {
                    state.node.on_peer_closed(&peer, false);
                }
            }
            if state.longpoll.is_empty() {
                state.longpoll.sweeper_running.store(false, Ordering::Release);
                return;
            }
        }
    });
}
