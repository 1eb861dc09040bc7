//! WebSocket signalling transport.
//!
//! One task per socket: inbound text frames go to the node, outbound
//! frames drain from the peer's queue.  Any socket error closes the peer;
//! a clean close or an orderly hub removal counts as graceful.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use tracing::{debug, warn};

use crate::state::AppState;

use super::handshake_frame;

pub async fn ws_transport_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (peer, mut outbox) = state.node.hub().create_peer();

    if socket
        .send(Message::Text(handshake_frame(peer.id()).into()))
        .await
        .is_err()
    {
        state.node.hub().remove(peer.id());
        return;
    }
    state.node.on_peer_open(&peer);

    let graceful = loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    state.node.on_peer_frame(&peer, text.as_str()).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = socket.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(peer_id = %peer.id(), "websocket closed by client");
                    break true;
                }
                Some(Err(error)) => {
                    warn!(peer_id = %peer.id(), %error, "websocket error");
                    break false;
                }
                Some(Ok(_)) => {}
            },
            frame = outbox.recv() => match frame {
                Some(frame) => {
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        break false;
                    }
                }
                // Peer was closed from the relay side.
                None => break true,
            },
        }
    };

    if state.node.hub().remove(peer.id()).is_some() {
        state.node.on_peer_closed(&peer, graceful);
    }
}
