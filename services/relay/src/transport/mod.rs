//! Signalling transports.
//!
//! Both variants speak the same contract to the node: an ordered stream of
//! UTF-8 text frames per identified peer, with open/frame/closed lifecycle
//! hooks.  The core never learns which transport carries a peer.
//!
//! The transport assigns the peer id during its handshake: the WebSocket
//! variant sends it in-band as the first frame, the long-poll variant
//! returns it from the handshake POST.  Either way the first thing a
//! client learns is its own `peer-id`.

pub mod longpoll;
pub mod ws;

use serde_json::json;

/// The in-band hello carrying the peer's assigned id.
#[must_use]
pub fn handshake_frame(peer_id: &str) -> String {
    json!({ "method": "handshake", "params": [{ "peer-id": peer_id }] }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn handshake_frame_is_a_notification_with_the_peer_id() {
        let frame = handshake_frame("p-123");
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["method"], json!("handshake"));
        assert_eq!(value["params"][0]["peer-id"], json!("p-123"));
        assert!(value.get("id").is_none());
    }
}
