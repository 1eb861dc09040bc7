//! A scripted signalling peer for integration tests.
//!
//! Speaks the JSON-RPC envelope protocol over a WebSocket: call a method
//! and await its correlated response, receive server notifications, or
//! push raw frames to poke at the relay's error handling.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;

use ferry_protocol::{request_frame, notification_frame, Envelope};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MockPeer {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
    peer_id: String,
    next_id: u64,
    notifications: VecDeque<(String, Value)>,
}

impl MockPeer {
    /// Connect and consume the transport handshake carrying our peer id.
    pub async fn connect(ws_url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(ws_url).await?;
        let (write, read) = ws_stream.split();
        let mut peer = Self {
            write,
            read,
            peer_id: String::new(),
            next_id: 0,
            notifications: VecDeque::new(),
        };

        let (method, params) = peer.next_notification().await?;
        if method != "handshake" {
            return Err(format!("expected handshake, got '{method}'").into());
        }
        peer.peer_id = params[0]["peer-id"]
            .as_str()
            .ok_or("handshake without peer-id")?
            .to_owned();
        Ok(peer)
    }

    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Call a method and await the matching response; a wire error object
    /// comes back as `Err`.
    pub async fn call(
        &mut self,
        method: &str,
        params: Value,
    ) -> Result<Value, Box<dyn std::error::Error>> {
        self.next_id += 1;
        let id = self.next_id;
        self.write
            .send(Message::Text(request_frame(id, method, &params).into()))
            .await?;

        loop {
            match self.next_envelope().await? {
                Envelope::Response {
                    id: response_id,
                    result,
                    error,
                } => {
                    if response_id.as_u64() != Some(id) {
                        continue;
                    }
                    return match error {
                        Some(error) => Err(format!("rpc error {}: {}", error.code, error.message).into()),
                        None => Ok(result),
                    };
                }
                Envelope::Notification { method, params } => {
                    self.notifications.push_back((method, params));
                }
                Envelope::Request { .. } => {
                    return Err("relay sent an unexpected request".into());
                }
            }
        }
    }

    /// Send a one-way notification.
    pub async fn notify(
        &mut self,
        method: &str,
        params: Value,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.write
            .send(Message::Text(notification_frame(method, &params).into()))
            .await?;
        Ok(())
    }

    /// Send an arbitrary text frame, malformed ones included.
    pub async fn send_raw(&mut self, frame: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write
            .send(Message::Text(frame.to_owned().into()))
            .await?;
        Ok(())
    }

    /// Next server notification, in arrival order.
    pub async fn next_notification(
        &mut self,
    ) -> Result<(String, Value), Box<dyn std::error::Error>> {
        if let Some(pending) = self.notifications.pop_front() {
            return Ok(pending);
        }
        loop {
            match self.next_envelope().await? {
                Envelope::Notification { method, params } => return Ok((method, params)),
                // A stray response (e.g. after a timed-out call) is dropped.
                Envelope::Response { .. } => {}
                Envelope::Request { .. } => {
                    return Err("relay sent an unexpected request".into());
                }
            }
        }
    }

    /// Next notification of one specific method, skipping others (the
    /// ~1 Hz status reports make exact sequences unpredictable).
    pub async fn next_notification_of(
        &mut self,
        wanted: &str,
    ) -> Result<Value, Box<dyn std::error::Error>> {
        loop {
            let (method, params) = self.next_notification().await?;
            if method == wanted {
                return Ok(params);
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }

    async fn next_envelope(&mut self) -> Result<Envelope, Box<dyn std::error::Error>> {
        loop {
            let message = tokio::time::timeout(RECV_TIMEOUT, self.read.next())
                .await
                .map_err(|_| "timed out waiting for a frame")?;
            match message {
                Some(Ok(Message::Text(text))) => return Ok(Envelope::parse(&text)?),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => return Err("connection closed by relay".into()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }
}
