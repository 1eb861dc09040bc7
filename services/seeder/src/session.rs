//! Signalling session: register, then serve push requests until the
//! transport drops.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, info, warn};

use ferry_protocol::{
    methods, request_frame, Envelope, PushParams, RegisterItem,
};

use crate::{push, SeederError, SharedFile, share_url, ws_service_url};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// The signed identity handed out at first registration; re-presented on
/// every reconnect so the share URL survives.
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: String,
    pub signature: String,
}

pub struct Session {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
    next_id: u64,
}

impl Session {
    /// Connect to the relay's signalling endpoint and consume the
    /// transport handshake.
    pub async fn connect(service: &str) -> Result<Self, SeederError> {
        let ws_url = ws_service_url(service)?;
        let (ws_stream, _response) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .map_err(|e| SeederError::Transport(e.to_string()))?;
        let (write, read) = ws_stream.split();
        let mut session = Self {
            write,
            read,
            next_id: 0,
        };

        match session.next_envelope().await? {
            Envelope::Notification { method, params } if method == "handshake" => {
                let peer_id = params[0]["peer-id"].as_str().unwrap_or("?");
                debug!(peer_id, "signalling channel open");
            }
            other => {
                return Err(SeederError::Protocol(format!(
                    "expected transport handshake, got {other:?}"
                )));
            }
        }
        Ok(session)
    }

    /// Register the shared file, claiming a previous id when we have one.
    pub async fn register(
        &mut self,
        shared: &SharedFile,
        claim: Option<&Registration>,
    ) -> Result<Registration, SeederError> {
        let item = RegisterItem {
            name: shared.name.clone(),
            content_type: shared.content_type.clone(),
            size: shared.size,
            flags: shared.flags,
            tags: vec![],
            id: claim.map(|c| c.id.clone()),
            signature: claim.map(|c| c.signature.clone()),
        };

        self.next_id += 1;
        let id = self.next_id;
        self.write
            .send(Message::Text(
                request_frame(id, methods::REGISTER, &json!([item])).into(),
            ))
            .await
            .map_err(|e| SeederError::Transport(e.to_string()))?;

        let result = loop {
            match self.next_envelope().await? {
                Envelope::Response {
                    id: response_id,
                    result,
                    error,
                } if response_id.as_u64() == Some(id) => match error {
                    Some(error) => {
                        return Err(SeederError::Rejected(error.message));
                    }
                    None => break result,
                },
                other => debug!(?other, "frame before registration response ignored"),
            }
        };

        let ack = &result[0];
        if let Some(message) = ack["error"].as_str() {
            return Err(SeederError::Rejected(message.to_owned()));
        }
        match (ack["id"].as_str(), ack["signature"].as_str()) {
            (Some(id), Some(signature)) => Ok(Registration {
                id: id.to_owned(),
                signature: signature.to_owned(),
            }),
            _ => Err(SeederError::Protocol(
                "registration ack without id/signature".to_owned(),
            )),
        }
    }

    /// Serve push requests until the transport drops.
    pub async fn serve(&mut self, service: &str, shared: &SharedFile) -> SeederError {
        let client = Arc::new(reqwest::Client::new());
        loop {
            let envelope = match self.next_envelope().await {
                Ok(envelope) => envelope,
                Err(error) => return error,
            };
            match envelope {
                Envelope::Notification { method, params } => {
                    handle_notification(service, shared, &client, &method, &params);
                }
                Envelope::Response { .. } => {}
                Envelope::Request { id, method, .. } => {
                    debug!(%method, ?id, "unexpected relay request ignored");
                }
            }
        }
    }

    async fn next_envelope(&mut self) -> Result<Envelope, SeederError> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => match Envelope::parse(&text) {
                    Ok(envelope) => return Ok(envelope),
                    Err(error) => debug!(%error, "malformed frame from relay dropped"),
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    return Err(SeederError::Transport(
                        "signalling channel closed".to_owned(),
                    ));
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => return Err(SeederError::Transport(error.to_string())),
            }
        }
    }
}

fn handle_notification(
    service: &str,
    shared: &SharedFile,
    client: &Arc<reqwest::Client>,
    method: &str,
    params: &Value,
) {
    match method {
        methods::FILE_TRANSFER_NEW => {
            let push = match PushParams::from_params(params) {
                Ok(push) => push,
                Err(error) => {
                    warn!(error, "malformed fileTransferNew ignored");
                    return;
                }
            };
            info!(
                transfer_id = %push.transfer_id,
                range = ?push.range,
                "relay requested a push"
            );
            let client = Arc::clone(client);
            let service = service.to_owned();
            let path = shared.path.clone();
            tokio::spawn(async move {
                if let Err(error) =
                    push::push_file(&client, &service, &push.transfer_id, &path, push.range).await
                {
                    warn!(transfer_id = %push.transfer_id, %error, "push failed");
                }
            });
        }
        methods::TRANSFER_FINISHED => {
            info!(
                transfer_id = %params[0].as_str().unwrap_or("?"),
                status = %params[1].as_str().unwrap_or("?"),
                "transfer finished"
            );
        }
        methods::TRANSFER_STATUS => {
            debug!(status = %params, "transfer status");
        }
        methods::UPDATE_FILE_SIZE => {
            info!(
                source_id = %params[0].as_str().unwrap_or("?"),
                new_size = params[1].as_u64().unwrap_or(0),
                "relay adopted a new file size"
            );
        }
        other => debug!(method = other, "notification ignored"),
    }
}

/// Connect, register, serve; reconnect with the saved claim on loss.
/// Returns only on a fatal setup error (bad URL, rejected claim).
pub async fn run(service: &str, shared: &SharedFile) -> SeederError {
    let mut claim: Option<Registration> = None;
    loop {
        let mut session = match Session::connect(service).await {
            Ok(session) => session,
            Err(error @ SeederError::InvalidServiceUrl(_)) => return error,
            Err(error) => {
                warn!(%error, "connect failed, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        match session.register(shared, claim.as_ref()).await {
            Ok(registration) => {
                if claim.is_none() {
                    // The one line a script wants to capture.
                    println!("{}", share_url(service, &registration.id));
                }
                claim = Some(registration);
            }
            Err(error @ SeederError::Rejected(_)) => return error,
            Err(error) => {
                warn!(%error, "registration failed, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        }

        let error = session.serve(service, shared).await;
        warn!(%error, "signalling channel lost, reconnecting");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
