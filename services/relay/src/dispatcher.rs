//! Protocol dispatcher: typed decoding of the signalling operations.
//!
//! Params arrive as free-form JSON and are validated here, per element for
//! the batch operations; nothing untyped flows past this module.  The
//! registry and engine are reached through the narrow [`NodeOps`] surface
//! so the wire layer can be exercised against a scripted fake.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use ferry_protocol::{
    error_codes, methods, PushParams, RegisterAck, RpcError, SourceFlags, UnregisterAck,
};

use crate::peers::Peer;
use crate::registry::{Claim, NewSource, RegisterError};
use crate::rpc::Incoming;

/// What the dispatcher asks of the node.
#[async_trait]
pub trait NodeOps: Send + Sync {
    /// Register one validated source; returns `(id, signature)`.
    async fn register_source(
        &self,
        peer: &Arc<Peer>,
        source: NewSource,
    ) -> Result<(String, String), RegisterError>;

    /// Remove one source if `peer` owns it.  The wire answer is `true`
    /// either way; the return value only feeds logging.
    async fn unregister_source(&self, peer: &Arc<Peer>, id: &str, force: bool) -> bool;

    /// A seeder announced the `PUT` for a transfer.
    async fn push_request(&self, peer: &Arc<Peer>, push: PushParams);

    /// Abort a running transfer.
    async fn cancel_transfer(&self, peer: &Arc<Peer>, transfer_id: &str) -> bool;
}

/// Route one classified inbound frame to the node.
pub async fn dispatch(ops: &dyn NodeOps, peer: &Arc<Peer>, incoming: Incoming) {
    match incoming {
        Incoming::Request {
            method,
            params,
            invocation,
        } => match method.as_str() {
            methods::REGISTER => match op_register(ops, peer, &params).await {
                Ok(result) => invocation.respond(result).await,
                Err(error) => invocation.respond_error(error).await,
            },
            methods::UNREGISTER => match op_unregister(ops, peer, &params).await {
                Ok(result) => invocation.respond(result).await,
                Err(error) => invocation.respond_error(error).await,
            },
            // Older clients send push-request as a call and expect `true`.
            methods::PUSH_REQUEST => match op_push_request(ops, peer, &params).await {
                Ok(()) => invocation.respond(json!(true)).await,
                Err(error) => invocation.respond_error(error).await,
            },
            methods::CANCEL_TRANSFER => match op_cancel_transfer(ops, peer, &params).await {
                Ok(()) => invocation.respond(json!(true)).await,
                Err(error) => invocation.respond_error(error).await,
            },
            other => {
                debug!(peer_id = %peer.id(), method = other, "unknown method");
                invocation
                    .respond_error(RpcError::new(
                        error_codes::METHOD_NOT_FOUND,
                        format!("Method '{other}' not implemented"),
                    ))
                    .await;
            }
        },
        Incoming::Notification { method, params } => match method.as_str() {
            methods::PUSH_REQUEST => {
                if let Err(error) = op_push_request(ops, peer, &params).await {
                    warn!(peer_id = %peer.id(), message = %error.message, "push-request rejected");
                }
            }
            other => {
                debug!(peer_id = %peer.id(), method = other, "unknown notification ignored");
            }
        },
    }
}

// ---------------------------------------------------------------------------
// register
// ---------------------------------------------------------------------------

async fn op_register(
    ops: &dyn NodeOps,
    peer: &Arc<Peer>,
    params: &Value,
) -> Result<Value, RpcError> {
    let items = params.as_array().ok_or_else(|| {
        RpcError::new(
            error_codes::INVALID_PARAMS,
            "Method register expects an array of objects",
        )
    })?;

    let mut acks = Vec::with_capacity(items.len());
    for item in items {
        let ack = match decode_register_item(item) {
            Ok(source) => match ops.register_source(peer, source).await {
                Ok((id, signature)) => RegisterAck::ok(id, signature),
                Err(error) => RegisterAck::err(error.to_string()),
            },
            Err(message) => RegisterAck::err(message),
        };
        acks.push(ack);
    }
    Ok(json!(acks))
}

/// Validate one `register` element.  Error strings are wire contract.
fn decode_register_item(item: &Value) -> Result<NewSource, &'static str> {
    let obj = item
        .as_object()
        .ok_or("Method register expects an array of objects")?;

    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or("Source object expects a 'name' member to be a string")?;

    let content_type = obj
        .get("type")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or("Source object expects a 'type' member to be a string")?;

    let size = match obj.get("size") {
        None => 0,
        Some(value) => {
            let number = value
                .as_i64()
                .ok_or("Source object expects a 'size' member to be a number")?;
            u64::try_from(number).map_err(|_| "Source size must be equal or greater than zero")?
        }
    };

    let flags = {
        let value = obj
            .get("flags")
            .ok_or("Source object expects a 'flags' member to be a number")?;
        let number = value
            .as_i64()
            .ok_or("Source object expects a 'flags' member to be a number")?;
        let bits = u32::try_from(number)
            .map_err(|_| "Source flags must be equal or greater than zero")?;
        SourceFlags(bits)
    };

    let tags = match obj.get("tags") {
        None => Vec::new(),
        Some(value) => value
            .as_array()
            .ok_or("Source tags must be an array")?
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .collect(),
    };

    // Both members must be present for a re-registration claim.
    let claim = match (
        obj.get("id").and_then(Value::as_str),
        obj.get("signature").and_then(Value::as_str),
    ) {
        (Some(id), Some(signature)) if !id.is_empty() => Some(Claim {
            id: id.to_owned(),
            signature: signature.to_owned(),
        }),
        _ => None,
    };

    Ok(NewSource {
        name: name.to_owned(),
        content_type: content_type.to_owned(),
        size,
        flags,
        tags,
        claim,
    })
}

// ---------------------------------------------------------------------------
// unregister
// ---------------------------------------------------------------------------

async fn op_unregister(
    ops: &dyn NodeOps,
    peer: &Arc<Peer>,
    params: &Value,
) -> Result<Value, RpcError> {
    let items = params.as_array().ok_or_else(|| {
        RpcError::new(
            error_codes::INVALID_PARAMS,
            "Method unregister expects an array",
        )
    })?;

    let mut acks = Vec::with_capacity(items.len());
    for item in items {
        let ack = match decode_unregister_item(item) {
            Ok((id, force)) => {
                // The answer never reveals whether the id existed or who
                // owned it; removal happened only if both checks passed.
                let removed = ops.unregister_source(peer, &id, force).await;
                if !removed {
                    debug!(peer_id = %peer.id(), source_id = %id, "unregister had no effect");
                }
                UnregisterAck::ok()
            }
            Err(message) => UnregisterAck::err(message),
        };
        acks.push(ack);
    }
    Ok(json!(acks))
}

/// One `unregister` element: `{id, force?}`, or a bare id string from
/// older clients.
fn decode_unregister_item(item: &Value) -> Result<(String, bool), &'static str> {
    match item {
        Value::String(id) => {
            if id.is_empty() {
                Err("Unregister expects an array of source id strings")
            } else {
                Ok((id.clone(), false))
            }
        }
        Value::Object(obj) => {
            let id = obj
                .get("id")
                .and_then(Value::as_str)
                .ok_or("Unregister expects an array of source id strings")?;
            if id.is_empty() {
                return Err("Source id must be a valid string");
            }
            let force = match obj.get("force") {
                None => false,
                Some(value) => value.as_bool().ok_or("Argument 'force' must be boolean")?,
            };
            Ok((id.to_owned(), force))
        }
        _ => Err("Unregister expects an array of source id strings"),
    }
}

// ---------------------------------------------------------------------------
// push-request / cancelTransfer
// ---------------------------------------------------------------------------

async fn op_push_request(
    ops: &dyn NodeOps,
    peer: &Arc<Peer>,
    params: &Value,
) -> Result<(), RpcError> {
    let push = PushParams::from_params(params)
        .map_err(|message| RpcError::new(error_codes::INVALID_PARAMS, message))?;
    ops.push_request(peer, push).await;
    Ok(())
}

async fn op_cancel_transfer(
    ops: &dyn NodeOps,
    peer: &Arc<Peer>,
    params: &Value,
) -> Result<(), RpcError> {
    let ids = params.as_array().ok_or_else(|| {
        RpcError::new(
            error_codes::INVALID_PARAMS,
            "cancelTransfer expects an array of transfer id strings",
        )
    })?;
    for id in ids {
        let id = id.as_str().ok_or_else(|| {
            RpcError::new(
                error_codes::INVALID_PARAMS,
                "cancelTransfer expects an array of transfer id strings",
            )
        })?;
        if !ops.cancel_transfer(peer, id).await {
            debug!(peer_id = %peer.id(), transfer_id = %id, "cancel of unknown transfer ignored");
        }
    }
    Ok(())
}
