// ferry-protocol: signalling wire types and serialization.
//
// The signalling channel carries JSON-RPC 2.0-ish envelopes as UTF-8 text
// frames.  Three envelope kinds exist: requests (method + params + id),
// responses (result | error + id) and notifications (method + params, no
// id).  Method names and payload shapes below are frozen wire contract;
// renaming any of them breaks deployed browser clients.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Method names
// ---------------------------------------------------------------------------

/// Frozen method and notification names.
pub mod methods {
    /// Seeder -> relay: register a batch of sources.
    pub const REGISTER: &str = "register";
    /// Seeder -> relay: unregister a batch of sources.
    pub const UNREGISTER: &str = "unregister";
    /// Seeder -> relay: announce that a `PUT` for a transfer is on its way.
    /// A notification in the current protocol; older clients send it as a
    /// request and expect a `true` result.
    pub const PUSH_REQUEST: &str = "push-request";
    /// Either side: abort a running transfer.
    pub const CANCEL_TRANSFER: &str = "cancelTransfer";

    /// Relay -> seeder: a leecher wants the source; please push.
    pub const FILE_TRANSFER_NEW: &str = "fileTransferNew";
    /// Relay -> target peer: the seeder's push has paired and bytes flow.
    pub const TRANSFER_STARTED: &str = "transfer-started";
    /// Relay -> interested peers: ~1 Hz progress report.
    pub const TRANSFER_STATUS: &str = "transfer-status";
    /// Relay -> interested peers: a transfer reached a terminal status.
    pub const TRANSFER_FINISHED: &str = "transfer-finished";
    /// Relay -> seeder: the pushed Content-Length differed from the
    /// registered size; the source was updated.
    pub const UPDATE_FILE_SIZE: &str = "update-file-size";
}

// ---------------------------------------------------------------------------
// RPC error objects
// ---------------------------------------------------------------------------

/// Error member of a response envelope: `{code: int, message: string}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// JSON-RPC error codes used on the wire.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A classified signalling frame.
///
/// Classification rule: a frame with a `method` member is a request when it
/// also carries an `id`, a notification otherwise; a frame without `method`
/// but with an `id` is a response.  Anything else is malformed.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: Value,
        result: Value,
        error: Option<RpcError>,
    },
}

/// Frame rejected by [`Envelope::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Not valid JSON at all.
    Json(String),
    /// Valid JSON that is not a recognisable envelope.
    Shape(&'static str),
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::Json(e) => write!(f, "invalid JSON: {e}"),
            EnvelopeError::Shape(e) => write!(f, "invalid envelope: {e}"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl Envelope {
    pub fn parse(frame: &str) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(frame).map_err(|e| EnvelopeError::Json(e.to_string()))?;
        let Value::Object(mut obj) = value else {
            return Err(EnvelopeError::Shape("frame is not an object"));
        };

        let id = obj.remove("id").filter(|v| !v.is_null());
        let method = match obj.remove("method") {
            Some(Value::String(m)) => Some(m),
            Some(_) => return Err(EnvelopeError::Shape("'method' is not a string")),
            None => None,
        };

        match (method, id) {
            (Some(method), Some(id)) => Ok(Envelope::Request {
                id,
                method,
                params: obj.remove("params").unwrap_or(Value::Null),
            }),
            (Some(method), None) => Ok(Envelope::Notification {
                method,
                params: obj.remove("params").unwrap_or(Value::Null),
            }),
            (None, Some(id)) => {
                let error = match obj.remove("error") {
                    None | Some(Value::Null) => None,
                    Some(e) => Some(
                        serde_json::from_value(e)
                            .map_err(|_| EnvelopeError::Shape("malformed 'error' member"))?,
                    ),
                };
                Ok(Envelope::Response {
                    id,
                    result: obj.remove("result").unwrap_or(Value::Null),
                    error,
                })
            }
            (None, None) => Err(EnvelopeError::Shape("neither 'method' nor 'id' present")),
        }
    }
}

/// Serialize a request frame.
pub fn request_frame(id: u64, method: &str, params: &Value) -> String {
    json!({ "method": method, "id": id, "params": params }).to_string()
}

/// Serialize a notification frame.
pub fn notification_frame(method: &str, params: &Value) -> String {
    json!({ "method": method, "params": params }).to_string()
}

/// Serialize a success response frame.  The `error` member is emitted as an
/// explicit `null`, matching what deployed clients expect.
pub fn response_frame(id: &Value, result: &Value) -> String {
    json!({ "id": id, "error": Value::Null, "result": result }).to_string()
}

/// Serialize an error response frame.
pub fn error_frame(id: &Value, error: &RpcError) -> String {
    json!({ "id": id, "error": error, "result": Value::Null }).to_string()
}

// ---------------------------------------------------------------------------
// Source flags
// ---------------------------------------------------------------------------

/// Bitset advertised at registration time.
///
/// Carried on the wire as a plain non-negative integer; unknown bits are
/// preserved and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceFlags(pub u32);

impl SourceFlags {
    pub const NONE: SourceFlags = SourceFlags(0);
    /// Source may be listed publicly.
    pub const PUBLIC: SourceFlags = SourceFlags(1 << 0);
    /// Content is generated live; size is advisory.
    pub const LIVE: SourceFlags = SourceFlags(1 << 1);
    /// Delivery is latency-sensitive.
    pub const REAL_TIME: SourceFlags = SourceFlags(1 << 2);
    /// HTTP range requests are honoured for this source.
    pub const CHUNKABLE: SourceFlags = SourceFlags(1 << 3);
    /// Reserved for two-way streams.
    pub const BIDIRECTIONAL: SourceFlags = SourceFlags(1 << 4);

    #[must_use]
    pub fn contains(self, other: SourceFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn union(self, other: SourceFlags) -> SourceFlags {
        SourceFlags(self.0 | other.0)
    }

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Transfer status
// ---------------------------------------------------------------------------

/// Lifecycle of a single leecher/seeder pairing.
///
/// `Paused` and `Cancelled` are part of the frozen vocabulary but the relay
/// never emits them; cancellation surfaces as `SourceAborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    NotStarted,
    Active,
    Paused,
    Completed,
    SourceAborted,
    TargetAborted,
    Error,
    Cancelled,
}

impl TransferStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::NotStarted => "NOT_STARTED",
            TransferStatus::Active => "ACTIVE",
            TransferStatus::Paused => "PAUSED",
            TransferStatus::Completed => "COMPLETED",
            TransferStatus::SourceAborted => "SOURCE_ABORTED",
            TransferStatus::TargetAborted => "TARGET_ABORTED",
            TransferStatus::Error => "ERROR",
            TransferStatus::Cancelled => "CANCELLED",
        }
    }

    /// Terminal statuses tear the transfer down; no transition leaves them.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed
                | TransferStatus::SourceAborted
                | TransferStatus::TargetAborted
                | TransferStatus::Error
                | TransferStatus::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// register / unregister payloads
// ---------------------------------------------------------------------------

/// One element of a `register` params array.
///
/// `id` + `signature` together claim a previously assigned id; both must be
/// present for the claim to be considered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterItem {
    pub name: String,
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub size: u64,
    pub flags: SourceFlags,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// One element of a `register` result array.  `error` is always present
/// (`null` on success); `id`/`signature` only on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl RegisterAck {
    pub fn ok(id: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            error: None,
            id: Some(id.into()),
            signature: Some(signature.into()),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            id: None,
            signature: None,
        }
    }
}

/// One element of an `unregister` params array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterItem {
    pub id: String,
    /// `true` aborts running transfers; the default is graceful.
    #[serde(default)]
    pub force: bool,
}

/// One element of an `unregister` result array.  The relay answers
/// `{"result": true}` whether or not the id existed or was owned by the
/// caller; only malformed elements carry an `error` instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UnregisterAck {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            result: Some(true),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Byte ranges
// ---------------------------------------------------------------------------

/// An inclusive byte range as carried in `push-request` /
/// `fileTransferNew` params.  `end == None` means "to the end of the
/// source" and is encoded as `-1` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    fn end_wire(self) -> i64 {
        match self.end {
            Some(e) => i64::try_from(e).unwrap_or(i64::MAX),
            None => -1,
        }
    }
}

// ---------------------------------------------------------------------------
// push-request / fileTransferNew positional params
// ---------------------------------------------------------------------------

/// Params of both `push-request` and `fileTransferNew`:
/// `[source-id, transfer-id]` optionally followed by `[byte-start,
/// byte-end]`.  Both methods share one positional shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushParams {
    pub source_id: String,
    pub transfer_id: String,
    pub range: Option<ByteRange>,
}

impl PushParams {
    #[must_use]
    pub fn to_params(&self) -> Value {
        let mut arr = vec![json!(self.source_id), json!(self.transfer_id)];
        if let Some(range) = self.range {
            arr.push(json!(range.start));
            arr.push(json!(range.end_wire()));
        }
        Value::Array(arr)
    }

    pub fn from_params(params: &Value) -> Result<Self, &'static str> {
        let arr = params
            .as_array()
            .ok_or("push params must be an array of at least 2 elements")?;
        if arr.len() < 2 {
            return Err("push params must be an array of at least 2 elements");
        }
        let source_id = arr[0]
            .as_str()
            .ok_or("first push param must be a source id string")?
            .to_owned();
        let transfer_id = arr[1]
            .as_str()
            .ok_or("second push param must be a transfer id string")?
            .to_owned();
        let range = if arr.len() > 2 {
            let start = arr[2].as_u64().ok_or("byte-start must be a non-negative integer")?;
            let end = match arr.get(3) {
                None => None,
                Some(v) => {
                    let raw = v.as_i64().ok_or("byte-end must be an integer")?;
                    if raw < 0 {
                        None
                    } else {
                        #[allow(clippy::cast_sign_loss)]
                        Some(raw as u64)
                    }
                }
            };
            Some(ByteRange { start, end })
        } else {
            None
        };
        Ok(Self {
            source_id,
            transfer_id,
            range,
        })
    }
}

// ---------------------------------------------------------------------------
// Status reporting payloads
// ---------------------------------------------------------------------------

/// One element of a `transfer-status` notification array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferStatusEntry {
    pub id: String,
    pub status: TransferStatus,
    pub transferred: u64,
    /// Observed incoming rate in bytes per second.
    pub bandwidth: u64,
}

/// Params of `transfer-started`: `[transfer-id, name, size, true]`.
#[must_use]
pub fn transfer_started_params(transfer_id: &str, name: &str, size: u64) -> Value {
    json!([transfer_id, name, size, true])
}

/// Params of `transfer-finished`: `[transfer-id, status]`.
#[must_use]
pub fn transfer_finished_params(transfer_id: &str, status: TransferStatus) -> Value {
    json!([transfer_id, status])
}

/// Params of `update-file-size`: `[source-id, new-size]`.
#[must_use]
pub fn update_file_size_params(source_id: &str, new_size: u64) -> Value {
    json!([source_id, new_size])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_notification_and_response_frames() {
        let req = Envelope::parse(r#"{"method":"register","id":5,"params":[{}]}"#).unwrap();
        match req {
            Envelope::Request { id, method, params } => {
                assert_eq!(id, json!(5));
                assert_eq!(method, "register");
                assert!(params.is_array());
            }
            other => panic!("expected request, got {other:?}"),
        }

        let notif = Envelope::parse(r#"{"method":"push-request","params":["a","b"]}"#).unwrap();
        assert!(matches!(notif, Envelope::Notification { ref method, .. } if method == "push-request"));

        let resp = Envelope::parse(r#"{"id":5,"error":null,"result":[1,2]}"#).unwrap();
        match resp {
            Envelope::Response { id, result, error } => {
                assert_eq!(id, json!(5));
                assert_eq!(result, json!([1, 2]));
                assert!(error.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn parses_error_response_frame() {
        let resp =
            Envelope::parse(r#"{"id":9,"error":{"code":-32601,"message":"no such method"}}"#)
                .unwrap();
        match resp {
            Envelope::Response { error: Some(e), .. } => {
                assert_eq!(e.code, error_codes::METHOD_NOT_FOUND);
                assert_eq!(e.message, "no such method");
            }
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(
            Envelope::parse("{not-json"),
            Err(EnvelopeError::Json(_))
        ));
        assert!(matches!(
            Envelope::parse("[1,2,3]"),
            Err(EnvelopeError::Shape(_))
        ));
        assert!(matches!(
            Envelope::parse(r#"{"params":[]}"#),
            Err(EnvelopeError::Shape(_))
        ));
        assert!(matches!(
            Envelope::parse(r#"{"method":42,"id":1}"#),
            Err(EnvelopeError::Shape(_))
        ));
    }

    #[test]
    fn response_frame_carries_explicit_null_error() {
        let frame = response_frame(&json!(5), &json!([{"result": true}]));
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert!(value.get("error").is_some_and(Value::is_null));
        assert_eq!(value["id"], json!(5));
        assert_eq!(value["result"], json!([{"result": true}]));
    }

    #[test]
    fn register_item_serializes_with_wire_field_names() {
        let item = RegisterItem {
            name: "hi.txt".to_owned(),
            content_type: "text/plain".to_owned(),
            size: 5,
            flags: SourceFlags::CHUNKABLE,
            tags: vec![],
            id: None,
            signature: None,
        };
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(
            value,
            json!({"name": "hi.txt", "type": "text/plain", "size": 5, "flags": 8})
        );
    }

    #[test]
    fn register_ack_error_member_is_always_present() {
        let ok = serde_json::to_value(RegisterAck::ok("1a0abc", "sig")).unwrap();
        assert_eq!(
            ok,
            json!({"error": null, "id": "1a0abc", "signature": "sig"})
        );

        let err = serde_json::to_value(RegisterAck::err("Invalid source signature")).unwrap();
        assert_eq!(err, json!({"error": "Invalid source signature"}));
    }

    #[test]
    fn push_params_round_trip_with_and_without_range() {
        let plain = PushParams {
            source_id: "src".to_owned(),
            transfer_id: "xfer".to_owned(),
            range: None,
        };
        assert_eq!(plain.to_params(), json!(["src", "xfer"]));
        assert_eq!(PushParams::from_params(&plain.to_params()).unwrap(), plain);

        let ranged = PushParams {
            source_id: "src".to_owned(),
            transfer_id: "xfer".to_owned(),
            range: Some(ByteRange {
                start: 1,
                end: Some(3),
            }),
        };
        assert_eq!(ranged.to_params(), json!(["src", "xfer", 1, 3]));
        assert_eq!(PushParams::from_params(&ranged.to_params()).unwrap(), ranged);

        let open_ended = PushParams {
            source_id: "src".to_owned(),
            transfer_id: "xfer".to_owned(),
            range: Some(ByteRange {
                start: 4,
                end: None,
            }),
        };
        assert_eq!(open_ended.to_params(), json!(["src", "xfer", 4, -1]));
        assert_eq!(
            PushParams::from_params(&open_ended.to_params()).unwrap(),
            open_ended
        );
    }

    #[test]
    fn push_params_rejects_short_or_mistyped_arrays() {
        assert!(PushParams::from_params(&json!(["only-one"])).is_err());
        assert!(PushParams::from_params(&json!({"source": "x"})).is_err());
        assert!(PushParams::from_params(&json!([1, "xfer"])).is_err());
        assert!(PushParams::from_params(&json!(["src", "xfer", -4])).is_err());
    }

    #[test]
    fn flags_contain_and_union() {
        let flags = SourceFlags::PUBLIC.union(SourceFlags::CHUNKABLE);
        assert_eq!(flags.bits(), 9);
        assert!(flags.contains(SourceFlags::CHUNKABLE));
        assert!(!flags.contains(SourceFlags::LIVE));
        assert!(SourceFlags(15).contains(SourceFlags::CHUNKABLE));
        assert!(!SourceFlags(0).contains(SourceFlags::CHUNKABLE));
    }

    #[test]
    fn status_wire_names_are_screaming_snake() {
        assert_eq!(
            serde_json::to_value(TransferStatus::SourceAborted).unwrap(),
            json!("SOURCE_ABORTED")
        );
        assert_eq!(TransferStatus::NotStarted.as_str(), "NOT_STARTED");
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Cancelled.is_terminal());
        assert!(!TransferStatus::Active.is_terminal());
        assert!(!TransferStatus::Paused.is_terminal());
    }

    #[test]
    fn status_entry_serializes_for_status_reports() {
        let entry = TransferStatusEntry {
            id: "xfer-1".to_owned(),
            status: TransferStatus::Active,
            transferred: 1024,
            bandwidth: 2048,
        };
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({"id": "xfer-1", "status": "ACTIVE", "transferred": 1024, "bandwidth": 2048})
        );
    }
}
