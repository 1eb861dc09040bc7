//! Content handlers: leecher `GET /{id}` and seeder `PUT /{id}`.
//!
//! The `GET` creates the transfer, asks the seeder to push, and parks
//! until the matching `PUT` pairs (or the start timeout fires).  The `PUT`
//! pairs, adopts a changed size, and drives the pump to a terminal
//! status.  Status codes on this surface: 200/206, 302, 404, 408, 416,
//! 500.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use percent_encoding::percent_decode_str;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use ferry_protocol::{ByteRange, TransferStatus};

use crate::engine::LeecherGuard;
use crate::state::AppState;
use crate::transfer::{self, Action, PairedResponse};

// ---------------------------------------------------------------------------
// Request parsing helpers
// ---------------------------------------------------------------------------

/// Outcome of looking at the `Range` header.
#[derive(Debug, PartialEq, Eq)]
pub enum RangeHeader {
    /// Absent, or a form this relay does not serve partially.
    None,
    Single(ByteRange),
    /// Multi-range requests are refused outright.
    Multi,
}

/// Parse `Range: bytes=s-e`.  Only a single ascending range is honoured;
/// suffix ranges and malformed specs are served as a full response, which
/// HTTP permits.
#[must_use]
pub fn parse_range(headers: &HeaderMap) -> RangeHeader {
    let Some(value) = headers.get(header::RANGE) else {
        return RangeHeader::None;
    };
    let Ok(raw) = value.to_str() else {
        return RangeHeader::None;
    };
    let Some(ranges) = raw.trim().strip_prefix("bytes=") else {
        return RangeHeader::None;
    };
    if ranges.contains(',') {
        return RangeHeader::Multi;
    }
    let Some((start, end)) = ranges.split_once('-') else {
        return RangeHeader::None;
    };
    let Ok(start) = start.trim().parse::<u64>() else {
        return RangeHeader::None;
    };
    let end = end.trim();
    if end.is_empty() {
        return RangeHeader::Single(ByteRange { start, end: None });
    }
    match end.parse::<u64>() {
        Ok(end) if end >= start => RangeHeader::Single(ByteRange {
            start,
            end: Some(end),
        }),
        _ => RangeHeader::None,
    }
}

/// The deliberately naive browser sniff: a UX convenience for the
/// redirect-to-app behaviour, not a security boundary.
#[must_use]
pub fn user_agent_is_browser(headers: &HeaderMap) -> bool {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ua| ua.starts_with("Mozilla") || ua.starts_with("Opera"))
}

/// Minimal query-string decode; later duplicates win.
#[must_use]
pub fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Some(query) = query else { return map };
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = percent_decode_str(key).decode_utf8_lossy().into_owned();
        let value = percent_decode_str(value).decode_utf8_lossy().into_owned();
        map.insert(key, value);
    }
    map
}

fn empty_status(status: StatusCode) -> Response {
    status.into_response()
}

// ---------------------------------------------------------------------------
// GET /{id}
// ---------------------------------------------------------------------------

pub async fn content_get(
    state: &AppState,
    id: &str,
    action_segment: Option<&str>,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Response {
    let node = &state.node;
    let Some(source) = node.registry().lookup(id) else {
        return empty_status(StatusCode::NOT_FOUND);
    };

    let action_raw = action_segment
        .filter(|s| !s.is_empty())
        .or_else(|| query.get("action").map(String::as_str));

    // Browsers with no explicit action land on the app, which takes over
    // with the id in the fragment.
    if action_raw.is_none() && user_agent_is_browser(headers) {
        let base = state
            .config
            .http
            .external_base_url
            .as_deref()
            .map_or(String::new(), |base| base.trim_end_matches('/').to_owned());
        return redirect_found(&format!("{base}/#{id}"));
    }

    let range = match parse_range(headers) {
        RangeHeader::Multi => return empty_status(StatusCode::RANGE_NOT_SATISFIABLE),
        RangeHeader::None => None,
        RangeHeader::Single(range) => {
            if source.is_chunkable() {
                Some(range)
            } else if range.start == 0 && range.end.is_none() {
                // `bytes=0-` on a non-chunkable source is the whole body.
                None
            } else {
                return empty_status(StatusCode::RANGE_NOT_SATISFIABLE);
            }
        }
    };
    if let Some(range) = range {
        // A streaming source of unknown size has no addressable bytes.
        if source.size() == 0 || range.start >= source.size() {
            return empty_status(StatusCode::RANGE_NOT_SATISFIABLE);
        }
    }

    let action = Action::parse(action_raw);
    let target_peer = query
        .get("peer")
        .and_then(|peer_id| node.hub().lookup(peer_id));

    let engine = Arc::clone(node.engine());
    let (transfer, pair_rx) =
        engine.create_transfer(source, action, range, target_peer.as_ref());

    if !node.notify_file_transfer_new(&transfer).await {
        // The seeder's signalling channel is gone; the content is not
        // reachable anymore.
        engine.cancel(&transfer);
        return empty_status(StatusCode::NOT_FOUND);
    }

    // If the leecher hangs up while we park here, the guard tears the
    // transfer down.
    let guard = LeecherGuard::new(Arc::clone(&engine), Arc::clone(&transfer));
    let waited = tokio::select! {
        () = transfer.cancel_token().cancelled() => Err(WaitEnd::Cancelled),
        paired = tokio::time::timeout(engine.start_timeout(), pair_rx) => match paired {
            Err(_elapsed) => Err(WaitEnd::Timeout),
            Ok(Err(_sender_gone)) => Err(WaitEnd::Cancelled),
            Ok(Ok(paired)) => Ok(paired),
        },
    };
    guard.defuse();

    match waited {
        Ok(paired) => leecher_response(&transfer, paired),
        Err(WaitEnd::Timeout) => {
            engine.expire_unpaired(&transfer);
            empty_status(StatusCode::REQUEST_TIMEOUT)
        }
        Err(WaitEnd::Cancelled) => {
            engine.cancel(&transfer);
            empty_status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

enum WaitEnd {
    Timeout,
    Cancelled,
}

fn redirect_found(location: &str) -> Response {
    let Ok(value) = HeaderValue::from_str(location) else {
        return empty_status(StatusCode::INTERNAL_SERVER_ERROR);
    };
    let mut response = empty_status(StatusCode::FOUND);
    response.headers_mut().insert(header::LOCATION, value);
    response
}

fn leecher_response(transfer: &transfer::Transfer, paired: PairedResponse) -> Response {
    let source = transfer.source();
    let status = if paired.resolved.content_range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, source.content_type())
        .header(header::CONTENT_LENGTH, paired.resolved.transfer_len)
        .header(header::CONNECTION, "keep-alive");

    if let Some((start, end, total)) = paired.resolved.content_range {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{total}"),
        );
    }

    if transfer.action().as_attachment() {
        let name = percent_decode_str(source.name()).decode_utf8_lossy().into_owned();
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{name}\"")) {
            builder = builder.header(header::CONTENT_DISPOSITION, value);
        } else {
            debug!(source_id = %source.id(), "file name not representable in a header, disposition skipped");
        }
    }

    match builder.body(Body::from_stream(ReceiverStream::new(paired.body))) {
        Ok(response) => response,
        Err(error) => {
            warn!(%error, "failed to build leecher response");
            empty_status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ---------------------------------------------------------------------------
// PUT /{id}
// ---------------------------------------------------------------------------

pub async fn content_put(state: &AppState, id: &str, headers: &HeaderMap, body: Body) -> Response {
    let node = &state.node;
    let Some(transfer) = node.engine().lookup(id) else {
        return empty_status(StatusCode::NOT_FOUND);
    };
    let source = transfer.source();

    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    // A full-body push whose length differs from the registered size
    // updates the source for everyone, including the seeder itself.
    let mut final_size = source.size();
    if let Some(len) = content_length {
        if transfer.requested_range().is_none() && len != final_size {
            node.adopt_size_change(&transfer, len).await;
            final_size = len;
        }
    }

    let Some(tx) = transfer::pair(&transfer, final_size) else {
        // Already paired, already terminal, or the leecher is gone.
        return empty_status(StatusCode::NOT_FOUND);
    };

    // Sent after pairing, not at GET time.
    node.notify_transfer_started(&transfer).await;

    let engine = node.engine();
    let status = transfer::run_pump(
        &transfer,
        body.into_data_stream(),
        tx,
        engine.pace_bytes_per_sec(),
    )
    .await;
    engine.pump_finished(&transfer, status);

    match status {
        TransferStatus::Completed => empty_status(StatusCode::OK),
        _ => empty_status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(name: header::HeaderName, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn range_parsing_covers_the_wire_forms() {
        assert_eq!(parse_range(&HeaderMap::new()), RangeHeader::None);
        assert_eq!(
            parse_range(&headers_with(header::RANGE, "bytes=1-3")),
            RangeHeader::Single(ByteRange {
                start: 1,
                end: Some(3)
            })
        );
        assert_eq!(
            parse_range(&headers_with(header::RANGE, "bytes=4-")),
            RangeHeader::Single(ByteRange {
                start: 4,
                end: None
            })
        );
        assert_eq!(
            parse_range(&headers_with(header::RANGE, "bytes=0-2,5-9")),
            RangeHeader::Multi
        );
        // Suffix, inverted, and garbage forms fall back to a full body.
        assert_eq!(
            parse_range(&headers_with(header::RANGE, "bytes=-500")),
            RangeHeader::None
        );
        assert_eq!(
            parse_range(&headers_with(header::RANGE, "bytes=9-2")),
            RangeHeader::None
        );
        assert_eq!(
            parse_range(&headers_with(header::RANGE, "chapters=1-3")),
            RangeHeader::None
        );
    }

    #[test]
    fn browser_sniff_is_prefix_based() {
        assert!(user_agent_is_browser(&headers_with(
            header::USER_AGENT,
            "Mozilla/5.0 (X11; Linux x86_64)"
        )));
        assert!(user_agent_is_browser(&headers_with(
            header::USER_AGENT,
            "Opera/9.80"
        )));
        assert!(!user_agent_is_browser(&headers_with(
            header::USER_AGENT,
            "curl/7.88"
        )));
        assert!(!user_agent_is_browser(&HeaderMap::new()));
    }

    #[test]
    fn query_parsing_decodes_and_last_wins() {
        let query = parse_query(Some("action=view&peer=p%2D1&action=open"));
        assert_eq!(query.get("action").map(String::as_str), Some("open"));
        assert_eq!(query.get("peer").map(String::as_str), Some("p-1"));
        assert!(parse_query(None).is_empty());
        assert!(parse_query(Some("")).is_empty());

        let flag_only = parse_query(Some("download"));
        assert_eq!(flag_only.get("download").map(String::as_str), Some(""));
    }
}
