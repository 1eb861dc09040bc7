pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod http;
pub mod node;
pub mod peers;
pub mod registry;
pub mod rpc;
pub mod state;
pub mod transfer;
pub mod transport;

pub use state::AppState;

use std::path::PathBuf;

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower::Service;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::config::RelayConfig;
use crate::http::content;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/transport/handshake", post(transport::longpoll::handshake))
        .route(
            "/transport/lp/{peer}",
            get(transport::longpoll::poll).post(transport::longpoll::push),
        )
        .route("/transport/ws", get(transport::ws::ws_transport_handler))
        .fallback(front_door)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            canonical_redirect,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// First path segment selects the handler; everything that is not the
/// transport, a reserved prefix, or the static app is content.
fn route_class(path: &str) -> RouteClass {
    let first = path.trim_start_matches('/').split('/').next().unwrap_or("");
    match first {
        "" | "js" => RouteClass::Static,
        "api" | "mgmt" | "transport" => RouteClass::Reserved,
        _ => RouteClass::Content,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RouteClass {
    Static,
    Reserved,
    Content,
}

async fn front_door(State(state): State<AppState>, req: Request) -> Response {
    let path = req.uri().path().to_owned();
    match route_class(&path) {
        RouteClass::Static => serve_static(&state, req).await,
        RouteClass::Reserved => StatusCode::NOT_FOUND.into_response(),
        RouteClass::Content => {
            let mut segments = path.trim_start_matches('/').split('/');
            let id = segments.next().unwrap_or("").to_owned();
            let action = segments.next().map(ToOwned::to_owned);
            let query = content::parse_query(req.uri().query());
            let headers = req.headers().clone();

            match req.method().clone() {
                Method::GET => {
                    content::content_get(&state, &id, action.as_deref(), &query, &headers).await
                }
                Method::PUT => content::content_put(&state, &id, &headers, req.into_body()).await,
                _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
            }
        }
    }
}

async fn serve_static(state: &AppState, req: Request) -> Response {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let root = PathBuf::from(&state.config.http.html_root);
    let index = root.join("index.html");
    let mut service = ServeDir::new(root).fallback(ServeFile::new(index));
    match service.call(req).await {
        Ok(response) => response.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

// ---------------------------------------------------------------------------
// HTTPS / host canonicalisation
// ---------------------------------------------------------------------------

async fn canonical_redirect(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let https_active = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("https"));
    let is_ws_upgrade = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);
    let path_and_query = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_owned();

    match redirect_target(
        &state.config,
        https_active,
        is_ws_upgrade,
        host.as_deref(),
        &path_and_query,
    ) {
        Some(location) => match HeaderValue::from_str(&location) {
            Ok(value) => {
                let mut response = StatusCode::FOUND.into_response();
                response.headers_mut().insert(header::LOCATION, value);
                response
            }
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        },
        None => next.run(req).await,
    }
}

/// Decide whether a request must be redirected to the canonical scheme
/// and host, and to where.  Plaintext is upgraded when `force-https` is
/// set (`wss://` for the transport), and a foreign `Host` is rewritten to
/// the configured server name.
fn redirect_target(
    config: &RelayConfig,
    https_active: bool,
    is_ws_upgrade: bool,
    host: Option<&str>,
    path_and_query: &str,
) -> Option<String> {
    let host_only = host.map(strip_port);
    let needs_https = config.http.force_https && !https_active;
    let wrong_host = config
        .node
        .server_name
        .as_deref()
        .is_some_and(|name| host_only != Some(name));
    if !needs_https && !wrong_host {
        return None;
    }

    let target_host = config
        .node
        .server_name
        .as_deref()
        .or(host_only)
        .unwrap_or("localhost");
    let secure = needs_https || https_active;
    let (scheme, port, default_port) = if secure {
        (
            if is_ws_upgrade { "wss" } else { "https" },
            config.https.port,
            443,
        )
    } else {
        (
            if is_ws_upgrade { "ws" } else { "http" },
            config.http.port,
            80,
        )
    };
    let port_part = if port == default_port {
        String::new()
    } else {
        format!(":{port}")
    };
    Some(format!("{scheme}://{target_host}{port_part}{path_and_query}"))
}

/// The host part of a `Host` header, IPv6 literals included.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map_or(host, |(v6, _)| v6);
    }
    host.split_once(':').map_or(host, |(name, _)| name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;

    #[test]
    fn first_segment_selects_the_handler_class() {
        assert_eq!(route_class("/"), RouteClass::Static);
        assert_eq!(route_class("/js/app.js"), RouteClass::Static);
        assert_eq!(route_class("/api/anything"), RouteClass::Reserved);
        assert_eq!(route_class("/mgmt"), RouteClass::Reserved);
        assert_eq!(route_class("/transport/other"), RouteClass::Reserved);
        assert_eq!(route_class("/1a0abcde"), RouteClass::Content);
        assert_eq!(route_class("/1a0abcde/download"), RouteClass::Content);
    }

    #[test]
    fn strip_port_handles_names_and_literals() {
        assert_eq!(strip_port("ferry.example.com"), "ferry.example.com");
        assert_eq!(strip_port("ferry.example.com:8080"), "ferry.example.com");
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("[2001:db8::1]"), "2001:db8::1");
    }

    #[test]
    fn force_https_redirects_plaintext_and_spares_tls() {
        let config = load_config_from_str(
            "[node]\nid = \"1a0\"\n[http]\nforce-https = true\n[https]\nport = 443\n",
        )
        .unwrap();

        assert_eq!(
            redirect_target(&config, false, false, Some("ferry.example.com"), "/abc"),
            Some("https://ferry.example.com/abc".to_owned())
        );
        // The signalling transport upgrades to wss.
        assert_eq!(
            redirect_target(&config, false, true, Some("ferry.example.com"), "/transport/ws"),
            Some("wss://ferry.example.com/transport/ws".to_owned())
        );
        // Already TLS-terminated upstream: pass through.
        assert_eq!(
            redirect_target(&config, true, false, Some("ferry.example.com"), "/abc"),
            None
        );
    }

    #[test]
    fn non_default_https_port_is_spelled_out() {
        let config = load_config_from_str(
            "[node]\nid = \"1a0\"\n[http]\nforce-https = true\n[https]\nport = 8443\n",
        )
        .unwrap();
        assert_eq!(
            redirect_target(&config, false, false, Some("h.example"), "/x?a=b"),
            Some("https://h.example:8443/x?a=b".to_owned())
        );
    }

    #[test]
    fn foreign_host_is_canonicalised() {
        let config = load_config_from_str(
            "[node]\nid = \"1a0\"\nserver-name = \"ferry.example.com\"\n[http]\nport = 8080\n",
        )
        .unwrap();
        assert_eq!(
            redirect_target(&config, false, false, Some("other.example:8080"), "/abc"),
            Some("http://ferry.example.com:8080/abc".to_owned())
        );
        assert_eq!(
            redirect_target(&config, false, false, Some("ferry.example.com:8080"), "/abc"),
            None
        );
    }

    #[test]
    fn plain_http_without_canonical_rules_passes_through() {
        let config = load_config_from_str("[node]\nid = \"1a0\"\n").unwrap();
        assert_eq!(
            redirect_target(&config, false, false, Some("anything.example"), "/abc"),
            None
        );
    }
}
