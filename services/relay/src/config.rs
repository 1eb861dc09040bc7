//! Relay configuration loading.
//!
//! TOML is the sole config source.  Default config path:
//! `/etc/fileferry/fileferry.conf`.
//!
//! # Required fields
//! - `node.id` — the instance prefix stamped on every source id
//!
//! Everything else has a default.  `node.key` defaults to a random key
//! generated at startup, which means signed source claims do not survive a
//! restart unless a key is pinned in the config.

use rand::RngCore;
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/fileferry/fileferry.conf";

const DEFAULT_SOURCE_ID_START_DEPTH: u8 = 8;
const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_HTTPS_PORT: u16 = 443;
const DEFAULT_START_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub node: NodeConfig,
    pub http: HttpConfig,
    pub https: HttpsConfig,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Instance prefix visible at the front of every source id.
    pub id: String,
    /// HMAC key for source signatures.
    pub key: String,
    /// Initial total length of generated source ids.
    pub source_id_start_depth: u8,
    /// Canonical host; requests with a different `Host` are redirected.
    pub server_name: Option<String>,
    /// Bytes/sec ceiling on the seeder-facing side; 0 = unlimited.
    pub max_bandwidth_in: u64,
    /// Bytes/sec ceiling on the leecher-facing side; 0 = unlimited.
    pub max_bandwidth_out: u64,
    /// Seconds a leecher waits for the seeder's PUT before a 408.
    pub transfer_start_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub port: u16,
    pub force_https: bool,
    pub external_base_url: Option<String>,
    /// Directory served for the static web app.
    pub html_root: String,
}

/// TLS termination itself is out of scope; these keys feed redirect
/// construction and are passed through to whatever terminates TLS.
#[derive(Debug, Clone)]
pub struct HttpsConfig {
    pub port: u16,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub dh_depth: Option<u32>,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    node: Option<RawNodeConfig>,
    http: Option<RawHttpConfig>,
    https: Option<RawHttpsConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawNodeConfig {
    id: Option<String>,
    key: Option<String>,
    source_id_start_depth: Option<u8>,
    server_name: Option<String>,
    max_bandwidth_in: Option<u64>,
    max_bandwidth_out: Option<u64>,
    transfer_start_timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawHttpConfig {
    port: Option<u16>,
    force_https: Option<bool>,
    external_base_url: Option<String>,
    html_root: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawHttpsConfig {
    port: Option<u16>,
    cert: Option<String>,
    key: Option<String>,
    dh_depth: Option<u32>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load relay config from a file path.
pub fn load_config_from_path(path: &Path) -> Result<RelayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

/// Load relay config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<RelayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_node = raw.node.unwrap_or_default();
    let id = raw_node
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ConfigError::MissingField("node.id".to_owned()))?;

    let key = match raw_node.key.filter(|k| !k.is_empty()) {
        Some(key) => key,
        None => generate_node_key(),
    };

    // The id must leave room for at least one random suffix character.
    let depth_cap = 16 + u8::try_from(id.len()).unwrap_or(u8::MAX).min(64);
    let mut source_id_start_depth = raw_node
        .source_id_start_depth
        .filter(|&d| d != 0)
        .unwrap_or(DEFAULT_SOURCE_ID_START_DEPTH)
        .min(depth_cap);
    if usize::from(source_id_start_depth) <= id.len() {
        source_id_start_depth = u8::try_from(id.len() + 1)
            .map_err(|_| ConfigError::InvalidValue("node.id is too long".to_owned()))?;
    }

    let raw_http = raw.http.unwrap_or_default();
    let raw_https = raw.https.unwrap_or_default();

    Ok(RelayConfig {
        node: NodeConfig {
            id,
            key,
            source_id_start_depth,
            server_name: raw_node.server_name.filter(|s| !s.is_empty()),
            max_bandwidth_in: raw_node.max_bandwidth_in.unwrap_or(0),
            max_bandwidth_out: raw_node.max_bandwidth_out.unwrap_or(0),
            transfer_start_timeout: raw_node
                .transfer_start_timeout
                .filter(|&t| t != 0)
                .unwrap_or(DEFAULT_START_TIMEOUT_SECS),
        },
        http: HttpConfig {
            port: raw_http.port.unwrap_or(DEFAULT_HTTP_PORT),
            force_https: raw_http.force_https.unwrap_or(false),
            external_base_url: raw_http.external_base_url.filter(|s| !s.is_empty()),
            html_root: raw_http.html_root.unwrap_or_else(|| "./html".to_owned()),
        },
        https: HttpsConfig {
            port: raw_https.port.unwrap_or(DEFAULT_HTTPS_PORT),
            cert: raw_https.cert,
            key: raw_https.key,
            dh_depth: raw_https.dh_depth,
        },
    })
}

impl RelayConfig {
    /// Apply command-line port overrides on top of the file config.
    pub fn apply_overrides(&mut self, http_port: Option<u16>, https_port: Option<u16>) {
        if let Some(port) = http_port {
            self.http.port = port;
        }
        if let Some(port) = https_port {
            self.https.port = port;
        }
    }
}

fn generate_node_key() -> String {
    use base64::Engine as _;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
