//! Shared harness: a relay on an ephemeral port, served for real.

use relay::config::load_config_from_str;
use relay::{build_router, AppState};

pub const TEST_NODE_KEY: &str = "integration test key";

pub struct TestRelay {
    pub base_url: String,
    pub ws_url: String,
}

/// Spin up a relay with the given `transfer-start-timeout` and hand back
/// its URLs.  The listener lives until the test process exits.
pub async fn spawn_relay(start_timeout_secs: u64) -> TestRelay {
    spawn_relay_from_toml(&format!(
        "[node]\nid = \"1a0\"\nkey = \"{TEST_NODE_KEY}\"\ntransfer-start-timeout = {start_timeout_secs}\n"
    ))
    .await
}

pub async fn spawn_relay_from_toml(toml: &str) -> TestRelay {
    let config = load_config_from_str(toml).expect("test config parses");
    let state = AppState::new(config);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("relay serves");
    });

    TestRelay {
        base_url: format!("http://{addr}"),
        ws_url: format!("ws://{addr}/transport/ws"),
    }
}

/// A client that does not follow redirects, so 302s stay observable.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("client builds")
}
