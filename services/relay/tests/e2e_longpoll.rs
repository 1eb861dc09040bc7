//! The long-poll transport exercised over real HTTP: handshake, frame
//! delivery in both directions, and parity with the WebSocket path.

mod common;

use serde_json::{json, Value};

#[tokio::test]
async fn register_and_receive_push_requests_over_long_poll() {
    let relay = common::spawn_relay(30).await;
    let client = common::http_client();

    // Handshake assigns the peer id.
    let response = client
        .post(format!("{}/transport/handshake", relay.base_url))
        .send()
        .await
        .expect("handshake completes");
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("handshake json");
    let peer_id = body["peer-id"].as_str().expect("peer id").to_owned();

    // Register by POSTing a frame batch.
    let frame = json!({
        "method": "register",
        "id": 1,
        "params": [{"name": "hi.txt", "type": "text/plain", "size": 5, "flags": 0}]
    })
    .to_string();
    let response = client
        .post(format!("{}/transport/lp/{peer_id}", relay.base_url))
        .json(&json!([frame]))
        .send()
        .await
        .expect("push completes");
    assert_eq!(response.status(), 200);

    // The response envelope comes back on the next poll.
    let response = client
        .get(format!("{}/transport/lp/{peer_id}", relay.base_url))
        .send()
        .await
        .expect("poll completes");
    let frames: Vec<String> = response.json().await.expect("poll json");
    assert_eq!(frames.len(), 1);
    let envelope: Value = serde_json::from_str(&frames[0]).expect("envelope json");
    assert_eq!(envelope["id"], json!(1));
    let source_id = envelope["result"][0]["id"].as_str().expect("id").to_owned();

    // A leecher GET makes the push request land in this peer's queue.
    let get_task = tokio::spawn({
        let client = client.clone();
        let url = format!("{}/{source_id}", relay.base_url);
        async move {
            client
                .get(&url)
                .header(reqwest::header::USER_AGENT, "curl/7.88")
                .send()
                .await
                .expect("GET completes")
        }
    });

    let response = client
        .get(format!("{}/transport/lp/{peer_id}", relay.base_url))
        .send()
        .await
        .expect("poll completes");
    let frames: Vec<String> = response.json().await.expect("poll json");
    assert!(!frames.is_empty());
    let notification: Value = serde_json::from_str(&frames[0]).expect("notification json");
    assert_eq!(notification["method"], json!("fileTransferNew"));
    assert_eq!(notification["params"][0], json!(source_id));
    let transfer_id = notification["params"][1].as_str().expect("transfer id").to_owned();

    client
        .put(format!("{}/{transfer_id}", relay.base_url))
        .body("hello")
        .send()
        .await
        .expect("PUT completes");
    let response = get_task.await.expect("leecher task");
    assert_eq!(response.text().await.expect("body"), "hello");
}

#[tokio::test]
async fn polling_an_unknown_peer_is_404() {
    let relay = common::spawn_relay(30).await;
    let client = common::http_client();

    let response = client
        .get(format!("{}/transport/lp/made-up-peer", relay.base_url))
        .send()
        .await
        .expect("poll completes");
    assert_eq!(response.status(), 404);
}
