//! Transfer lifecycle edges: size changes, seeder loss mid-pump, the
//! start timeout, and protocol-driven cancellation.

mod common;

use std::time::{Duration, Instant};

use bytes::Bytes;
use ferry_test_utils::MockPeer;
use reqwest::header;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

async fn register(seeder: &mut MockPeer, size: u64) -> String {
    let result = seeder
        .call(
            "register",
            json!([{"name": "hi.txt", "type": "text/plain", "size": size, "flags": 0}]),
        )
        .await
        .expect("register succeeds");
    result[0]["id"].as_str().expect("id assigned").to_owned()
}

#[tokio::test]
async fn a_push_with_a_different_length_updates_the_source() {
    let relay = common::spawn_relay(30).await;
    let client = common::http_client();

    let mut seeder = MockPeer::connect(&relay.ws_url).await.expect("seeder connects");
    let source_id = register(&mut seeder, 5).await;

    let get_task = tokio::spawn({
        let client = client.clone();
        let url = format!("{}/{source_id}", relay.base_url);
        async move {
            client
                .get(&url)
                .header(header::USER_AGENT, "curl/7.88")
                .send()
                .await
                .expect("GET completes")
        }
    });

    let params = seeder.next_notification_of("fileTransferNew").await.unwrap();
    let transfer_id = params[1].as_str().unwrap().to_owned();

    // Six bytes against a registered size of five.
    let put_response = client
        .put(format!("{}/{transfer_id}", relay.base_url))
        .body("hello!")
        .send()
        .await
        .expect("PUT completes");
    assert_eq!(put_response.status(), 200);

    let update = seeder
        .next_notification_of("update-file-size")
        .await
        .expect("size update");
    assert_eq!(update, json!([source_id, 6]));

    let response = get_task.await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "6");
    assert_eq!(response.text().await.unwrap(), "hello!");

    let finished = seeder.next_notification_of("transfer-finished").await.unwrap();
    assert_eq!(finished, json!([transfer_id, "COMPLETED"]));
}

#[tokio::test]
async fn seeder_transport_loss_mid_pump_aborts_the_transfer() {
    let relay = common::spawn_relay(30).await;
    let client = common::http_client();

    let mut seeder = MockPeer::connect(&relay.ws_url).await.expect("seeder connects");
    let source_id = register(&mut seeder, 5).await;

    let get_task = tokio::spawn({
        let client = client.clone();
        let url = format!("{}/{source_id}", relay.base_url);
        async move {
            client
                .get(&url)
                .header(header::USER_AGENT, "curl/7.88")
                .send()
                .await
                .expect("GET headers arrive")
        }
    });

    let params = seeder.next_notification_of("fileTransferNew").await.unwrap();
    let transfer_id = params[1].as_str().unwrap().to_owned();

    // Push two of the five bytes, then hold the body open.
    let (body_tx, body_rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(4);
    let put_task = tokio::spawn({
        let client = client.clone();
        let url = format!("{}/{transfer_id}", relay.base_url);
        async move {
            client
                .put(&url)
                .header(header::CONTENT_LENGTH, 5)
                .body(reqwest::Body::wrap_stream(ReceiverStream::new(body_rx)))
                .send()
                .await
        }
    });
    body_tx
        .send(Ok(Bytes::from_static(b"he")))
        .await
        .expect("body chunk accepted");

    // Wait until the leecher has its headers, then kill the signalling
    // channel: the source is released and the pump cancelled.
    let response = get_task.await.expect("leecher task");
    assert_eq!(response.status(), 200);
    tokio::time::sleep(Duration::from_millis(200)).await;
    seeder.close().await.expect("close sent");

    // The leecher's connection is torn down short of the promised length.
    assert!(
        response.bytes().await.is_err(),
        "leecher body should not complete cleanly"
    );

    // The seeder's PUT does not end in a 200.
    match put_task.await.expect("put task") {
        Ok(response) => assert_ne!(response.status(), 200),
        Err(_) => {} // connection may drop before a status arrives
    }
    drop(body_tx);

    // The transfer is gone from the index.
    let retry = client
        .put(format!("{}/{transfer_id}", relay.base_url))
        .body("hello")
        .send()
        .await
        .expect("PUT completes");
    assert_eq!(retry.status(), 404);
}

#[tokio::test]
async fn start_timeout_answers_408_and_removes_the_transfer() {
    let relay = common::spawn_relay(1).await;
    let client = common::http_client();

    let mut seeder = MockPeer::connect(&relay.ws_url).await.expect("seeder connects");
    let source_id = register(&mut seeder, 5).await;

    let started = Instant::now();
    let response = client
        .get(format!("{}/{source_id}", relay.base_url))
        .header(header::USER_AGENT, "curl/7.88")
        .send()
        .await
        .expect("GET completes");
    assert_eq!(response.status(), 408);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(8));

    let params = seeder.next_notification_of("fileTransferNew").await.unwrap();
    let transfer_id = params[1].as_str().unwrap().to_owned();
    let finished = seeder.next_notification_of("transfer-finished").await.unwrap();
    assert_eq!(finished, json!([transfer_id, "ERROR"]));

    // Too late: the transfer no longer exists.
    let late_put = client
        .put(format!("{}/{transfer_id}", relay.base_url))
        .body("hello")
        .send()
        .await
        .expect("PUT completes");
    assert_eq!(late_put.status(), 404);
}

#[tokio::test]
async fn a_target_peer_hears_about_the_transfer_after_pairing() {
    let relay = common::spawn_relay(30).await;
    let client = common::http_client();

    let mut seeder = MockPeer::connect(&relay.ws_url).await.expect("seeder connects");
    let source_id = register(&mut seeder, 5).await;
    let mut target = MockPeer::connect(&relay.ws_url).await.expect("target connects");

    let get_task = tokio::spawn({
        let client = client.clone();
        let url = format!(
            "{}/{source_id}?action=download&peer={}",
            relay.base_url,
            target.peer_id()
        );
        async move { client.get(&url).send().await.expect("GET completes") }
    });

    let params = seeder.next_notification_of("fileTransferNew").await.unwrap();
    let transfer_id = params[1].as_str().unwrap().to_owned();

    // Nothing reaches the target until the seeder's PUT pairs.
    let early = tokio::time::timeout(Duration::from_millis(300), target.next_notification()).await;
    assert!(early.is_err(), "transfer-started must wait for pairing");

    client
        .put(format!("{}/{transfer_id}", relay.base_url))
        .body("hello")
        .send()
        .await
        .expect("PUT completes");

    let started = target
        .next_notification_of("transfer-started")
        .await
        .expect("started notice");
    assert_eq!(started, json!([transfer_id, "hi.txt", 5, true]));

    let finished = target
        .next_notification_of("transfer-finished")
        .await
        .expect("finish notice");
    assert_eq!(finished, json!([transfer_id, "COMPLETED"]));

    let response = get_task.await.unwrap();
    assert_eq!(response.text().await.unwrap(), "hello");
}

#[tokio::test]
async fn cancel_transfer_aborts_a_waiting_leecher() {
    let relay = common::spawn_relay(30).await;
    let client = common::http_client();

    let mut seeder = MockPeer::connect(&relay.ws_url).await.expect("seeder connects");
    let source_id = register(&mut seeder, 5).await;

    let get_task = tokio::spawn({
        let client = client.clone();
        let url = format!("{}/{source_id}", relay.base_url);
        async move {
            client
                .get(&url)
                .header(header::USER_AGENT, "curl/7.88")
                .send()
                .await
                .expect("GET completes")
        }
    });

    let params = seeder.next_notification_of("fileTransferNew").await.unwrap();
    let transfer_id = params[1].as_str().unwrap().to_owned();

    let result = seeder
        .call("cancelTransfer", json!([transfer_id]))
        .await
        .expect("cancel succeeds");
    assert_eq!(result, json!(true));

    let response = get_task.await.unwrap();
    assert_eq!(response.status(), 500);

    let finished = seeder.next_notification_of("transfer-finished").await.unwrap();
    assert_eq!(finished, json!([transfer_id, "SOURCE_ABORTED"]));
}

#[tokio::test]
async fn forced_unregister_aborts_the_waiting_leecher_too() {
    let relay = common::spawn_relay(30).await;
    let client = common::http_client();

    let mut seeder = MockPeer::connect(&relay.ws_url).await.expect("seeder connects");
    let source_id = register(&mut seeder, 5).await;

    let get_task = tokio::spawn({
        let client = client.clone();
        let url = format!("{}/{source_id}", relay.base_url);
        async move {
            client
                .get(&url)
                .header(header::USER_AGENT, "curl/7.88")
                .send()
                .await
                .expect("GET completes")
        }
    });
    let _ = seeder.next_notification_of("fileTransferNew").await.unwrap();

    let result = seeder
        .call("unregister", json!([{"id": source_id, "force": true}]))
        .await
        .expect("unregister succeeds");
    assert_eq!(result, json!([{"result": true}]));

    let response = get_task.await.unwrap();
    assert_eq!(response.status(), 500);

    // And the source is gone for the next leecher.
    let gone = client
        .get(format!("{}/{source_id}", relay.base_url))
        .header(header::USER_AGENT, "curl/7.88")
        .send()
        .await
        .expect("GET completes");
    assert_eq!(gone.status(), 404);
}
