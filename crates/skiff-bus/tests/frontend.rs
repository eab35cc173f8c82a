//! Integration tests for the guest-facing TCP frontend.

use skiff_bus::{BucketConfig, Bus, BusConfig, BusError, GuestClient, HandlerFuture};
use skiff_common::VmId;
use std::time::Duration;

async fn start_bus() -> (Bus, skiff_bus::BusHandle) {
    Bus::start(BusConfig::default()).await.expect("bus starts")
}

async fn connected_guest(bus: &Bus, handle: &skiff_bus::BusHandle) -> (VmId, GuestClient) {
    let vm_id = VmId::new();
    let creds = handle.mint_credentials(vm_id).await.expect("mint");
    let client = GuestClient::connect(bus.client_url(), vm_id, &creds.user_seed)
        .await
        .expect("guest connects");
    (vm_id, client)
}

#[tokio::test]
async fn test_guest_connect_and_receive() {
    let (bus, handle) = start_bus().await;
    let (vm_id, client) = connected_guest(&bus, &handle).await;

    let subject = format!("agentint.{vm_id}.deploy");
    let mut sub = client.subscribe(&subject).await.expect("subscribe");

    // Give the sub frame time to land before publishing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.publish(&subject, b"payload".to_vec()).await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("delivered")
        .expect("open");
    assert_eq!(msg.subject, subject);
    assert_eq!(msg.payload, b"payload");
}

#[tokio::test]
async fn test_bad_seed_rejected() {
    let (bus, handle) = start_bus().await;
    let vm_id = VmId::new();
    let _creds = handle.mint_credentials(vm_id).await.unwrap();

    let err = GuestClient::connect(bus.client_url(), vm_id, "SUASWRONG")
        .await
        .map(|_| ())
        .expect_err("must be rejected");
    assert!(matches!(err, BusError::Unauthorized(_)));
}

#[tokio::test]
async fn test_unknown_vm_rejected() {
    let (bus, _handle) = start_bus().await;
    let err = GuestClient::connect(bus.client_url(), VmId::new(), "SUASNOBODY")
        .await
        .map(|_| ())
        .expect_err("must be rejected");
    assert!(matches!(err, BusError::Unauthorized(_)));
}

#[tokio::test]
async fn test_guest_request_node_responds() {
    let (bus, handle) = start_bus().await;
    let (vm_id, client) = connected_guest(&bus, &handle).await;

    let subject = format!("agentint.{vm_id}.handshake");
    let responder = handle.clone();
    let _sub = handle
        .subscribe(&subject, move |msg| {
            let bus = responder.clone();
            Box::pin(async move {
                if let Some(reply) = msg.reply {
                    let _ = bus.publish(&reply, b"{}".to_vec()).await;
                }
            }) as HandlerFuture
        })
        .await
        .unwrap();

    let reply = client
        .request(&subject, b"{\"id\":\"x\"}", Duration::from_secs(2))
        .await
        .expect("handshake acked");
    assert_eq!(reply.payload, b"{}");
}

#[tokio::test]
async fn test_node_request_guest_responds() {
    let (bus, handle) = start_bus().await;
    let (vm_id, client) = connected_guest(&bus, &handle).await;

    let subject = format!("agentint.{vm_id}.deploy");
    let mut sub = client.subscribe(&subject).await.unwrap();
    let responder = client.clone();
    tokio::spawn(async move {
        while let Some(msg) = sub.next().await {
            let _ = responder
                .respond(&msg, b"{\"accepted\":true}")
                .await;
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let reply = handle
        .request(&subject, b"{}".to_vec(), Duration::from_secs(2))
        .await
        .expect("guest acked");
    assert_eq!(reply.payload, b"{\"accepted\":true}");
}

#[tokio::test]
async fn test_fetch_object() {
    let (bus, handle) = start_bus().await;
    let (_vm_id, client) = connected_guest(&bus, &handle).await;

    handle.object_store().create("NEXCACHE", BucketConfig::default());
    handle
        .object_store()
        .put("NEXCACHE", "echo", b"binary bits".to_vec())
        .unwrap();

    let bytes = client.fetch_object("NEXCACHE", "echo").await.unwrap();
    assert_eq!(bytes, b"binary bits");

    let err = client.fetch_object("NEXCACHE", "missing").await.unwrap_err();
    assert!(matches!(err, BusError::ObjectNotFound { .. }));
}

#[tokio::test]
async fn test_foreign_subject_not_delivered() {
    let (bus, handle) = start_bus().await;
    let (_vm_id, client) = connected_guest(&bus, &handle).await;
    let other = VmId::new();

    // The subscribe is denied server-side; nothing published on the
    // foreign subject may reach this guest.
    let foreign = format!("agentint.{other}.deploy");
    let mut sub = client.subscribe(&foreign).await.expect("frame sent");
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle.publish(&foreign, b"secret".to_vec()).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_millis(200), sub.next()).await;
    assert!(outcome.is_err(), "foreign subject delivery must not happen");
}

#[tokio::test]
async fn test_revoke_terminates_connection() {
    let (bus, handle) = start_bus().await;
    let (vm_id, client) = connected_guest(&bus, &handle).await;

    let subject = format!("agentint.{vm_id}.deploy");
    let mut sub = client.subscribe(&subject).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle.revoke_credentials(&vm_id).await;

    // The server closes the connection; the subscription stream ends.
    let outcome = tokio::time::timeout(Duration::from_secs(2), sub.next()).await;
    assert!(outcome.expect("stream ended").is_none());
}
