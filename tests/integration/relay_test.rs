//! Relay and multicast integration tests.
//!
//! Two simulated machines, each with its own client and in-process hub,
//! share one in-memory queue provider as their network.

use std::sync::Arc;

use crossbus::bus::cloud::{FacadeOp, MemoryQueueFacade};
use crossbus::bus::{MockBroadcaster, MulticastBroadcaster};
use crossbus::{Broadcaster, BusError, Listener, TransportMode};

use crate::common::{cloud_client, eventually, local_client, settle, Recorder};

fn created() -> Vec<(String, String)> {
    vec![("orders".to_string(), "created:42".to_string())]
}

#[tokio::test]
async fn test_propagated_send_reaches_both_machines_once() {
    let network = Arc::new(MemoryQueueFacade::new());
    let a = cloud_client("machine-a", &network);
    let b = cloud_client("machine-b", &network);

    let a_recorder = Recorder::new();
    let a_listener = a.listener(TransportMode::InProcess).await.unwrap();
    a_listener.add_handler(a_recorder.clone()).await;
    a_listener.register_channel("orders").await.unwrap();

    let b_recorder = Recorder::new();
    let b_listener = b.listener(TransportMode::InProcess).await.unwrap();
    b_listener.add_handler(b_recorder.clone()).await;
    b_listener.register_channel("orders").await.unwrap();

    let broadcaster = a.broadcaster(TransportMode::InProcess, true).unwrap();
    broadcaster.send("orders", "created:42").await.unwrap();

    assert!(eventually(|| b_recorder.count() == 1).await);
    settle().await;

    // Local delivery on the sender, relayed delivery on the peer
    assert_eq!(a_recorder.messages(), created());
    assert_eq!(b_recorder.messages(), created());

    a_listener.dispose().await.unwrap();
    b_listener.dispose().await.unwrap();
}

#[tokio::test]
async fn test_propagated_send_reaches_other_process_on_same_host() {
    let network = Arc::new(MemoryQueueFacade::new());
    let first = cloud_client("host-1", &network);
    let second = cloud_client("host-1", &network);

    let first_recorder = Recorder::new();
    let first_listener = first.listener(TransportMode::InProcess).await.unwrap();
    first_listener.add_handler(first_recorder.clone()).await;
    first_listener.register_channel("orders").await.unwrap();

    let second_recorder = Recorder::new();
    let second_listener = second.listener(TransportMode::InProcess).await.unwrap();
    second_listener.add_handler(second_recorder.clone()).await;
    second_listener.register_channel("orders").await.unwrap();

    let broadcaster = first.broadcaster(TransportMode::InProcess, true).unwrap();
    broadcaster.send("orders", "created:42").await.unwrap();

    assert!(eventually(|| second_recorder.count() == 1).await);
    settle().await;

    // The sender hears its own send once, locally
    assert_eq!(first_recorder.messages(), created());
    assert_eq!(second_recorder.messages(), created());

    first_listener.dispose().await.unwrap();
    second_listener.dispose().await.unwrap();
}

#[tokio::test]
async fn test_unpropagated_send_stays_local() {
    let network = Arc::new(MemoryQueueFacade::new());
    let a = cloud_client("machine-a", &network);
    let b = cloud_client("machine-b", &network);

    let b_recorder = Recorder::new();
    let b_listener = b.listener(TransportMode::InProcess).await.unwrap();
    b_listener.add_handler(b_recorder.clone()).await;
    b_listener.register_channel("orders").await.unwrap();

    let broadcaster = a.broadcaster(TransportMode::InProcess, false).unwrap();
    broadcaster.send("orders", "created:42").await.unwrap();
    settle().await;

    assert_eq!(b_recorder.count(), 0);
    assert_eq!(network.calls(FacadeOp::Publish), 0);
    b_listener.dispose().await.unwrap();
}

#[tokio::test]
async fn test_relay_ignores_channels_peer_did_not_register() {
    let network = Arc::new(MemoryQueueFacade::new());
    let a = cloud_client("machine-a", &network);
    let b = cloud_client("machine-b", &network);

    let b_recorder = Recorder::new();
    let b_listener = b.listener(TransportMode::InProcess).await.unwrap();
    b_listener.add_handler(b_recorder.clone()).await;
    b_listener.register_channel("invoices").await.unwrap();

    let broadcaster = a.broadcaster(TransportMode::InProcess, true).unwrap();
    broadcaster.send("orders", "created:42").await.unwrap();
    broadcaster.send("invoices", "paid:7").await.unwrap();

    assert!(eventually(|| b_recorder.count() == 1).await);
    settle().await;
    assert_eq!(
        b_recorder.messages(),
        vec![("invoices".to_string(), "paid:7".to_string())]
    );
    b_listener.dispose().await.unwrap();
}

#[tokio::test]
async fn test_listener_without_network_is_plain_local() {
    let client = local_client("machine-a");

    let recorder = Recorder::new();
    let listener = client.listener(TransportMode::InProcess).await.unwrap();
    listener.add_handler(recorder.clone()).await;
    listener.register_channel("orders").await.unwrap();

    let broadcaster = client.broadcaster(TransportMode::InProcess, false).unwrap();
    broadcaster.send("orders", "created:42").await.unwrap();

    assert!(eventually(|| recorder.count() == 1).await);
    assert_eq!(recorder.messages(), created());
    assert!(matches!(
        client.broadcaster(TransportMode::InProcess, true),
        Err(BusError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_multicast_over_local_broadcasters() {
    let client = local_client("machine-a");

    let recorder = Recorder::new();
    let listener = client.listener(TransportMode::InProcess).await.unwrap();
    listener.add_handler(recorder.clone()).await;
    listener.register_channel("orders").await.unwrap();

    let multicast = client
        .multicast(&[TransportMode::InProcess, TransportMode::InProcess])
        .unwrap();
    multicast.send("orders", "created:42").await.unwrap();

    // Each member delivers its own copy
    assert!(eventually(|| recorder.count() == 2).await);
}

#[tokio::test]
async fn test_multicast_member_failure_does_not_block_others() {
    let failing = Arc::new(MockBroadcaster::new());
    failing.set_fail_on_send(true).await;
    let healthy = Arc::new(MockBroadcaster::new());
    let multicast = MulticastBroadcaster::new(vec![failing.clone(), healthy.clone()]);

    multicast.send("orders", "created:42").await.unwrap();

    let sent = healthy.take_sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].channel(), "orders");
    assert_eq!(sent[0].message(), "created:42");
    assert_eq!(failing.sent_count().await, 0);
}
