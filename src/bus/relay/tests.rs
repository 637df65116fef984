use super::*;
use crate::bus::{handler_fn, LocalHub, MockBroadcaster, TypedEnvelope};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

/// One simulated machine: its own in-process hub plus the shared network hub.
struct Machine {
    origin: RelayOrigin,
    broadcaster: RelayBroadcaster,
    listener: RelayListener,
    received: Arc<StdMutex<Vec<(String, String)>>>,
}

async fn machine(name: &str, network: &LocalHub) -> Machine {
    let hub = LocalHub::new();
    let origin = RelayOrigin::new(name);
    let broadcaster = RelayBroadcaster::new(
        Arc::new(hub.broadcaster()),
        Arc::new(network.broadcaster()),
        origin.clone(),
        TransportMode::InProcess,
    );
    let listener = RelayListener::new(
        Arc::new(hub.listener()),
        Arc::new(network.listener()),
        origin.clone(),
        TransportMode::InProcess,
    )
    .await;

    let received = Arc::new(StdMutex::new(Vec::new()));
    let sink = received.clone();
    listener
        .add_handler(handler_fn(move |msg| {
            sink.lock()
                .unwrap()
                .push((msg.channel.clone(), msg.envelope.message().to_string()));
        }))
        .await;

    Machine {
        origin,
        broadcaster,
        listener,
        received,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[test]
fn test_relay_channel_name() {
    assert_eq!(
        relay_channel(TransportMode::InProcess),
        "network-relay-in_process"
    );
}

#[tokio::test]
async fn test_relay_delivers_once_per_machine() {
    let network = LocalHub::new();
    let a = machine("machine-a", &network).await;
    let b = machine("machine-b", &network).await;
    a.listener.register_channel("orders").await.unwrap();
    b.listener.register_channel("orders").await.unwrap();

    a.broadcaster.send("orders", "created:42").await.unwrap();
    settle().await;

    let expected = vec![("orders".to_string(), "created:42".to_string())];
    // Local delivery on the sender, relayed delivery on the peer
    assert_eq!(*a.received.lock().unwrap(), expected);
    assert_eq!(*b.received.lock().unwrap(), expected);
}

#[tokio::test]
async fn test_relay_from_same_process_is_never_redelivered() {
    let network = LocalHub::new();
    let a = machine("machine-a", &network).await;
    a.listener.register_channel("orders").await.unwrap();

    let echo = NetworkRelayMessage {
        machine_name: "machine-a".to_string(),
        process_id: a.origin.process_id().to_string(),
        mode: TransportMode::InProcess,
        channel: "orders".to_string(),
        message: "created:42".to_string(),
        type_tag: None,
    };
    network
        .broadcaster()
        .send_payload(
            &relay_channel(TransportMode::InProcess),
            &echo,
            &SerializerStrategy::new(),
        )
        .await
        .unwrap();
    settle().await;

    assert!(a.received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_relay_reaches_other_process_on_same_host() {
    let network = LocalHub::new();
    let first = machine("host-1", &network).await;
    let second = machine("host-1", &network).await;
    second.listener.register_channel("orders").await.unwrap();

    first.broadcaster.send("orders", "created:42").await.unwrap();
    settle().await;

    assert_eq!(
        *second.received.lock().unwrap(),
        vec![("orders".to_string(), "created:42".to_string())]
    );
}

#[tokio::test]
async fn test_relay_ignores_unregistered_channel_and_other_mode() {
    let network = LocalHub::new();
    let b = machine("machine-b", &network).await;
    b.listener.register_channel("orders").await.unwrap();

    let sender = network.broadcaster();
    let strategy = SerializerStrategy::new();
    let mut relay = NetworkRelayMessage {
        machine_name: "machine-a".to_string(),
        process_id: "process-a".to_string(),
        mode: TransportMode::InProcess,
        channel: "invoices".to_string(),
        message: "paid:7".to_string(),
        type_tag: None,
    };
    sender
        .send_payload(&relay_channel(TransportMode::InProcess), &relay, &strategy)
        .await
        .unwrap();

    relay.channel = "orders".to_string();
    relay.mode = TransportMode::RemoteNetwork;
    sender
        .send_payload(&relay_channel(TransportMode::InProcess), &relay, &strategy)
        .await
        .unwrap();
    settle().await;

    assert!(b.received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_relay_preserves_type_tag() {
    let network = LocalHub::new();
    let a = machine("machine-a", &network).await;
    let b = machine("machine-b", &network).await;
    b.listener.register_channel("relay-tags").await.unwrap();

    let tags = Arc::new(StdMutex::new(Vec::new()));
    let sink = tags.clone();
    b.listener
        .add_handler(handler_fn(move |msg| {
            let typed: TypedEnvelope<NetworkRelayMessage> = Arc::clone(&msg.envelope).into();
            sink.lock().unwrap().push(typed.message());
        }))
        .await;

    let inner = NetworkRelayMessage {
        machine_name: "nested".to_string(),
        process_id: "nested-process".to_string(),
        mode: TransportMode::RemoteNetwork,
        channel: "x".to_string(),
        message: "y".to_string(),
        type_tag: None,
    };
    a.broadcaster
        .send_payload("relay-tags", &inner, &SerializerStrategy::new())
        .await
        .unwrap();
    settle().await;

    assert_eq!(*tags.lock().unwrap(), vec![Some(inner)]);
}

#[tokio::test]
async fn test_relay_remote_failure_is_surfaced_after_local_send() {
    let local = Arc::new(MockBroadcaster::new());
    let remote = Arc::new(MockBroadcaster::new());
    remote.set_fail_on_send(true).await;
    let relay = RelayBroadcaster::new(
        local.clone(),
        remote.clone(),
        RelayOrigin::with_process_id("machine-a", "process-a"),
        TransportMode::InProcess,
    );

    assert!(relay.send("orders", "created:42").await.is_err());
    assert_eq!(local.sent_count().await, 1);
}

#[tokio::test]
async fn test_relay_broadcaster_wraps_envelope() {
    let local = Arc::new(MockBroadcaster::new());
    let remote = Arc::new(MockBroadcaster::new());
    let relay = RelayBroadcaster::new(
        local.clone(),
        remote.clone(),
        RelayOrigin::with_process_id("machine-a", "process-a"),
        TransportMode::InProcess,
    );

    relay.send("orders", "created:42").await.unwrap();

    let sent = remote.take_sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].channel(), "network-relay-in_process");
    let typed: TypedEnvelope<NetworkRelayMessage> = sent[0].clone().into();
    let wrapped = typed.message().unwrap();
    assert_eq!(wrapped.machine_name, "machine-a");
    assert_eq!(wrapped.process_id, "process-a");
    assert_eq!(wrapped.channel, "orders");
    assert_eq!(wrapped.message, "created:42");
}

#[tokio::test]
async fn test_relay_dispose_stops_delivery() {
    let network = LocalHub::new();
    let a = machine("machine-a", &network).await;
    let b = machine("machine-b", &network).await;
    b.listener.register_channel("orders").await.unwrap();

    b.listener.dispose().await.unwrap();
    b.listener.dispose().await.unwrap();

    a.broadcaster.send("orders", "created:42").await.unwrap();
    settle().await;

    assert!(b.received.lock().unwrap().is_empty());
}
