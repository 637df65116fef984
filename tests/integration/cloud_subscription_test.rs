//! Cloud subscription engine integration tests over the public API.

use std::sync::Arc;

use crossbus::bus::cloud::{FacadeOp, MemoryQueueFacade};
use crossbus::bus::FaultKind;
use crossbus::{Broadcaster, BusError, Listener, TransportMode};

use crate::common::{cloud_client, eventually, settle, Recorder};

#[tokio::test]
async fn test_remote_send_reaches_every_listener() {
    let network = Arc::new(MemoryQueueFacade::new());
    let a = cloud_client("machine-a", &network);
    let b = cloud_client("machine-b", &network);

    let a_recorder = Recorder::new();
    let a_listener = a.listener(TransportMode::RemoteNetwork).await.unwrap();
    a_listener.add_handler(a_recorder.clone()).await;
    a_listener.register_channel("alerts").await.unwrap();

    let b_recorder = Recorder::new();
    let b_listener = b.listener(TransportMode::RemoteNetwork).await.unwrap();
    b_listener.add_handler(b_recorder.clone()).await;
    b_listener.register_channel("alerts").await.unwrap();

    let broadcaster = a.broadcaster(TransportMode::RemoteNetwork, false).unwrap();
    broadcaster.send("alerts", "disk-full").await.unwrap();

    assert!(eventually(|| a_recorder.count() == 1 && b_recorder.count() == 1).await);

    a_listener.dispose().await.unwrap();
    b_listener.dispose().await.unwrap();
}

#[tokio::test]
async fn test_dispose_tears_down_short_lived_queues() {
    let network = Arc::new(MemoryQueueFacade::new());
    let client = cloud_client("machine-a", &network);

    let listener = client.listener(TransportMode::RemoteNetwork).await.unwrap();
    listener.register_channel("alerts").await.unwrap();
    listener.register_channel("orders").await.unwrap();
    assert_eq!(network.subscription_count(), 2);
    assert_eq!(network.queue_names().len(), 2);

    listener.dispose().await.unwrap();
    assert_eq!(network.subscription_count(), 0);
    assert!(network.queue_names().is_empty());

    // Idempotent
    listener.dispose().await.unwrap();
    assert_eq!(network.calls(FacadeOp::Unsubscribe), 2);
}

#[tokio::test]
async fn test_duplicate_delivery_is_suppressed() {
    let network = Arc::new(MemoryQueueFacade::new());
    let client = cloud_client("machine-a", &network);

    let recorder = Recorder::new();
    let listener = client.listener(TransportMode::RemoteNetwork).await.unwrap();
    listener.add_handler(recorder.clone()).await;
    listener.register_channel("alerts").await.unwrap();

    let queue_url = MemoryQueueFacade::queue_url_for(&network.queue_names()[0]);
    let body = crossbus::Envelope::new("alerts", "disk-full")
        .unwrap()
        .to_wire()
        .unwrap();
    network.push_message(&queue_url, "msg-1", &body).unwrap();
    assert!(eventually(|| recorder.count() == 1).await);

    // Provider redelivers the same message
    network.push_message(&queue_url, "msg-1", &body).unwrap();
    assert!(eventually(|| network.calls(FacadeOp::DeleteMessage) == 2).await);
    settle().await;
    assert_eq!(recorder.count(), 1);

    listener.dispose().await.unwrap();
}

#[tokio::test]
async fn test_provider_faults_reach_handlers() {
    let network = Arc::new(MemoryQueueFacade::new());
    let client = cloud_client("machine-a", &network);

    let recorder = Recorder::new();
    let listener = client.listener(TransportMode::RemoteNetwork).await.unwrap();
    listener.add_handler(recorder.clone()).await;

    network.fail_next(
        FacadeOp::ReadQueue,
        BusError::TransientProvider("throttled".to_string()),
    );
    listener.register_channel("alerts").await.unwrap();
    assert!(eventually(|| recorder.has_fault(FaultKind::Transient)).await);

    // Polling continues past the transient error
    let broadcaster = client
        .broadcaster(TransportMode::RemoteNetwork, false)
        .unwrap();
    broadcaster.send("alerts", "disk-full").await.unwrap();
    assert!(eventually(|| recorder.count() == 1).await);

    listener.dispose().await.unwrap();
}

#[tokio::test]
async fn test_failed_registration_can_be_retried() {
    let network = Arc::new(MemoryQueueFacade::new());
    let client = cloud_client("machine-a", &network);
    let listener = client.listener(TransportMode::RemoteNetwork).await.unwrap();

    network.fail_next(
        FacadeOp::Subscribe,
        BusError::TransientProvider("unavailable".to_string()),
    );
    assert!(listener.register_channel("alerts").await.is_err());
    assert_eq!(network.subscription_count(), 0);

    listener.register_channel("alerts").await.unwrap();
    assert_eq!(network.subscription_count(), 1);
    listener.dispose().await.unwrap();
}
