//! Link lifecycle, the post-reconnect synchronization handshake, and
//! persisted-state recovery across simulated crashes.

mod support;

use std::sync::Arc;
use std::time::Duration;

use rq_common::{EndpointAddress, QueueItemStatus};
use rq_engine::InProcessNetwork;
use rq_queue::SqliteQueueStorage;

use support::{
    connect_and_sync, payload, start_node, start_node_with, test_config, wait_for_event, Event,
};

#[tokio::test]
async fn link_loss_clears_establishment_and_reconnect_restores_it() {
    let network = InProcessNetwork::new();
    let (a, mut a_events) = start_node(&network, "node-a").await;
    let (b, mut b_events) = start_node(&network, "node-b").await;
    connect_and_sync(&network, &a, &b).await;

    network.disconnect(a.local_address(), b.local_address()).await;
    wait_for_event(&mut a_events, |e| matches!(e, Event::LinkLost(_))).await;
    wait_for_event(&mut b_events, |e| matches!(e, Event::LinkLost(_))).await;
    assert!(!a.collaboration().is_link_established(b.local_address()));
    assert!(!b.collaboration().is_link_established(a.local_address()));

    connect_and_sync(&network, &a, &b).await;
    wait_for_event(&mut a_events, |e| matches!(e, Event::LinkEstablished(_))).await;
    wait_for_event(&mut b_events, |e| matches!(e, Event::LinkEstablished(_))).await;
}

#[tokio::test]
async fn resync_with_amnesiac_peer_fails_pending_items() {
    let network = InProcessNetwork::new();
    let (sender, mut sender_events) = start_node(&network, "sender").await;
    let (receiver, mut receiver_events) = start_node(&network, "receiver").await;
    connect_and_sync(&network, &sender, &receiver).await;

    let item_id = sender
        .dispatch_queue_item(payload("lost-on-crash"), receiver.local_address().clone())
        .await
        .expect("dispatch");
    wait_for_event(&mut receiver_events, |e| matches!(e, Event::NewInItem(_))).await;

    // The receiver crashes with volatile storage and comes back empty.
    network.crash(receiver.local_address()).await;
    wait_for_event(&mut sender_events, |e| matches!(e, Event::LinkLost(_))).await;
    receiver.shutdown().await;

    let (receiver, _receiver_events) = start_node(&network, "receiver").await;
    assert!(receiver.in_queue().is_empty().await);
    connect_and_sync(&network, &sender, &receiver).await;

    // The handshake reveals the receiver no longer holds the item.
    wait_for_event(&mut sender_events, |e| {
        matches!(e, Event::UnableToDispatch(id) if id == &item_id)
    })
    .await;
    let item = sender.get_out_item(&item_id).await.expect("item retained");
    assert_eq!(item.status, QueueItemStatus::DispatchFailed);
}

#[tokio::test]
async fn persisted_in_queue_survives_crash_and_completes_after_resync() {
    let network = InProcessNetwork::new();
    let (sender, mut sender_events) = start_node(&network, "sender").await;

    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("receiver.db");
    let db_path = db_path.to_str().expect("utf-8 path").to_string();

    let in_storage = SqliteQueueStorage::connect(&db_path, "receiver-in")
        .await
        .expect("in storage");
    let out_storage = SqliteQueueStorage::connect(&db_path, "receiver-out")
        .await
        .expect("out storage");
    let (receiver, mut receiver_events) = start_node_with(
        &network,
        test_config("receiver"),
        Arc::new(in_storage),
        Arc::new(out_storage),
    )
    .await;

    connect_and_sync(&network, &sender, &receiver).await;
    let item_id = sender
        .dispatch_queue_item(payload("durable"), receiver.local_address().clone())
        .await
        .expect("dispatch");
    wait_for_event(&mut receiver_events, |e| matches!(e, Event::NewInItem(_))).await;

    network.crash(receiver.local_address()).await;
    wait_for_event(&mut sender_events, |e| matches!(e, Event::LinkLost(_))).await;
    receiver.shutdown().await;

    // Restart against the same database.
    let in_storage = SqliteQueueStorage::connect(&db_path, "receiver-in")
        .await
        .expect("in storage");
    let out_storage = SqliteQueueStorage::connect(&db_path, "receiver-out")
        .await
        .expect("out storage");
    let (receiver, _receiver_events) = start_node_with(
        &network,
        test_config("receiver"),
        Arc::new(in_storage),
        Arc::new(out_storage),
    )
    .await;

    let restored = receiver.get_in_item(&item_id).await.expect("item restored");
    assert_eq!(restored.status, QueueItemStatus::Queued);
    assert_eq!(
        restored.sender_receiver_address.as_ref(),
        Some(sender.local_address())
    );

    connect_and_sync(&network, &sender, &receiver).await;

    // The sender still considers the item pending at the receiver.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let item = sender.get_out_item(&item_id).await.expect("item pending");
        if item.status == QueueItemStatus::Dispatched {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "item never reconciled to dispatched"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let checked_out = receiver.check_out_first().await.expect("checkout");
    assert_eq!(checked_out.id, item_id);
    receiver
        .in_item_done_success(&checked_out, None)
        .await
        .expect("complete");

    wait_for_event(&mut sender_events, |e| {
        matches!(e, Event::OutDoneSuccess(id, _) if id == &item_id)
    })
    .await;
}

#[tokio::test]
async fn completion_during_outage_is_replayed_on_resync() {
    let network = InProcessNetwork::new();
    let (sender, mut sender_events) = start_node(&network, "sender").await;
    let (receiver, mut receiver_events) = start_node(&network, "receiver").await;
    connect_and_sync(&network, &sender, &receiver).await;

    let item_id = sender
        .dispatch_queue_item(payload("offline-work"), receiver.local_address().clone())
        .await
        .expect("dispatch");
    let Event::NewInItem(received) =
        wait_for_event(&mut receiver_events, |e| matches!(e, Event::NewInItem(_))).await
    else {
        unreachable!()
    };

    network.disconnect(sender.local_address(), receiver.local_address()).await;
    wait_for_event(&mut sender_events, |e| matches!(e, Event::LinkLost(_))).await;
    wait_for_event(&mut receiver_events, |e| matches!(e, Event::LinkLost(_))).await;

    // Completed while the link is down; the response is parked.
    receiver
        .in_item_done_success(&received, Some(serde_json::json!({ "done": true })))
        .await
        .expect("complete offline");

    connect_and_sync(&network, &sender, &receiver).await;

    // The handshake replays the parked completion response.
    let event = wait_for_event(&mut sender_events, |e| {
        matches!(e, Event::OutDoneSuccess(id, _) if id == &item_id)
    })
    .await;
    let Event::OutDoneSuccess(_, response_data) = event else {
        unreachable!()
    };
    assert_eq!(response_data, Some(serde_json::json!({ "done": true })));
    assert!(sender.out_queue().is_empty().await);
}

#[tokio::test]
async fn startup_synchronization_wait() {
    let network = InProcessNetwork::new();
    let (node, mut events) = start_node(&network, "lonely").await;

    // Nothing pending, nobody connected.
    assert!(
        node.wait_for_startup_synchronization(Duration::from_millis(200))
            .await
    );

    // A failed dispatch leaves a pending out-item for an unreachable peer.
    let item_id = node
        .dispatch_queue_item(payload("stuck"), EndpointAddress::new("ghost"))
        .await
        .expect("dispatch");
    wait_for_event(&mut events, |e| {
        matches!(e, Event::UnableToDispatch(id) if id == &item_id)
    })
    .await;

    assert!(
        !node
            .wait_for_startup_synchronization(Duration::from_millis(300))
            .await
    );
}
