//! Routing propagation, conflicts, purges and link lifecycle

mod common;

use bus_core::message::BusMessage;
use bus_core::transport::{LinkReader, LinkWriter};
use bus_core::{
    Bus, BusConfig, BusError, Hop, MemoryTransport, NodeOptions, RoutingTable, Topic, Transport,
    Value,
};
use common::{attach_child, doubling_table, echo_table, eventually, stalled_table, two_level_tree};
use std::time::Duration;

#[tokio::test]
async fn test_join_and_subscribe_propagate_to_root() {
    let (a, b, b_id) = two_level_tree().await;
    let (c, c_id) = attach_child(&b, "c").await;

    let node = c.join(NodeOptions::new("n1")).await.unwrap();
    node.subscribe("t", doubling_table()).await.unwrap();

    assert_eq!(b.next_hop(&"n1".into()), Some(Hop::Child(c_id)));
    assert_eq!(a.next_hop(&"n1".into()), Some(Hop::Child(b_id)));
    assert_eq!(c.next_hop(&"n1".into()), Some(Hop::Local));
    assert_eq!(a.routing_snapshot().remote_subscribers(&Topic::from("t")), vec![b_id]);
    assert_eq!(
        b.broadcast_downstream(&Topic::from("t"), Hop::Parent),
        vec![Hop::Child(c_id)]
    );
}

#[tokio::test]
async fn test_conflicting_node_id_is_rejected_and_rolled_back() {
    let (a, b, _) = two_level_tree().await;
    let (c, _) = attach_child(&b, "c").await;

    let _owner = a.join(NodeOptions::new("dup")).await.unwrap();
    let before = b.routing_snapshot();

    let err = c.join(NodeOptions::new("dup")).await.unwrap_err();
    assert!(matches!(err, BusError::Rejected { hop: Hop::Parent, .. }), "got {err:?}");
    assert!(err.to_string().contains("dup"));

    assert_eq!(b.routing_snapshot(), before);
    assert!(c.local_nodes().is_empty());
    assert_eq!(a.next_hop(&"dup".into()), Some(Hop::Local));
    // The link survives the rejection
    assert!(c.has_parent());
}

#[tokio::test]
async fn test_disconnect_purges_routes_and_interest() {
    let (a, b, b_id) = two_level_tree().await;
    let node = b.join(NodeOptions::new("n1")).await.unwrap();
    node.subscribe("t", doubling_table()).await.unwrap();
    assert_eq!(a.next_hop(&"n1".into()), Some(Hop::Child(b_id)));

    a.disconnect(Hop::Child(b_id)).unwrap();

    assert_eq!(a.next_hop(&"n1".into()), None);
    assert!(a.broadcast_downstream(&Topic::from("t"), Hop::Local).is_empty());
    assert_eq!(a.routing_snapshot(), RoutingTable::default());
    eventually("child to notice the drop", || !b.has_parent()).await;
}

#[tokio::test]
async fn test_grandchild_purge_is_reported_upward() {
    let (a, b, _) = two_level_tree().await;
    let (c, c_id) = attach_child(&b, "c").await;
    let node = c.join(NodeOptions::new("n1")).await.unwrap();
    node.subscribe("t", doubling_table()).await.unwrap();

    b.disconnect(Hop::Child(c_id)).unwrap();

    eventually("root to forget n1", || a.next_hop(&"n1".into()).is_none()).await;
    eventually("root to lose interest", || {
        a.routing_snapshot().remote_subscribers(&Topic::from("t")).is_empty()
    })
    .await;
}

#[tokio::test]
async fn test_reconnected_parent_is_resynced() {
    let (a, b, b_id) = two_level_tree().await;
    let node = b.join(NodeOptions::new("n1")).await.unwrap();
    node.subscribe("t", doubling_table()).await.unwrap();

    a.disconnect(Hop::Child(b_id)).unwrap();
    eventually("child to drop its parent link", || b.links().is_empty()).await;

    let (up, down) = MemoryTransport::pair();
    b.connect_parent(up).unwrap();
    let new_id = a.bridge(down).await.unwrap();
    assert_ne!(new_id, b_id);

    eventually("resync of n1", || a.next_hop(&"n1".into()) == Some(Hop::Child(new_id))).await;
    eventually("resync of t", || {
        a.routing_snapshot().remote_subscribers(&Topic::from("t")) == vec![new_id]
    })
    .await;
}

#[tokio::test]
async fn test_reannouncement_has_no_extra_effect() {
    let (a, b, _) = two_level_tree().await;
    let node = b.join(NodeOptions::new("n1")).await.unwrap();
    let once = a.routing_snapshot();

    // Replacing a subscription table does not flip interest again
    node.subscribe("t", doubling_table()).await.unwrap();
    node.subscribe("t", doubling_table()).await.unwrap();
    let twice = a.routing_snapshot();

    assert_eq!(once.route(&"n1".into()), twice.route(&"n1".into()));
    assert_eq!(twice.routes().len(), 1);
    assert_eq!(twice.interested_topics(), vec![Topic::from("t")]);
}

#[tokio::test]
async fn test_leave_withdraws_node_and_subscriptions() {
    let (a, b, _) = two_level_tree().await;
    let node = b
        .join(NodeOptions::new("n1").with_api(echo_table()))
        .await
        .unwrap();
    node.subscribe("t", doubling_table()).await.unwrap();
    node.subscribe("u", doubling_table()).await.unwrap();

    node.leave().await.unwrap();

    assert!(b.local_nodes().is_empty());
    assert_eq!(a.next_hop(&"n1".into()), None);
    assert!(a.routing_snapshot().interested_topics().is_empty());

    let caller = a.join(NodeOptions::new("caller")).await.unwrap();
    let err = caller.ask("n1", "echo", vec![]).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_leave_refuses_new_asks_while_draining() {
    let mut config = BusConfig::named("solo");
    config.leave_timeout_ms = 50;
    let bus = Bus::new(config).unwrap();

    let slow = bus.join(NodeOptions::new("slow")).await.unwrap();
    slow.subscribe("t", stalled_table()).await.unwrap();
    slow.set_api(echo_table()).unwrap();
    let caller = bus.join(NodeOptions::new("caller")).await.unwrap();

    let _running = caller.topic("t").all("process", vec![]).unwrap();
    let leaving = tokio::spawn(slow.clone().leave());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = caller.ask("slow", "echo", vec![Value::Null]).await.unwrap_err();
    assert!(matches!(err, BusError::NodeClosing { .. }), "got {err:?}");

    // The stalled call never finishes, so leave gives up after the timeout
    leaving.await.unwrap().unwrap();
    assert!(bus.local_nodes().iter().all(|id| id.as_str() != "slow"));
}

#[tokio::test]
async fn test_unsubscribe_removes_interest() {
    let (a, b, _) = two_level_tree().await;
    let node = b.join(NodeOptions::new("n1")).await.unwrap();
    node.subscribe("t", doubling_table()).await.unwrap();
    node.unsubscribe("t").await.unwrap();

    assert!(a.routing_snapshot().interested_topics().is_empty());
    let caller = a.join(NodeOptions::new("caller")).await.unwrap();
    let results = caller.topic("t").all("process", vec![]).unwrap().collect_all().await;
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_bridge_to_silent_peer_times_out() {
    let mut config = BusConfig::named("a");
    config.handshake_timeout_ms = 50;
    let bus = Bus::new(config).unwrap();

    let (_silent, down) = MemoryTransport::pair();
    let err = bus.bridge(down).await.unwrap_err();

    assert!(matches!(err, BusError::HandshakeTimeout { timeout_ms: 50, .. }), "got {err:?}");
    assert!(bus.links().is_empty());
}

#[tokio::test]
async fn test_join_fails_when_parent_never_acknowledges() {
    let mut config = BusConfig::named("b");
    config.request_timeout_ms = 50;
    let (up, down) = MemoryTransport::pair();
    let b = Bus::with_parent(config, up).unwrap();

    // Act as a parent that completes the handshake and then never acknowledges
    let (mut writer, mut reader) = down.split();
    writer
        .send(BusMessage::Handshake { correlation_id: 1 })
        .await
        .unwrap();
    assert!(matches!(
        reader.recv().await,
        Some(BusMessage::HandshakeResponse { correlation_id: 1 })
    ));
    eventually("parent link to be ready", || b.has_parent()).await;

    let err = b.join(NodeOptions::new("n1")).await.unwrap_err();
    assert!(err.is_timeout(), "got {err:?}");
    assert!(b.local_nodes().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_purge_right_after_announcement_leaves_no_stale_route() {
    for _ in 0..20 {
        let (a, b, _) = two_level_tree().await;
        let (c, c_id) = attach_child(&b, "c").await;

        let joining = tokio::spawn(async move { c.join(NodeOptions::new("n1")).await });
        eventually("middle bus to learn n1", || {
            b.next_hop(&"n1".into()) == Some(Hop::Child(c_id))
        })
        .await;
        b.disconnect(Hop::Child(c_id)).unwrap();
        let _ = joining.await.unwrap();

        eventually("root to forget n1", || a.next_hop(&"n1".into()).is_none()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(a.next_hop(&"n1".into()), None);
        assert_eq!(a.routing_snapshot(), RoutingTable::default());
    }
}
