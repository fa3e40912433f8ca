//! Point-to-point calls routed hop by hop

mod common;

use bus_core::{Bus, BusConfig, BusError, Hop, NodeOptions, ProcedureTable, Value};
use common::{attach_child, echo_table, eventually, stalled_table, two_level_tree};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
async fn test_ask_between_local_nodes() {
    let bus = Bus::new(BusConfig::named("solo")).unwrap();
    let _server = bus
        .join(NodeOptions::new("server").with_api(echo_table()))
        .await
        .unwrap();
    let client = bus.join(NodeOptions::new("client")).await.unwrap();

    let reply = client.ask("server", "echo", vec![Value::from("hi")]).await.unwrap();
    assert_eq!(reply, Value::from("hi"));
    assert_eq!(bus.pending_calls(), 0);
}

#[tokio::test]
async fn test_ask_down_and_up_the_tree() {
    let (a, b, b_id) = two_level_tree().await;
    let (c, _) = attach_child(&b, "c").await;

    let _deep = c
        .join(NodeOptions::new("deep").with_api(echo_table()))
        .await
        .unwrap();
    let _top = a
        .join(NodeOptions::new("top").with_api(echo_table()))
        .await
        .unwrap();
    assert_eq!(a.next_hop(&"deep".into()), Some(Hop::Child(b_id)));

    let from_top = a.join(NodeOptions::new("from-top")).await.unwrap();
    let reply = from_top.ask("deep", "echo", vec![Value::from(1)]).await.unwrap();
    assert_eq!(reply, Value::from(1));

    // Unknown to c, so it climbs to the root and the reply finds its way back
    let from_deep = c.join(NodeOptions::new("from-deep")).await.unwrap();
    let reply = from_deep.ask("top", "echo", vec![Value::from(2)]).await.unwrap();
    assert_eq!(reply, Value::from(2));
}

#[tokio::test]
async fn test_unknown_destination_is_not_found() {
    let (a, b, _) = two_level_tree().await;

    let at_root = a.join(NodeOptions::new("at-root")).await.unwrap();
    let err = at_root.ask("ghost", "echo", vec![]).await.unwrap_err();
    assert_eq!(err, BusError::NodeNotFound { node_id: "ghost".into() });

    let at_leaf = b.join(NodeOptions::new("at-leaf")).await.unwrap();
    let err = at_leaf.ask("ghost", "echo", vec![]).await.unwrap_err();
    assert!(err.is_not_found(), "got {err:?}");
}

#[tokio::test]
async fn test_remote_procedure_errors_keep_their_shape() {
    let (a, b, _) = two_level_tree().await;

    let _bare = b.join(NodeOptions::new("bare")).await.unwrap();
    let _served = b
        .join(NodeOptions::new("served").with_api(echo_table()))
        .await
        .unwrap();
    let caller = a.join(NodeOptions::new("caller")).await.unwrap();

    let err = caller.ask("bare", "echo", vec![]).await.unwrap_err();
    assert!(matches!(err, BusError::ProcedureNotReady { .. }), "got {err:?}");

    let err = caller.ask("served", "missing", vec![]).await.unwrap_err();
    assert!(
        matches!(err, BusError::ProcedureNotFound { ref path, .. } if path == "missing"),
        "got {err:?}"
    );
}

#[tokio::test]
async fn test_tell_crosses_links() {
    let (a, b, _) = two_level_tree().await;
    let hits = Arc::new(AtomicUsize::new(0));

    let api = {
        let hits = hits.clone();
        ProcedureTable::new().with("note", move |_args: Vec<Value>| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
    };
    let _listener = b.join(NodeOptions::new("listener").with_api(api)).await.unwrap();
    let sender = a.join(NodeOptions::new("sender")).await.unwrap();

    sender.tell("listener", "note", vec![]);
    sender.tell("ghost", "note", vec![]);
    eventually("tell to arrive", || hits.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_set_api_takes_effect() {
    let bus = Bus::new(BusConfig::named("solo")).unwrap();
    let server = bus.join(NodeOptions::new("server")).await.unwrap();
    let client = bus.join(NodeOptions::new("client")).await.unwrap();

    assert!(client.ask("server", "echo", vec![]).await.is_err());
    server.set_api(echo_table()).unwrap();
    assert_eq!(
        client.ask("server", "echo", vec![Value::from(3)]).await.unwrap(),
        Value::from(3)
    );
}

#[tokio::test]
async fn test_panicking_procedure_answers_with_error() {
    let (a, b, _) = two_level_tree().await;
    let api = ProcedureTable::new().with("crash", |_args: Vec<Value>| async move {
        if true {
            panic!("procedure crashed");
        }
        Ok(Value::Null)
    });
    let _server = b.join(NodeOptions::new("server").with_api(api)).await.unwrap();
    let caller = a.join(NodeOptions::new("caller")).await.unwrap();

    let err = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        caller.ask("server", "crash", vec![]),
    )
    .await
    .expect("reply must arrive without waiting for the call timeout")
    .unwrap_err();
    assert!(
        matches!(err, BusError::Application { ref name, ref message, .. }
            if name == "HandlerPanic" && message == "procedure crashed"),
        "got {err:?}"
    );
    assert_eq!(a.pending_calls(), 0);
}

#[tokio::test]
async fn test_abandoned_ask_leaves_no_pending_call() {
    let (a, b, _) = two_level_tree().await;
    let _server = b
        .join(NodeOptions::new("server").with_api(stalled_table()))
        .await
        .unwrap();
    let caller = a.join(NodeOptions::new("caller")).await.unwrap();

    let abandoned = tokio::time::timeout(
        std::time::Duration::from_millis(20),
        caller.ask("server", "process", vec![]),
    )
    .await;

    assert!(abandoned.is_err());
    assert_eq!(a.pending_calls(), 0);
}
