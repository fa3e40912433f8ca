//! Shared fixtures for multi-bus integration tests

#![allow(dead_code)]

use bus_core::{Bus, BusConfig, BusId, MemoryTransport, ProcedureTable, Value};
use std::time::Duration;

/// Root bus `a` with one bridged child `b`
pub async fn two_level_tree() -> (Bus, Bus, BusId) {
    let a = Bus::new(BusConfig::named("a")).unwrap();
    let (b, b_id) = attach_child(&a, "b").await;
    (a, b, b_id)
}

/// Create a bus named `name` and bridge it under `parent`
pub async fn attach_child(parent: &Bus, name: &str) -> (Bus, BusId) {
    let (up, down) = MemoryTransport::pair();
    let child = Bus::with_parent(BusConfig::named(name), up).unwrap();
    let bus_id = parent.bridge(down).await.unwrap();
    (child, bus_id)
}

/// Returns its first argument doubled
pub fn doubling_table() -> ProcedureTable {
    ProcedureTable::new().with("process", |args: Vec<Value>| async move {
        let n = args.first().and_then(Value::as_i64).unwrap_or(0);
        Ok(Value::from(n * 2))
    })
}

/// Returns its first argument unchanged
pub fn echo_table() -> ProcedureTable {
    ProcedureTable::new().with("echo", |args: Vec<Value>| async move {
        Ok(args.into_iter().next().unwrap_or(Value::Null))
    })
}

/// Never answers
pub fn stalled_table() -> ProcedureTable {
    ProcedureTable::new().with("process", |_args: Vec<Value>| async move {
        futures::future::pending::<()>().await;
        Ok(Value::Null)
    })
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
