//! Local Node Directory
//!
//! Nodes hosted on this bus instance, their procedure tables and their
//! closing state. Inbound P2P and broadcast calls execute here.
//!
//! Asks against an unknown node, missing table or missing path fail with a
//! structured error; tells in the same situation are ignored. A closing node
//! refuses new asks while the calls it already accepted run to completion.

use crate::error::{BusError, Result};
use crate::types::{CallKind, Hop, NodeId, Topic};
use crate::value::Value;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Future returned by a procedure
pub type ProcedureFuture = BoxFuture<'static, Result<Value>>;

type Procedure = Arc<dyn Fn(Vec<Value>) -> ProcedureFuture + Send + Sync>;

/// Path -> handler map exposed by a node
#[derive(Clone, Default)]
pub struct ProcedureTable {
    procedures: HashMap<String, Procedure>,
}

impl ProcedureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration
    pub fn with<F, Fut>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.insert(path, handler);
        self
    }

    pub fn insert<F, Fut>(&mut self, path: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let procedure: Procedure = Arc::new(move |args| handler(args).boxed());
        self.procedures.insert(path.into(), procedure);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.procedures.contains_key(path)
    }

    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.procedures.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }

    fn get(&self, path: &str) -> Option<Procedure> {
        self.procedures.get(path).cloned()
    }
}

impl fmt::Debug for ProcedureTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureTable")
            .field("paths", &self.paths())
            .finish()
    }
}

struct LocalNode {
    api: Option<ProcedureTable>,
    subscriptions: HashMap<Topic, ProcedureTable>,
    closing: bool,
    in_flight: Arc<watch::Sender<usize>>,
}

/// Decrements the node's in-flight count when the call finishes
struct InFlightGuard(Arc<watch::Sender<usize>>);

impl InFlightGuard {
    fn enter(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Nodes hosted on this bus instance
#[derive(Default)]
pub struct NodeDirectory {
    nodes: DashMap<NodeId, LocalNode>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Fails if the id is already hosted here.
    pub fn register(&self, node_id: NodeId, api: Option<ProcedureTable>) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        match self.nodes.entry(node_id) {
            Entry::Occupied(entry) => Err(BusError::NodeIdConflict {
                node_id: entry.key().clone(),
                existing: Hop::Local,
            }),
            Entry::Vacant(entry) => {
                info!(node_id = %entry.key(), "Registering local node");
                let (in_flight, _) = watch::channel(0);
                entry.insert(LocalNode {
                    api,
                    subscriptions: HashMap::new(),
                    closing: false,
                    in_flight: Arc::new(in_flight),
                });
                Ok(())
            }
        }
    }

    /// Remove a node, returning the topics it was subscribed to
    pub fn remove(&self, node_id: &NodeId) -> Option<Vec<Topic>> {
        let (_, node) = self.nodes.remove(node_id)?;
        info!(%node_id, "Unregistered local node");
        let mut topics: Vec<Topic> = node.subscriptions.into_keys().collect();
        topics.sort();
        Some(topics)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn set_api(&self, node_id: &NodeId, api: ProcedureTable) -> Result<()> {
        let mut node = self.node_mut(node_id)?;
        debug!(%node_id, paths = api.len(), "Setting node API");
        node.api = Some(api);
        Ok(())
    }

    /// Attach a topic table. Returns the table it replaced, if any.
    pub fn subscribe(
        &self,
        node_id: &NodeId,
        topic: Topic,
        table: ProcedureTable,
    ) -> Result<Option<ProcedureTable>> {
        let mut node = self.node_mut(node_id)?;
        Ok(node.subscriptions.insert(topic, table))
    }

    /// Detach a topic table, returning it
    pub fn unsubscribe(&self, node_id: &NodeId, topic: &Topic) -> Result<Option<ProcedureTable>> {
        let mut node = self.node_mut(node_id)?;
        Ok(node.subscriptions.remove(topic))
    }

    pub fn is_subscribed(&self, node_id: &NodeId, topic: &Topic) -> bool {
        self.nodes
            .get(node_id)
            .is_some_and(|node| node.subscriptions.contains_key(topic))
    }

    /// Refuse new asks from now on
    pub fn mark_closing(&self, node_id: &NodeId) -> Result<()> {
        let mut node = self.node_mut(node_id)?;
        node.closing = true;
        Ok(())
    }

    pub fn is_closing(&self, node_id: &NodeId) -> bool {
        self.nodes.get(node_id).is_some_and(|node| node.closing)
    }

    pub fn in_flight(&self, node_id: &NodeId) -> usize {
        self.nodes
            .get(node_id)
            .map(|node| *node.in_flight.borrow())
            .unwrap_or(0)
    }

    /// Wait until the node has no running calls. `false` on timeout.
    pub async fn wait_idle(&self, node_id: &NodeId, timeout: Duration) -> bool {
        let Some(counter) = self.nodes.get(node_id).map(|node| node.in_flight.clone()) else {
            return true;
        };

        let mut idle = counter.subscribe();
        let drained = tokio::time::timeout(timeout, idle.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|waited| waited.is_ok());
        drained
    }

    /// Execute a P2P call against a node's API
    pub async fn execute_p2p(
        &self,
        node_id: &NodeId,
        kind: CallKind,
        path: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        match self.resolve(node_id, None, kind, path)? {
            Some((procedure, _guard)) => invoke(node_id, path, procedure, args).await,
            None => Ok(Value::Null),
        }
    }

    /// Execute a broadcast call against a node's subscription table
    pub async fn execute_broadcast(
        &self,
        node_id: &NodeId,
        topic: &Topic,
        kind: CallKind,
        path: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        match self.resolve(node_id, Some(topic), kind, path)? {
            Some((procedure, _guard)) => invoke(node_id, path, procedure, args).await,
            None => Ok(Value::Null),
        }
    }

    /// Find the handler for a call. `Ok(None)` means a tell that is ignored.
    fn resolve(
        &self,
        node_id: &NodeId,
        topic: Option<&Topic>,
        kind: CallKind,
        path: &str,
    ) -> Result<Option<(Procedure, InFlightGuard)>> {
        let lookup = self.lookup(node_id, topic, kind, path);
        match (lookup, kind) {
            (Ok(found), _) => Ok(Some(found)),
            (Err(e), CallKind::Tell) => {
                trace!(%node_id, path, error = %e, "Ignoring undeliverable tell");
                Ok(None)
            }
            (Err(e), CallKind::Ask) => Err(e),
        }
    }

    fn lookup(
        &self,
        node_id: &NodeId,
        topic: Option<&Topic>,
        kind: CallKind,
        path: &str,
    ) -> Result<(Procedure, InFlightGuard)> {
        let node = self.nodes.get(node_id).ok_or_else(|| BusError::NodeNotFound {
            node_id: node_id.clone(),
        })?;

        if node.closing && kind == CallKind::Ask {
            return Err(BusError::NodeClosing {
                node_id: node_id.clone(),
            });
        }

        let table = match topic {
            None => node.api.as_ref(),
            Some(topic) => node.subscriptions.get(topic),
        }
        .ok_or_else(|| BusError::ProcedureNotReady {
            node_id: node_id.clone(),
        })?;

        let procedure = table.get(path).ok_or_else(|| BusError::ProcedureNotFound {
            node_id: node_id.clone(),
            path: path.to_string(),
        })?;

        Ok((procedure, InFlightGuard::enter(&node.in_flight)))
    }

    fn node_mut(
        &self,
        node_id: &NodeId,
    ) -> Result<dashmap::mapref::one::RefMut<'_, NodeId, LocalNode>> {
        self.nodes.get_mut(node_id).ok_or_else(|| BusError::NodeNotFound {
            node_id: node_id.clone(),
        })
    }
}

/// Run a handler. A panic becomes a `HandlerPanic` application error.
async fn invoke(node_id: &NodeId, path: &str, procedure: Procedure, args: Vec<Value>) -> Result<Value> {
    match AssertUnwindSafe(async move { procedure(args).await })
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(%node_id, path, %message, "Procedure panicked");
            Err(BusError::application("HandlerPanic", message))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "procedure panicked".to_string()
    }
}
