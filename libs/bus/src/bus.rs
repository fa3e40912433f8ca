//! # Bus Instance
//!
//! One hub of the tree: its links, routing state, hosted nodes and the
//! sessions in flight. [`Bus`] is the public handle; [`BusInner`] is shared
//! with the background tasks.
//!
//! ## Event Loop
//! A single task per bus consumes [`LinkEvent`]s in arrival order, so the
//! messages of one link are processed in the order they were received:
//! - `Message`: handed to the protocol coordinator, unless the link that
//!   produced it has since been replaced
//! - `ConnectionReady`: a ready parent triggers a full routing resync
//! - `ConnectionDropped`: fails pending requests, unblocks sessions and
//!   purges the routes learned through the link
//!
//! The loop holds only a weak reference; it ends when the bus is shut down
//! or the last handle goes away.
//!
//! A second task drains routing deltas bound for the parent one batch at a
//! time, so the parent applies them in the order this bus produced them.

use crate::bridge::{BridgeManager, LinkEvent, LinkInfo};
use crate::broadcast::BroadcastManager;
use crate::config::BusConfig;
use crate::directory::NodeDirectory;
use crate::dispatcher::Dispatcher;
use crate::error::{BusError, Result};
use crate::node::{NodeHandle, NodeOptions};
use crate::p2p::P2pRouter;
use crate::protocol::ProtocolCoordinator;
use crate::routing::{upstream_loop, RoutingFeature, RoutingTable};
use crate::transport::Transport;
use crate::types::{BusId, Hop, MessageSource, NodeId, Topic};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Shared state of one bus instance
pub struct BusInner {
    pub(crate) config: BusConfig,
    pub(crate) bridge: BridgeManager,
    pub(crate) protocol: ProtocolCoordinator,
    pub(crate) routing: RoutingFeature,
    pub(crate) directory: NodeDirectory,
    pub(crate) p2p: P2pRouter,
    pub(crate) broadcast: BroadcastManager,
    pub(crate) dispatcher: Dispatcher,
    shutdown: watch::Sender<bool>,
}

impl BusInner {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Identity used as the sender of acknowledgements this bus aggregates
    pub fn self_id(&self) -> NodeId {
        NodeId::new(format!("{}@bus", self.config.name))
    }

    pub fn has_parent(&self) -> bool {
        self.bridge.is_ready(Hop::Parent)
    }

    pub fn next_hop(&self, destination: &NodeId) -> Option<Hop> {
        let is_local = self.directory.contains(destination);
        self.routing
            .next_hop(destination, is_local, self.has_parent())
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn handle_event(self: &Arc<Self>, event: LinkEvent) {
        match event {
            LinkEvent::Message {
                hop,
                link_id,
                message,
            } => {
                if !self.bridge.is_current(hop, link_id) {
                    debug!(bus = %self.name(), %hop, link_id, "Dropping message from a replaced link");
                    return;
                }
                self.protocol.handle_message(self, hop, link_id, message);
            }
            LinkEvent::ConnectionReady { hop, .. } => {
                if hop == Hop::Parent {
                    self.routing.on_parent_ready(self);
                }
            }
            LinkEvent::ConnectionDropped {
                hop,
                link_id,
                error,
            } => {
                if self.bridge.remove(hop, Some(link_id)).is_none() {
                    return;
                }
                if let Some(e) = &error {
                    warn!(bus = %self.name(), %hop, error = %e, "Link failed");
                }
                self.on_link_dropped(hop);
            }
        }
    }

    fn on_link_dropped(self: &Arc<Self>, hop: Hop) {
        let failed = self.protocol.fail_pending_for(hop);
        if failed > 0 {
            debug!(bus = %self.name(), %hop, failed, "Failed requests pending on dropped link");
        }
        self.broadcast.on_link_dropped(self, hop);
        self.routing.on_connection_dropped(self, hop);
    }
}

/// Handle to a bus instance
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Create a root bus. Must be called inside a tokio runtime.
    pub fn new(config: BusConfig) -> Result<Self> {
        Self::with_dispatcher(config, Dispatcher::with_defaults())
    }

    /// Create a root bus with a custom value dispatcher
    pub fn with_dispatcher(config: BusConfig, dispatcher: Dispatcher) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| BusError::configuration("bus requires a tokio runtime", None))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(BusInner {
            bridge: BridgeManager::new(config.name.clone(), events_tx),
            protocol: ProtocolCoordinator::new(),
            routing: RoutingFeature::new(upstream_tx),
            directory: NodeDirectory::new(),
            p2p: P2pRouter::new(),
            broadcast: BroadcastManager::new(),
            dispatcher,
            shutdown,
            config,
        });

        runtime.spawn(event_loop(Arc::downgrade(&inner), events_rx, shutdown_rx));
        runtime.spawn(upstream_loop(Arc::downgrade(&inner), upstream_rx));
        info!(bus = %inner.name(), "Bus started");
        Ok(Self { inner })
    }

    /// Create a bus whose parent is reached over `transport`.
    ///
    /// The link becomes ready once the parent's handshake is answered.
    pub fn with_parent<T: Transport>(config: BusConfig, transport: T) -> Result<Self> {
        let bus = Self::new(config)?;
        bus.connect_parent(transport)?;
        Ok(bus)
    }

    /// Attach a parent link, e.g. after the previous one dropped
    pub fn connect_parent<T: Transport>(&self, transport: T) -> Result<()> {
        self.ensure_running()?;
        self.inner.bridge.attach(Hop::Parent, transport)?;
        debug!(bus = %self.name(), "Parent link attached; awaiting handshake");
        Ok(())
    }

    /// Bridge a child bus over `transport` and return its id
    pub async fn bridge<T: Transport>(&self, transport: T) -> Result<BusId> {
        self.ensure_running()?;
        self.inner
            .bridge
            .bridge_child(
                transport,
                &self.inner.protocol,
                self.inner.config.handshake_timeout(),
            )
            .await
    }

    /// Close one link and purge everything learned through it
    pub fn disconnect(&self, hop: Hop) -> Result<()> {
        if self.inner.bridge.remove(hop, None).is_none() {
            return Err(BusError::LinkNotFound(hop));
        }
        self.inner.on_link_dropped(hop);
        Ok(())
    }

    /// Terminate sessions and pending calls with `Shutdown` and close every link
    pub fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        info!(bus = %self.name(), "Bus shutting down");
        self.inner.broadcast.shutdown();
        self.inner.p2p.fail_all(BusError::Shutdown);
        self.inner.protocol.fail_all(BusError::Shutdown);
        self.inner.bridge.close_all();
    }

    /// Host a node on this bus and announce it to the tree
    pub async fn join(&self, options: NodeOptions) -> Result<NodeHandle> {
        self.ensure_running()?;
        let NodeOptions { id, api } = options;

        if let Some(existing) = self.inner.routing.route(&id) {
            return Err(BusError::NodeIdConflict {
                node_id: id,
                existing,
            });
        }
        self.inner.directory.register(id.clone(), api)?;

        if let Err(e) = self
            .inner
            .routing
            .announce_local_node(&self.inner, &id, true)
            .await
        {
            warn!(bus = %self.name(), node_id = %id, error = %e, "Join not acknowledged upstream");
            self.inner.directory.remove(&id);
            return Err(e);
        }

        info!(bus = %self.name(), node_id = %id, "Node joined");
        Ok(NodeHandle::new(id, self.inner.clone()))
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn has_parent(&self) -> bool {
        self.inner.has_parent()
    }

    pub fn next_hop(&self, destination: &NodeId) -> Option<Hop> {
        self.inner.next_hop(destination)
    }

    pub fn broadcast_downstream(&self, topic: &Topic, source: MessageSource) -> Vec<Hop> {
        self.inner
            .routing
            .downstream(topic, source, self.inner.has_parent())
    }

    pub fn routing_snapshot(&self) -> RoutingTable {
        self.inner.routing.snapshot()
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.broadcast.active_sessions()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.p2p.pending_calls()
    }

    pub fn links(&self) -> Vec<LinkInfo> {
        self.inner.bridge.links()
    }

    pub fn local_nodes(&self) -> Vec<NodeId> {
        self.inner.directory.node_ids()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.is_shut_down() {
            return Err(BusError::Shutdown);
        }
        Ok(())
    }
}

async fn event_loop(
    bus: Weak<BusInner>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(bus) = bus.upgrade() else { break };
                bus.handle_event(event);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Bus event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = BusConfig {
            request_timeout_ms: 0,
            ..BusConfig::default()
        };
        assert!(matches!(Bus::new(config), Err(BusError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_bridge_makes_both_sides_ready() {
        let parent = Bus::new(BusConfig::named("a")).unwrap();
        let (up, down) = MemoryTransport::pair();
        let child = Bus::with_parent(BusConfig::named("b"), up).unwrap();

        let bus_id = parent.bridge(down).await.unwrap();
        assert_eq!(bus_id, BusId(1));
        assert!(child.has_parent());
        assert_eq!(parent.links().len(), 1);
    }

    #[tokio::test]
    async fn test_join_conflict_is_local() {
        let bus = Bus::new(BusConfig::named("a")).unwrap();
        let _n1 = bus.join(NodeOptions::new("n1")).await.unwrap();
        let err = bus.join(NodeOptions::new("n1")).await.unwrap_err();
        assert!(matches!(err, BusError::NodeIdConflict { existing: Hop::Local, .. }));
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let bus = Bus::new(BusConfig::named("a")).unwrap();
        bus.shutdown();
        bus.shutdown();
        assert!(matches!(bus.join(NodeOptions::new("n1")).await, Err(BusError::Shutdown)));

        let (_, down) = MemoryTransport::pair();
        assert!(matches!(bus.bridge(down).await, Err(BusError::Shutdown)));
    }

    #[tokio::test]
    async fn test_disconnect_unknown_hop() {
        let bus = Bus::new(BusConfig::named("a")).unwrap();
        assert_eq!(bus.disconnect(Hop::Parent), Err(BusError::LinkNotFound(Hop::Parent)));
    }
}
