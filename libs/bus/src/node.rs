//! Node Handles
//!
//! A node is an addressable endpoint hosted on one bus. Its handle issues
//! P2P calls, manages topic subscriptions and publishes to topics.

use crate::bus::BusInner;
use crate::directory::ProcedureTable;
use crate::error::{BusError, Result};
use crate::message::BroadcastPayload;
use crate::session::AskAllStream;
use crate::types::{CallId, NodeId, Topic};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options for [`Bus::join`](crate::bus::Bus::join)
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub id: NodeId,
    pub api: Option<ProcedureTable>,
}

impl NodeOptions {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            api: None,
        }
    }

    pub fn with_api(mut self, api: ProcedureTable) -> Self {
        self.api = Some(api);
        self
    }
}

/// Handle to a node hosted on a bus
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    bus: Arc<BusInner>,
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("id", &self.id)
            .field("bus", &self.bus.name())
            .finish()
    }
}

impl NodeHandle {
    pub(crate) fn new(id: NodeId, bus: Arc<BusInner>) -> Self {
        Self { id, bus }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Replace the node's P2P procedure table
    pub fn set_api(&self, api: ProcedureTable) -> Result<()> {
        self.bus.directory.set_api(&self.id, api)
    }

    /// Subscribe to a topic with the table that serves its calls.
    ///
    /// Resolves once the parent acknowledged any change of interest.
    pub async fn subscribe(&self, topic: impl Into<Topic>, table: ProcedureTable) -> Result<()> {
        let topic = topic.into();
        let replaced = self.bus.directory.subscribe(&self.id, topic.clone(), table)?;

        let updated = self
            .bus
            .routing
            .update_local_subscription(&self.bus, &self.id, &topic, true)
            .await;
        if let Err(e) = updated {
            if let Some(previous) = replaced {
                self.bus.directory.subscribe(&self.id, topic, previous)?;
            } else {
                self.bus.directory.unsubscribe(&self.id, &topic)?;
            }
            return Err(e);
        }

        debug!(bus = %self.bus.name(), node_id = %self.id, %topic, "Subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: impl Into<Topic>) -> Result<()> {
        let topic = topic.into();
        let removed = self.bus.directory.unsubscribe(&self.id, &topic)?;

        let updated = self
            .bus
            .routing
            .update_local_subscription(&self.bus, &self.id, &topic, false)
            .await;
        if let Err(e) = updated {
            if let Some(table) = removed {
                self.bus.directory.subscribe(&self.id, topic, table)?;
            }
            return Err(e);
        }

        debug!(bus = %self.bus.name(), node_id = %self.id, %topic, "Unsubscribed");
        Ok(())
    }

    /// Call a procedure on another node and wait for its result
    pub async fn ask(
        &self,
        destination: impl Into<NodeId>,
        path: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        if self.bus.is_shut_down() {
            return Err(BusError::Shutdown);
        }
        let destination = destination.into();
        self.bus
            .p2p
            .call(&self.bus, &self.id, &destination, path, args)
            .await
    }

    /// Notify another node. Delivery failures are not reported.
    pub fn tell(&self, destination: impl Into<NodeId>, path: &str, args: Vec<Value>) {
        self.bus
            .p2p
            .tell(&self.bus, &self.id, destination.into(), path, args);
    }

    /// Publisher for one topic
    pub fn topic(&self, topic: impl Into<Topic>) -> TopicPublisher<'_> {
        TopicPublisher {
            node: self,
            topic: topic.into(),
            loopback: None,
        }
    }

    /// Leave the bus gracefully.
    ///
    /// New asks are refused at once; calls already running get up to the
    /// configured leave timeout to finish before the node is announced gone.
    pub async fn leave(self) -> Result<()> {
        let bus = &self.bus;
        bus.directory.mark_closing(&self.id)?;

        let timeout = bus.config.leave_timeout();
        if !bus.directory.wait_idle(&self.id, timeout).await {
            warn!(
                bus = %bus.name(),
                node_id = %self.id,
                in_flight = bus.directory.in_flight(&self.id),
                "Leaving with calls still running"
            );
        }

        let topics = bus.directory.remove(&self.id).unwrap_or_default();
        let mut first_error: Option<BusError> = None;
        for topic in topics {
            if let Err(e) = bus
                .routing
                .update_local_subscription(bus, &self.id, &topic, false)
                .await
            {
                warn!(bus = %bus.name(), node_id = %self.id, %topic, error = %e, "Unsubscribe on leave failed");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = bus.routing.announce_local_node(bus, &self.id, false).await {
            warn!(bus = %bus.name(), node_id = %self.id, error = %e, "Leave not acknowledged upstream");
            first_error.get_or_insert(e);
        }

        info!(bus = %bus.name(), node_id = %self.id, "Node left");
        first_error.map_or(Ok(()), Err)
    }
}

/// Publishes tells and ask-alls to one topic
pub struct TopicPublisher<'a> {
    node: &'a NodeHandle,
    topic: Topic,
    loopback: Option<bool>,
}

impl TopicPublisher<'_> {
    /// Whether the publishing node receives its own call
    pub fn loopback(mut self, loopback: bool) -> Self {
        self.loopback = Some(loopback);
        self
    }

    /// Fire-and-forget to every subscriber
    pub fn tell(self, path: &str, args: Vec<Value>) {
        let payload = BroadcastPayload::Tell {
            path: path.to_string(),
            args,
        };
        if let Err(e) = self.publish(payload) {
            debug!(error = %e, "Broadcast tell not sent");
        }
    }

    /// Ask every subscriber; results stream back as they arrive
    pub fn all(self, path: &str, args: Vec<Value>) -> Result<AskAllStream> {
        let call_id = CallId::new();
        let payload = BroadcastPayload::Ask {
            call_id,
            path: path.to_string(),
            args,
        };
        Ok(self
            .publish(payload)?
            .unwrap_or_else(|| AskAllStream::empty(call_id)))
    }

    fn publish(self, payload: BroadcastPayload) -> Result<Option<AskAllStream>> {
        let bus = &self.node.bus;
        if bus.is_shut_down() {
            return Err(BusError::Shutdown);
        }
        Ok(bus
            .broadcast
            .publish(bus, self.node.id.clone(), self.topic, self.loopback, payload))
    }
}
