//! # Routing
//!
//! Per-instance routing state and its propagation up the tree.
//!
//! ## Routing Table
//! - `node_routes`: node id -> hop (children only; local presence lives in
//!   the node directory and always wins)
//! - `remote_topic_hops`: topic -> child links interested in it
//! - `local_node_subscriptions`: topic -> local nodes subscribed to it
//!
//! Only the derived `has_interest(topic)` boolean is propagated upward, and
//! only when it flips. Empty sets are pruned so that undoing a change leaves
//! the table equal to what it was.
//!
//! ## Propagation
//! Batches from a child are applied, forwarded to the parent, and rolled
//! back in reverse order if the parent does not acknowledge them. Each
//! batch is answered to the child with a correlated response. A fresh
//! parent link gets a full resync; a dropped link is purged.
//!
//! Everything bound for the parent goes through one queue per bus, drained
//! by a single task that waits for each acknowledgement before sending the
//! next batch. A purge queued after an announcement therefore reaches the
//! parent after it.

use crate::bus::BusInner;
use crate::error::{BusError, Result};
use crate::message::{BusMessage, NodeAnnouncement, SubscriptionUpdate};
use crate::types::{BusId, CorrelationId, Hop, MessageSource, NodeId, Topic};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Routing state of one bus instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    node_routes: HashMap<NodeId, Hop>,
    remote_topic_hops: HashMap<Topic, BTreeSet<BusId>>,
    local_node_subscriptions: HashMap<Topic, BTreeSet<NodeId>>,
}

/// Inverse of one table mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingUndo {
    Route {
        node_id: NodeId,
        previous: Option<Hop>,
        applied: Option<Hop>,
    },
    RemoteInterest {
        bus_id: BusId,
        topic: Topic,
        was_present: bool,
        applied: bool,
    },
    LocalSubscription {
        node_id: NodeId,
        topic: Topic,
        was_present: bool,
        applied: bool,
    },
}

/// Changes to report upward after a link was purged
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub unavailable: Vec<NodeId>,
    pub lost_interest: Vec<Topic>,
}

impl PurgeOutcome {
    pub fn is_empty(&self) -> bool {
        self.unavailable.is_empty() && self.lost_interest.is_empty()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, node_id: &NodeId) -> Option<Hop> {
        self.node_routes.get(node_id).copied()
    }

    /// Routes learnt from children, sorted by node id
    pub fn routes(&self) -> Vec<(NodeId, Hop)> {
        let mut routes: Vec<(NodeId, Hop)> = self
            .node_routes
            .iter()
            .map(|(node, hop)| (node.clone(), *hop))
            .collect();
        routes.sort_by(|a, b| a.0.cmp(&b.0));
        routes
    }

    pub fn has_interest(&self, topic: &Topic) -> bool {
        self.local_node_subscriptions.contains_key(topic)
            || self.remote_topic_hops.contains_key(topic)
    }

    /// Topics with any local or remote interest, sorted
    pub fn interested_topics(&self) -> Vec<Topic> {
        let topics: BTreeSet<&Topic> = self
            .local_node_subscriptions
            .keys()
            .chain(self.remote_topic_hops.keys())
            .collect();
        topics.into_iter().cloned().collect()
    }

    pub fn local_subscribers(&self, topic: &Topic) -> Vec<NodeId> {
        self.local_node_subscriptions
            .get(topic)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remote_subscribers(&self, topic: &Topic) -> Vec<BusId> {
        self.remote_topic_hops
            .get(topic)
            .map(|hops| hops.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Resolve the next hop. Local presence wins over any table entry.
    pub fn next_hop(&self, destination: &NodeId, is_local: bool, has_parent: bool) -> Option<Hop> {
        if is_local {
            return Some(Hop::Local);
        }
        if let Some(hop) = self.route(destination) {
            return Some(hop);
        }
        has_parent.then_some(Hop::Parent)
    }

    /// Fan-out set for a topic, excluding the hop the message came from
    pub fn downstream(&self, topic: &Topic, source: MessageSource, has_parent: bool) -> Vec<Hop> {
        let mut hops = Vec::new();

        if source != Hop::Local && self.local_node_subscriptions.contains_key(topic) {
            hops.push(Hop::Local);
        }
        if let Some(children) = self.remote_topic_hops.get(topic) {
            hops.extend(
                children
                    .iter()
                    .map(|bus_id| Hop::Child(*bus_id))
                    .filter(|hop| *hop != source),
            );
        }
        if has_parent && source != Hop::Parent {
            hops.push(Hop::Parent);
        }
        hops
    }

    /// Point `node_id` at `hop`, or clear it with `None`
    pub fn set_route(&mut self, node_id: &NodeId, hop: Option<Hop>) -> RoutingUndo {
        let previous = match hop {
            Some(hop) => self.node_routes.insert(node_id.clone(), hop),
            None => self.node_routes.remove(node_id),
        };
        RoutingUndo::Route {
            node_id: node_id.clone(),
            previous,
            applied: hop,
        }
    }

    /// Change one local subscription. Returns the undo and the interest flip, if any.
    pub fn set_local_subscription(
        &mut self,
        node_id: &NodeId,
        topic: &Topic,
        subscribed: bool,
    ) -> (RoutingUndo, Option<SubscriptionUpdate>) {
        let before = self.has_interest(topic);
        let was_present = set_membership(
            &mut self.local_node_subscriptions,
            topic,
            node_id.clone(),
            subscribed,
        );
        let undo = RoutingUndo::LocalSubscription {
            node_id: node_id.clone(),
            topic: topic.clone(),
            was_present,
            applied: subscribed,
        };
        (undo, self.flip(topic, before))
    }

    /// Change one child's interest. Returns the undo and the interest flip, if any.
    pub fn set_remote_interest(
        &mut self,
        bus_id: BusId,
        topic: &Topic,
        subscribed: bool,
    ) -> (RoutingUndo, Option<SubscriptionUpdate>) {
        let before = self.has_interest(topic);
        let was_present = set_membership(&mut self.remote_topic_hops, topic, bus_id, subscribed);
        let undo = RoutingUndo::RemoteInterest {
            bus_id,
            topic: topic.clone(),
            was_present,
            applied: subscribed,
        };
        (undo, self.flip(topic, before))
    }

    /// Apply a node-announcement batch from `source`.
    ///
    /// Returns the undo log and the entries to forward upward. A node that is
    /// local (per `is_local`) or routed through another hop is a conflict:
    /// the whole batch is rolled back and the conflict returned.
    pub fn apply_announcements(
        &mut self,
        source: Hop,
        announcements: &[NodeAnnouncement],
        is_local: impl Fn(&NodeId) -> bool,
    ) -> Result<(Vec<RoutingUndo>, Vec<NodeAnnouncement>)> {
        let mut undo = Vec::with_capacity(announcements.len());
        let mut forward = Vec::with_capacity(announcements.len());

        for announcement in announcements {
            let node_id = &announcement.node_id;
            let current = self.route(node_id);

            if announcement.is_available {
                let existing = if is_local(node_id) {
                    Some(Hop::Local)
                } else {
                    current.filter(|hop| *hop != source)
                };
                if let Some(existing) = existing {
                    self.rollback(undo);
                    return Err(BusError::NodeIdConflict {
                        node_id: node_id.clone(),
                        existing,
                    });
                }
                undo.push(self.set_route(node_id, Some(source)));
                forward.push(announcement.clone());
            } else {
                match current {
                    Some(hop) if hop == source => {
                        undo.push(self.set_route(node_id, None));
                        forward.push(announcement.clone());
                    }
                    None => forward.push(announcement.clone()),
                    Some(owner) => {
                        debug!(%node_id, %owner, %source, "Ignoring unavailability from a non-owning hop");
                    }
                }
            }
        }
        Ok((undo, forward))
    }

    /// Apply a sub-update batch from a child. Returns the undo log and net flips.
    pub fn apply_sub_updates(
        &mut self,
        bus_id: BusId,
        updates: &[SubscriptionUpdate],
    ) -> (Vec<RoutingUndo>, Vec<SubscriptionUpdate>) {
        let mut before: Vec<(Topic, bool)> = Vec::new();
        let mut undo = Vec::with_capacity(updates.len());

        for update in updates {
            if !before.iter().any(|(topic, _)| *topic == update.topic) {
                before.push((update.topic.clone(), self.has_interest(&update.topic)));
            }
            let (entry, _) = self.set_remote_interest(bus_id, &update.topic, update.is_subscribed);
            undo.push(entry);
        }

        let flips = before
            .into_iter()
            .filter_map(|(topic, was)| self.flip(&topic, was))
            .collect();
        (undo, flips)
    }

    /// Undo mutations in reverse order, skipping any overwritten since
    pub fn rollback(&mut self, undo: Vec<RoutingUndo>) {
        for entry in undo.into_iter().rev() {
            match entry {
                RoutingUndo::Route {
                    node_id,
                    previous,
                    applied,
                } => {
                    if self.route(&node_id) != applied {
                        trace!(%node_id, "Route changed since apply; keeping current");
                        continue;
                    }
                    match previous {
                        Some(hop) => self.node_routes.insert(node_id, hop),
                        None => self.node_routes.remove(&node_id),
                    };
                }
                RoutingUndo::RemoteInterest {
                    bus_id,
                    topic,
                    was_present,
                    applied,
                } => {
                    let present = self
                        .remote_topic_hops
                        .get(&topic)
                        .is_some_and(|hops| hops.contains(&bus_id));
                    if present == applied {
                        set_membership(&mut self.remote_topic_hops, &topic, bus_id, was_present);
                    }
                }
                RoutingUndo::LocalSubscription {
                    node_id,
                    topic,
                    was_present,
                    applied,
                } => {
                    let present = self
                        .local_node_subscriptions
                        .get(&topic)
                        .is_some_and(|nodes| nodes.contains(&node_id));
                    if present == applied {
                        set_membership(
                            &mut self.local_node_subscriptions,
                            &topic,
                            node_id,
                            was_present,
                        );
                    }
                }
            }
        }
    }

    /// Remove everything attributed to `hop`
    pub fn purge_hop(&mut self, hop: Hop) -> PurgeOutcome {
        let mut unavailable: Vec<NodeId> = self
            .node_routes
            .iter()
            .filter(|(_, route)| **route == hop)
            .map(|(node, _)| node.clone())
            .collect();
        unavailable.sort();
        for node in &unavailable {
            self.node_routes.remove(node);
        }

        let mut lost_interest = Vec::new();
        if let Hop::Child(bus_id) = hop {
            let topics: Vec<Topic> = self
                .remote_topic_hops
                .iter()
                .filter(|(_, hops)| hops.contains(&bus_id))
                .map(|(topic, _)| topic.clone())
                .collect();
            for topic in topics {
                let (_, flip) = self.set_remote_interest(bus_id, &topic, false);
                if flip.is_some() {
                    lost_interest.push(topic);
                }
            }
            lost_interest.sort();
        }

        PurgeOutcome {
            unavailable,
            lost_interest,
        }
    }

    fn flip(&self, topic: &Topic, before: bool) -> Option<SubscriptionUpdate> {
        let after = self.has_interest(topic);
        (before != after).then(|| SubscriptionUpdate {
            topic: topic.clone(),
            is_subscribed: after,
        })
    }
}

/// Insert or remove `member` in the set under `key`, pruning empty sets.
/// Returns whether the member was present before.
fn set_membership<T: Ord>(
    map: &mut HashMap<Topic, BTreeSet<T>>,
    key: &Topic,
    member: T,
    present: bool,
) -> bool {
    if present {
        !map.entry(key.clone()).or_default().insert(member)
    } else {
        let Some(set) = map.get_mut(key) else {
            return false;
        };
        let was_present = set.remove(&member);
        if set.is_empty() {
            map.remove(key);
        }
        was_present
    }
}

/// Routing table plus its propagation protocol
pub struct RoutingFeature {
    table: Mutex<RoutingTable>,
    upstream: mpsc::UnboundedSender<UpstreamBatch>,
}

/// One parent-bound batch and whoever waits on its acknowledgement
pub(crate) struct UpstreamBatch {
    announcements: Vec<NodeAnnouncement>,
    updates: Vec<SubscriptionUpdate>,
    completion: Completion,
}

enum Completion {
    /// A local caller awaits the outcome
    Caller(oneshot::Sender<Result<()>>),
    /// A child's batch, answered once the parent has answered
    Child {
        source: Hop,
        kind: ResponseKind,
        correlation_id: CorrelationId,
        undo: Vec<RoutingUndo>,
    },
    /// Nobody waits; failures are logged
    Detached(&'static str),
}

impl RoutingFeature {
    pub(crate) fn new(upstream: mpsc::UnboundedSender<UpstreamBatch>) -> Self {
        Self {
            table: Mutex::new(RoutingTable::new()),
            upstream,
        }
    }

    pub fn snapshot(&self) -> RoutingTable {
        self.table.lock().clone()
    }

    pub fn route(&self, node_id: &NodeId) -> Option<Hop> {
        self.table.lock().route(node_id)
    }

    pub fn next_hop(&self, destination: &NodeId, is_local: bool, has_parent: bool) -> Option<Hop> {
        self.table.lock().next_hop(destination, is_local, has_parent)
    }

    pub fn downstream(&self, topic: &Topic, source: MessageSource, has_parent: bool) -> Vec<Hop> {
        self.table.lock().downstream(topic, source, has_parent)
    }

    pub fn local_subscribers(&self, topic: &Topic) -> Vec<NodeId> {
        self.table.lock().local_subscribers(topic)
    }

    /// Queue a batch behind every earlier parent-bound batch.
    ///
    /// Callers that mutate the table enqueue while still holding its lock,
    /// so the parent sees deltas in the order they were applied here.
    fn enqueue(
        &self,
        announcements: Vec<NodeAnnouncement>,
        updates: Vec<SubscriptionUpdate>,
        completion: Completion,
    ) {
        let batch = UpstreamBatch {
            announcements,
            updates,
            completion,
        };
        if self.upstream.send(batch).is_err() {
            debug!("Upstream queue closed; dropping batch");
        }
    }

    fn enqueue_and_wait(
        &self,
        announcements: Vec<NodeAnnouncement>,
        updates: Vec<SubscriptionUpdate>,
    ) -> oneshot::Receiver<Result<()>> {
        let (done, outcome) = oneshot::channel();
        self.enqueue(announcements, updates, Completion::Caller(done));
        outcome
    }

    /// Announce a locally hosted node upward. Always propagates.
    pub(crate) async fn announce_local_node(
        &self,
        bus: &Arc<BusInner>,
        node_id: &NodeId,
        available: bool,
    ) -> Result<()> {
        debug!(bus = %bus.name(), %node_id, available, "Announcing local node");
        let announcement = NodeAnnouncement {
            node_id: node_id.clone(),
            is_available: available,
        };
        let outcome = {
            let _table = self.table.lock();
            self.enqueue_and_wait(vec![announcement], Vec::new())
        };
        outcome.await.unwrap_or(Err(BusError::Shutdown))
    }

    /// Change a local subscription; a flip of interest must be acknowledged upward
    pub(crate) async fn update_local_subscription(
        &self,
        bus: &Arc<BusInner>,
        node_id: &NodeId,
        topic: &Topic,
        subscribed: bool,
    ) -> Result<()> {
        let (undo, outcome) = {
            let mut table = self.table.lock();
            let (undo, flip) = table.set_local_subscription(node_id, topic, subscribed);
            let Some(flip) = flip else {
                return Ok(());
            };
            debug!(bus = %bus.name(), %topic, interested = flip.is_subscribed, "Local interest changed");
            (undo, self.enqueue_and_wait(Vec::new(), vec![flip]))
        };

        if let Err(e) = outcome.await.unwrap_or(Err(BusError::Shutdown)) {
            warn!(bus = %bus.name(), %node_id, %topic, error = %e, "Subscription not acknowledged upstream; rolling back");
            self.table.lock().rollback(vec![undo]);
            return Err(e);
        }
        Ok(())
    }

    /// Handle a node-announcement batch from a child
    pub(crate) fn handle_node_announcement(
        &self,
        bus: &Arc<BusInner>,
        source: Hop,
        correlation_id: CorrelationId,
        announcements: Vec<NodeAnnouncement>,
    ) {
        if !matches!(source, Hop::Child(_)) {
            let error = BusError::Rejected {
                hop: source,
                message: "node announcements are only accepted from children".to_string(),
            };
            respond(bus, source, ResponseKind::NodeAnnouncement, correlation_id, Some(&error));
            return;
        }

        let mut table = self.table.lock();
        let applied = table.apply_announcements(source, &announcements, |node| bus.directory.contains(node));
        let (undo, forward) = match applied {
            Ok(applied) => applied,
            Err(e) => {
                drop(table);
                warn!(bus = %bus.name(), %source, error = %e, "Rejecting node announcement");
                respond(bus, source, ResponseKind::NodeAnnouncement, correlation_id, Some(&e));
                return;
            }
        };
        trace!(bus = %bus.name(), %source, count = forward.len(), "Applied node announcements");

        self.forward_or_respond(
            bus,
            source,
            ResponseKind::NodeAnnouncement,
            correlation_id,
            undo,
            forward,
            Vec::new(),
        );
        drop(table);
    }

    /// Handle a sub-update batch from a child
    pub(crate) fn handle_sub_update(
        &self,
        bus: &Arc<BusInner>,
        source: Hop,
        correlation_id: CorrelationId,
        updates: Vec<SubscriptionUpdate>,
    ) {
        let Hop::Child(bus_id) = source else {
            let error = BusError::Rejected {
                hop: source,
                message: "sub-updates are only accepted from children".to_string(),
            };
            respond(bus, source, ResponseKind::SubUpdate, correlation_id, Some(&error));
            return;
        };

        let mut table = self.table.lock();
        let (undo, flips) = table.apply_sub_updates(bus_id, &updates);
        trace!(bus = %bus.name(), %source, updates = updates.len(), flips = flips.len(), "Applied sub-updates");

        self.forward_or_respond(
            bus,
            source,
            ResponseKind::SubUpdate,
            correlation_id,
            undo,
            Vec::new(),
            flips,
        );
        drop(table);
    }

    /// Acknowledge a child's batch now, or queue it and acknowledge once the
    /// parent has. Called with the table lock held.
    #[allow(clippy::too_many_arguments)]
    fn forward_or_respond(
        &self,
        bus: &Arc<BusInner>,
        source: Hop,
        kind: ResponseKind,
        correlation_id: CorrelationId,
        undo: Vec<RoutingUndo>,
        announcements: Vec<NodeAnnouncement>,
        updates: Vec<SubscriptionUpdate>,
    ) {
        let nothing_to_forward = announcements.is_empty() && updates.is_empty();
        if nothing_to_forward || !bus.has_parent() {
            respond(bus, source, kind, correlation_id, None);
            return;
        }
        self.enqueue(
            announcements,
            updates,
            Completion::Child {
                source,
                kind,
                correlation_id,
                undo,
            },
        );
    }

    /// Settle a batch once the parent answered it
    fn complete(&self, bus: &Arc<BusInner>, completion: Completion, result: Result<()>) {
        match completion {
            Completion::Caller(done) => {
                let _ = done.send(result);
            }
            Completion::Child {
                source,
                kind,
                correlation_id,
                undo,
            } => match result {
                Ok(()) => respond(bus, source, kind, correlation_id, None),
                Err(e) => {
                    warn!(bus = %bus.name(), %source, error = %e, "Upstream refused batch; rolling back");
                    self.table.lock().rollback(undo);
                    respond(bus, source, kind, correlation_id, Some(&e));
                }
            },
            Completion::Detached(operation) => {
                if let Err(e) = result {
                    warn!(bus = %bus.name(), operation, error = %e, "Upstream propagation failed");
                }
            }
        }
    }

    /// Re-announce everything to a freshly connected parent
    pub(crate) fn on_parent_ready(&self, bus: &Arc<BusInner>) {
        let table = self.table.lock();

        let mut announcements: Vec<NodeAnnouncement> = bus
            .directory
            .node_ids()
            .into_iter()
            .map(|node_id| NodeAnnouncement {
                node_id,
                is_available: true,
            })
            .collect();
        announcements.extend(table.routes().into_iter().map(|(node_id, _)| NodeAnnouncement {
            node_id,
            is_available: true,
        }));
        let updates: Vec<SubscriptionUpdate> = table
            .interested_topics()
            .into_iter()
            .map(|topic| SubscriptionUpdate {
                topic,
                is_subscribed: true,
            })
            .collect();

        info!(
            bus = %bus.name(),
            nodes = announcements.len(),
            topics = updates.len(),
            "Resyncing routing state to parent"
        );
        self.enqueue(announcements, updates, Completion::Detached("parent resync"));
        drop(table);
    }

    /// Purge a dropped link and report the loss upward
    pub(crate) fn on_connection_dropped(&self, bus: &Arc<BusInner>, hop: Hop) {
        let mut table = self.table.lock();
        let outcome = table.purge_hop(hop);
        if outcome.is_empty() {
            return;
        }

        info!(
            bus = %bus.name(),
            %hop,
            nodes = outcome.unavailable.len(),
            topics = outcome.lost_interest.len(),
            "Purged routes of dropped link"
        );

        if hop == Hop::Parent || !bus.has_parent() {
            return;
        }

        let announcements = outcome
            .unavailable
            .into_iter()
            .map(|node_id| NodeAnnouncement {
                node_id,
                is_available: false,
            })
            .collect();
        let updates = outcome
            .lost_interest
            .into_iter()
            .map(|topic| SubscriptionUpdate {
                topic,
                is_subscribed: false,
            })
            .collect();
        self.enqueue(announcements, updates, Completion::Detached("purge report"));
        drop(table);
    }
}

/// Drain parent-bound batches one at a time, in queue order
pub(crate) async fn upstream_loop(bus: Weak<BusInner>, mut batches: mpsc::UnboundedReceiver<UpstreamBatch>) {
    while let Some(batch) = batches.recv().await {
        let Some(bus) = bus.upgrade() else { break };
        let UpstreamBatch {
            announcements,
            updates,
            completion,
        } = batch;
        let result = propagate_upward(&bus, announcements, updates).await;
        bus.routing.complete(&bus, completion, result);
    }
    debug!("Upstream propagation task stopped");
}

#[derive(Debug, Clone, Copy)]
enum ResponseKind {
    NodeAnnouncement,
    SubUpdate,
}

fn respond(
    bus: &BusInner,
    destination: Hop,
    kind: ResponseKind,
    correlation_id: CorrelationId,
    error: Option<&BusError>,
) {
    let error = error.map(BusError::to_remote);
    let message = match kind {
        ResponseKind::NodeAnnouncement => BusMessage::NodeAnnouncementResponse {
            correlation_id,
            error,
        },
        ResponseKind::SubUpdate => BusMessage::SubUpdateResponse {
            correlation_id,
            error,
        },
    };

    if let Err(e) = bus.bridge.send(destination, message) {
        debug!(bus = %bus.name(), %destination, error = %e, "Could not acknowledge control message");
    }
}

/// Send announcements then sub-updates to the parent and wait for both acks.
/// Without a ready parent there is nothing to do; the resync covers it later.
async fn propagate_upward(
    bus: &Arc<BusInner>,
    announcements: Vec<NodeAnnouncement>,
    updates: Vec<SubscriptionUpdate>,
) -> Result<()> {
    if !bus.has_parent() {
        return Ok(());
    }
    let timeout = bus.config.request_timeout();

    if !announcements.is_empty() {
        bus.protocol
            .send_request_and_wait_for_ack(
                &bus.bridge,
                Hop::Parent,
                "node-announcement",
                timeout,
                |correlation_id| BusMessage::NodeAnnouncement {
                    correlation_id,
                    announcements,
                },
            )
            .await?;
    }

    if !updates.is_empty() {
        bus.protocol
            .send_request_and_wait_for_ack(
                &bus.bridge,
                Hop::Parent,
                "sub-update",
                timeout,
                |correlation_id| BusMessage::SubUpdate {
                    correlation_id,
                    updates,
                },
            )
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::from(id)
    }

    fn available(id: &str) -> NodeAnnouncement {
        NodeAnnouncement {
            node_id: node(id),
            is_available: true,
        }
    }

    fn unavailable(id: &str) -> NodeAnnouncement {
        NodeAnnouncement {
            node_id: node(id),
            is_available: false,
        }
    }

    const CHILD_1: Hop = Hop::Child(BusId(1));
    const CHILD_2: Hop = Hop::Child(BusId(2));

    #[test]
    fn test_local_presence_wins_over_routes() {
        let mut table = RoutingTable::new();
        table.set_route(&node("n1"), Some(CHILD_1));

        assert_eq!(table.next_hop(&node("n1"), true, true), Some(Hop::Local));
        assert_eq!(table.next_hop(&node("n1"), false, true), Some(CHILD_1));
        assert_eq!(table.next_hop(&node("n2"), false, true), Some(Hop::Parent));
        assert_eq!(table.next_hop(&node("n2"), false, false), None);
    }

    #[test]
    fn test_downstream_excludes_source() {
        let mut table = RoutingTable::new();
        let topic = Topic::from("t");
        table.set_local_subscription(&node("n1"), &topic, true);
        table.set_remote_interest(BusId(1), &topic, true);
        table.set_remote_interest(BusId(2), &topic, true);

        assert_eq!(
            table.downstream(&topic, Hop::Local, true),
            vec![CHILD_1, CHILD_2, Hop::Parent]
        );
        assert_eq!(
            table.downstream(&topic, CHILD_1, true),
            vec![Hop::Local, CHILD_2, Hop::Parent]
        );
        assert_eq!(
            table.downstream(&topic, Hop::Parent, true),
            vec![Hop::Local, CHILD_1, CHILD_2]
        );
        assert_eq!(
            table.downstream(&Topic::from("other"), Hop::Local, false),
            Vec::<Hop>::new()
        );
    }

    #[test]
    fn test_interest_flips_only_on_change() {
        let mut table = RoutingTable::new();
        let topic = Topic::from("t");

        let (_, flip) = table.set_local_subscription(&node("a"), &topic, true);
        assert_eq!(flip.map(|f| f.is_subscribed), Some(true));
        let (_, flip) = table.set_remote_interest(BusId(3), &topic, true);
        assert!(flip.is_none());
        let (_, flip) = table.set_local_subscription(&node("a"), &topic, false);
        assert!(flip.is_none());
        let (_, flip) = table.set_remote_interest(BusId(3), &topic, false);
        assert_eq!(flip.map(|f| f.is_subscribed), Some(false));
        assert_eq!(table, RoutingTable::new());
    }

    #[test]
    fn test_announcement_conflict_rolls_back_batch() {
        let mut table = RoutingTable::new();
        table.set_route(&node("taken"), Some(CHILD_2));
        let before = table.clone();

        let batch = vec![available("fresh-1"), available("fresh-2"), available("taken")];
        let err = table
            .apply_announcements(CHILD_1, &batch, |_| false)
            .unwrap_err();

        assert_eq!(
            err,
            BusError::NodeIdConflict {
                node_id: node("taken"),
                existing: CHILD_2,
            }
        );
        assert_eq!(table, before);
    }

    #[test]
    fn test_announcement_of_local_node_conflicts() {
        let mut table = RoutingTable::new();
        let err = table
            .apply_announcements(CHILD_1, &[available("mine")], |n| n.as_str() == "mine")
            .unwrap_err();
        assert!(matches!(err, BusError::NodeIdConflict { existing: Hop::Local, .. }));
    }

    #[test]
    fn test_rollback_restores_identical_table() {
        let mut table = RoutingTable::new();
        table.set_route(&node("old"), Some(CHILD_1));
        table.set_remote_interest(BusId(1), &Topic::from("kept"), true);
        let before = table.clone();

        let (undo, forward) = table
            .apply_announcements(
                CHILD_1,
                &[available("a"), available("b"), unavailable("old"), available("a")],
                |_| false,
            )
            .unwrap();
        assert_eq!(forward.len(), 4);
        let (sub_undo, flips) = table.apply_sub_updates(
            BusId(1),
            &[
                SubscriptionUpdate {
                    topic: Topic::from("new"),
                    is_subscribed: true,
                },
                SubscriptionUpdate {
                    topic: Topic::from("kept"),
                    is_subscribed: false,
                },
            ],
        );
        assert_eq!(flips.len(), 2);
        assert_ne!(table, before);

        table.rollback(sub_undo);
        table.rollback(undo);
        assert_eq!(table, before);
    }

    #[test]
    fn test_rollback_skips_overwritten_entries() {
        let mut table = RoutingTable::new();
        let (undo, _) = table
            .apply_announcements(CHILD_1, &[available("n1")], |_| false)
            .unwrap();

        // A purge ran while the batch was in flight
        table.purge_hop(CHILD_1);
        table.set_route(&node("n1"), Some(CHILD_2));

        table.rollback(undo);
        assert_eq!(table.route(&node("n1")), Some(CHILD_2));
    }

    #[test]
    fn test_unavailability_from_non_owner_is_ignored() {
        let mut table = RoutingTable::new();
        table.set_route(&node("n1"), Some(CHILD_2));

        let (undo, forward) = table
            .apply_announcements(CHILD_1, &[unavailable("n1")], |_| false)
            .unwrap();
        assert!(undo.is_empty());
        assert!(forward.is_empty());
        assert_eq!(table.route(&node("n1")), Some(CHILD_2));
    }

    #[test]
    fn test_reannouncement_is_idempotent() {
        let mut table = RoutingTable::new();
        table
            .apply_announcements(CHILD_1, &[available("n1")], |_| false)
            .unwrap();
        let once = table.clone();
        table
            .apply_announcements(CHILD_1, &[available("n1")], |_| false)
            .unwrap();
        assert_eq!(table, once);
    }

    #[test]
    fn test_purge_child() {
        let mut table = RoutingTable::new();
        let shared = Topic::from("shared");
        let only_child = Topic::from("only-child");
        table.set_route(&node("a"), Some(CHILD_1));
        table.set_route(&node("b"), Some(CHILD_2));
        table.set_remote_interest(BusId(1), &shared, true);
        table.set_remote_interest(BusId(2), &shared, true);
        table.set_remote_interest(BusId(1), &only_child, true);

        let outcome = table.purge_hop(CHILD_1);
        assert_eq!(outcome.unavailable, vec![node("a")]);
        assert_eq!(outcome.lost_interest, vec![only_child.clone()]);
        assert_eq!(table.route(&node("a")), None);
        assert_eq!(table.route(&node("b")), Some(CHILD_2));
        assert_eq!(table.remote_subscribers(&shared), vec![BusId(2)]);
        assert!(!table.has_interest(&only_child));
    }
}
