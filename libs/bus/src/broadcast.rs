//! # Broadcast Manager
//!
//! Fans one topic publication out to every interested target and, for
//! ask-all calls, drives the session that gathers the results.
//!
//! ## Targets
//! - Remote: the downstream hops the routing table reports for the topic,
//!   never the hop the message came from.
//! - Local: subscribers hosted here. A locally published call skips its own
//!   publisher unless loopback is on; a remote call reaches local
//!   subscribers only when the table lists `Local` downstream.
//!
//! Every target gets its own argument copy from the [`Dispatcher`](crate::dispatcher::Dispatcher).

use crate::bus::BusInner;
use crate::error::{BusError, Result};
use crate::message::{BroadcastMessage, BroadcastPayload, BusMessage, P2pMessage, P2pPayload};
use crate::session::{AskAllStream, AskSession, Outbound, ResultSink, SessionTable};
use crate::types::{CallId, CallKind, Hop, MessageSource, NodeId, Topic};
use crate::value::Value;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Topic fan-out and ask-all session tracking
#[derive(Default)]
pub struct BroadcastManager {
    sessions: Arc<SessionTable>,
}

impl BroadcastManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_session(&self, call_id: &CallId) -> bool {
        self.sessions.contains(call_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Progress of one session
    pub fn session(&self, call_id: &CallId) -> Option<AskSession> {
        self.sessions.get(call_id)
    }

    /// Publish from a local node. Asks return the caller's result stream.
    pub(crate) fn publish(
        &self,
        bus: &Arc<BusInner>,
        source_id: NodeId,
        topic: Topic,
        loopback: Option<bool>,
        payload: BroadcastPayload,
    ) -> Option<AskAllStream> {
        let message = BroadcastMessage {
            source_id,
            topic,
            loopback,
            payload,
        };
        self.dispatch(bus, Hop::Local, message)
    }

    /// Handle a publication arriving over a link
    pub(crate) fn dispatch_remote(&self, bus: &Arc<BusInner>, source: Hop, message: BroadcastMessage) {
        self.dispatch(bus, source, message);
    }

    fn dispatch(
        &self,
        bus: &Arc<BusInner>,
        source: MessageSource,
        message: BroadcastMessage,
    ) -> Option<AskAllStream> {
        let downstream = bus
            .routing
            .downstream(&message.topic, source, bus.has_parent());
        let remote: Vec<Hop> = downstream.iter().copied().filter(Hop::is_remote).collect();
        let local = self.local_targets(bus, source, &message, &downstream);
        let total = remote.len() + local.len();

        trace!(
            bus = %bus.name(),
            topic = %message.topic,
            %source,
            remote = remote.len(),
            local = local.len(),
            "Dispatching broadcast"
        );

        let mut copies = bus
            .dispatcher
            .dispatch_args(message.payload.args(), total)
            .into_iter();
        let remote_copies: Vec<(Hop, Vec<Value>)> =
            remote.iter().copied().zip(copies.by_ref()).collect();
        let local_copies: Vec<(NodeId, Vec<Value>)> = local.into_iter().zip(copies).collect();

        match &message.payload {
            BroadcastPayload::Tell { .. } => {
                self.fan_out_tell(bus, &message, remote_copies, local_copies);
                None
            }
            BroadcastPayload::Ask { call_id, .. } => {
                self.fan_out_ask(bus, source, *call_id, &message, remote_copies, local_copies)
            }
        }
    }

    fn local_targets(
        &self,
        bus: &BusInner,
        source: MessageSource,
        message: &BroadcastMessage,
        downstream: &[Hop],
    ) -> Vec<NodeId> {
        let subscribers = bus.routing.local_subscribers(&message.topic);
        if source.is_local() {
            let loopback = message.loopback.unwrap_or(bus.config.default_loopback);
            subscribers
                .into_iter()
                .filter(|node| loopback || *node != message.source_id)
                .collect()
        } else if downstream.contains(&Hop::Local) {
            subscribers
        } else {
            Vec::new()
        }
    }

    fn fan_out_tell(
        &self,
        bus: &Arc<BusInner>,
        message: &BroadcastMessage,
        remote: Vec<(Hop, Vec<Value>)>,
        local: Vec<(NodeId, Vec<Value>)>,
    ) {
        for (hop, args) in remote {
            let forwarded = BroadcastMessage {
                payload: message.payload.with_args(args),
                ..message.clone()
            };
            if let Err(e) = bus.bridge.send(hop, BusMessage::Broadcast(forwarded)) {
                warn!(bus = %bus.name(), topic = %message.topic, %hop, error = %e, "Failed to forward broadcast tell");
            }
        }

        let path = message.payload.path().to_string();
        for (node_id, args) in local {
            let bus = bus.clone();
            let topic = message.topic.clone();
            let path = path.clone();
            tokio::spawn(async move {
                if let Err(e) = bus
                    .directory
                    .execute_broadcast(&node_id, &topic, CallKind::Tell, &path, args)
                    .await
                {
                    warn!(bus = %bus.name(), %node_id, %topic, path = %path, error = %e, "Broadcast tell handler failed");
                }
            });
        }
    }

    fn fan_out_ask(
        &self,
        bus: &Arc<BusInner>,
        source: MessageSource,
        call_id: CallId,
        message: &BroadcastMessage,
        remote: Vec<(Hop, Vec<Value>)>,
        local: Vec<(NodeId, Vec<Value>)>,
    ) -> Option<AskAllStream> {
        if remote.is_empty() && local.is_empty() {
            debug!(bus = %bus.name(), topic = %message.topic, %call_id, "Ask-all has no targets");
            if source.is_local() {
                return Some(AskAllStream::empty(call_id));
            }
            send_outbound(bus, vec![(source, fin_message(bus, message, call_id, 0))]);
            return None;
        }

        let hops: Vec<Hop> = remote.iter().map(|(hop, _)| *hop).collect();
        let session = AskSession::new(call_id, source, local.len(), &hops);
        let (sink, stream) = if source.is_local() {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                ResultSink::Local(tx),
                Some(AskAllStream::new(call_id, rx, self.sessions.clone())),
            )
        } else {
            (
                ResultSink::Remote {
                    hop: source,
                    reply_to: message.source_id.clone(),
                    fin_source: bus.self_id(),
                },
                None,
            )
        };
        self.sessions.open(session, sink);

        for (hop, args) in remote {
            let forwarded = BroadcastMessage {
                payload: message.payload.with_args(args),
                ..message.clone()
            };
            if let Err(e) = bus.bridge.send(hop, BusMessage::Broadcast(forwarded)) {
                warn!(bus = %bus.name(), %call_id, %hop, error = %e, "Failed to forward ask-all; counting branch as empty");
                let outbound = self.sessions.record_fin(call_id, hop, Some(0));
                send_outbound(bus, outbound);
            }
        }

        if local.is_empty() {
            return stream;
        }
        let bus = bus.clone();
        let topic = message.topic.clone();
        let path = message.payload.path().to_string();
        tokio::spawn(async move {
            run_local_targets(&bus, call_id, topic, path, local).await;
        });
        stream
    }

    /// Route an `ack_result`/`ack_fin` into its session. `source` is the branch.
    pub(crate) fn handle_remote_ack(&self, bus: &Arc<BusInner>, source: Hop, message: P2pMessage) {
        let outbound = match message.payload {
            P2pPayload::AckResult { call_id, result } => self.sessions.record_result(
                call_id,
                source,
                message.source_id,
                result.map_err(BusError::from_remote),
            ),
            P2pPayload::AckFin {
                call_id,
                total_results,
            } => {
                trace!(bus = %bus.name(), %call_id, %source, total_results, "Branch fin");
                self.sessions.record_fin(call_id, source, Some(total_results))
            }
            P2pPayload::Ask { .. } | P2pPayload::Tell { .. } => {
                debug!(bus = %bus.name(), %source, "Ignoring non-acknowledgement for a session");
                Vec::new()
            }
        };
        send_outbound(bus, outbound);
    }

    /// Unblock sessions waiting on a dropped link
    pub(crate) fn on_link_dropped(&self, bus: &Arc<BusInner>, hop: Hop) {
        let outbound = self.sessions.link_dropped(hop);
        send_outbound(bus, outbound);
    }

    /// Terminate every session
    pub(crate) fn shutdown(&self) {
        self.sessions.shutdown();
    }
}

/// Execute the local branch of an ask-all, reporting each result as it lands
async fn run_local_targets(
    bus: &Arc<BusInner>,
    call_id: CallId,
    topic: Topic,
    path: String,
    targets: Vec<(NodeId, Vec<Value>)>,
) {
    let mut running: FuturesUnordered<_> = targets
        .into_iter()
        .map(|(node_id, args)| {
            let (bus, topic, path) = (bus.clone(), topic.clone(), path.clone());
            async move {
                let result = bus
                    .directory
                    .execute_broadcast(&node_id, &topic, CallKind::Ask, &path, args)
                    .await;
                (node_id, result)
            }
        })
        .collect();

    while let Some((node_id, result)) = running.next().await {
        // The session may have completed or been cancelled while we waited
        if !bus.broadcast.has_session(&call_id) {
            trace!(bus = %bus.name(), %call_id, "Session gone; dropping local results");
            return;
        }
        let outbound = bus
            .broadcast
            .sessions
            .record_result(call_id, Hop::Local, node_id, result);
        send_outbound(bus, outbound);
    }

    let outbound = bus.broadcast.sessions.record_fin(call_id, Hop::Local, None);
    send_outbound(bus, outbound);
}

fn fin_message(bus: &BusInner, message: &BroadcastMessage, call_id: CallId, total_results: usize) -> BusMessage {
    BusMessage::P2p(P2pMessage {
        source_id: bus.self_id(),
        destination_id: message.source_id.clone(),
        payload: P2pPayload::AckFin {
            call_id,
            total_results,
        },
    })
}

fn send_outbound(bus: &BusInner, outbound: Vec<Outbound>) {
    for (hop, message) in outbound {
        if let Err(e) = bus.bridge.send(hop, message) {
            debug!(bus = %bus.name(), %hop, error = %e, "Could not deliver session acknowledgement");
        }
    }
}

/// Convenience for callers that only want the values
pub async fn collect_values(stream: AskAllStream) -> Result<Vec<Value>> {
    stream.collect_all().await.into_iter().collect()
}
