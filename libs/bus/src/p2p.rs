//! P2P Router
//!
//! Resolves the next hop of a point-to-point message and either executes it
//! locally or forwards it unchanged. Replies are ordinary P2P messages
//! addressed back to the caller and routed hop by hop like requests.
//!
//! Acknowledgements whose call id belongs to an ask-all session on this bus
//! are handed to the session manager instead.

use crate::bus::BusInner;
use crate::error::{BusError, RemoteError, Result};
use crate::message::{BusMessage, P2pMessage, P2pPayload};
use crate::types::{CallId, CallKind, Hop, NodeId};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

type PendingMap = Mutex<HashMap<CallId, oneshot::Sender<Result<Value>>>>;

/// Removes a pending ask once its caller stops waiting, however that happens
struct PendingCall<'a> {
    pending: &'a PendingMap,
    call_id: CallId,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.call_id);
    }
}

/// Point-to-point routing plus the asks issued by local nodes
#[derive(Default)]
pub struct P2pRouter {
    pending: PendingMap,
}

impl P2pRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks issued here that are still waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    /// Issue an ask from a local node and wait for the routed reply
    pub(crate) async fn call(
        &self,
        bus: &Arc<BusInner>,
        source: &NodeId,
        destination: &NodeId,
        path: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let call_id = CallId::new();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(call_id, tx);
        let _pending = PendingCall {
            pending: &self.pending,
            call_id,
        };

        trace!(bus = %bus.name(), %call_id, %source, %destination, path, "P2P ask");
        self.route(
            bus,
            Hop::Local,
            P2pMessage {
                source_id: source.clone(),
                destination_id: destination.clone(),
                payload: P2pPayload::Ask {
                    call_id,
                    path: path.to_string(),
                    args,
                },
            },
        );

        let timeout = bus.config.call_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::Shutdown),
            Err(_) => Err(BusError::request_timeout(
                format!("ask {destination}/{path}"),
                timeout.as_millis() as u64,
            )),
        }
    }

    /// Send a tell from a local node; nothing comes back
    pub(crate) fn tell(
        &self,
        bus: &Arc<BusInner>,
        source: &NodeId,
        destination: NodeId,
        path: &str,
        args: Vec<Value>,
    ) {
        trace!(bus = %bus.name(), %source, %destination, path, "P2P tell");
        self.route(
            bus,
            Hop::Local,
            P2pMessage {
                source_id: source.clone(),
                destination_id: destination,
                payload: P2pPayload::Tell {
                    path: path.to_string(),
                    args,
                },
            },
        );
    }

    /// Route one P2P message arriving from `source`
    pub(crate) fn route(&self, bus: &Arc<BusInner>, source: Hop, message: P2pMessage) {
        if let P2pPayload::AckResult { call_id, .. } | P2pPayload::AckFin { call_id, .. } =
            &message.payload
        {
            if bus.broadcast.has_session(call_id) {
                bus.broadcast.handle_remote_ack(bus, source, message);
                return;
            }
        }

        match bus.next_hop(&message.destination_id) {
            Some(Hop::Local) => self.deliver_local(bus, message),
            Some(hop) if hop == source => {
                debug!(
                    bus = %bus.name(),
                    destination = %message.destination_id,
                    %hop,
                    "Next hop points back at the sender"
                );
                self.unroutable(bus, message);
            }
            Some(hop) => {
                let ask = match &message.payload {
                    P2pPayload::Ask { call_id, .. } => Some((
                        *call_id,
                        message.source_id.clone(),
                        message.destination_id.clone(),
                    )),
                    _ => None,
                };
                trace!(bus = %bus.name(), %hop, destination = %message.destination_id, "Forwarding P2P message");

                if let Err(e) = bus.bridge.send(hop, BusMessage::P2p(message)) {
                    warn!(bus = %bus.name(), %hop, error = %e, "Failed to forward P2P message");
                    if let Some((call_id, caller, destination)) = ask {
                        let not_found = BusError::NodeNotFound {
                            node_id: destination.clone(),
                        };
                        self.reply(bus, destination, caller, call_id, Err(not_found));
                    }
                }
            }
            None => self.unroutable(bus, message),
        }
    }

    fn deliver_local(&self, bus: &Arc<BusInner>, message: P2pMessage) {
        let P2pMessage {
            source_id,
            destination_id,
            payload,
        } = message;

        match payload {
            P2pPayload::Ask {
                call_id,
                path,
                args,
            } => {
                let bus = bus.clone();
                tokio::spawn(async move {
                    let result = bus
                        .directory
                        .execute_p2p(&destination_id, CallKind::Ask, &path, args)
                        .await;
                    bus.p2p
                        .reply(&bus, destination_id, source_id, call_id, result);
                });
            }
            P2pPayload::Tell { path, args } => {
                let bus = bus.clone();
                tokio::spawn(async move {
                    if let Err(e) = bus
                        .directory
                        .execute_p2p(&destination_id, CallKind::Tell, &path, args)
                        .await
                    {
                        warn!(bus = %bus.name(), node_id = %destination_id, path = %path, error = %e, "Tell handler failed");
                    }
                });
            }
            P2pPayload::AckResult { call_id, result } => {
                let Some(waiter) = self.pending.lock().remove(&call_id) else {
                    debug!(bus = %bus.name(), %call_id, "Reply for unknown or expired call");
                    return;
                };
                let _ = waiter.send(result.map_err(BusError::from_remote));
            }
            P2pPayload::AckFin { call_id, .. } => {
                trace!(bus = %bus.name(), %call_id, "Fin for a finished session");
            }
        }
    }

    /// No route: asks get a NodeNotFound reply, everything else is dropped
    fn unroutable(&self, bus: &Arc<BusInner>, message: P2pMessage) {
        match message.payload {
            P2pPayload::Ask { call_id, .. } => {
                debug!(bus = %bus.name(), destination = %message.destination_id, %call_id, "No route for ask");
                let not_found = BusError::NodeNotFound {
                    node_id: message.destination_id.clone(),
                };
                self.reply(
                    bus,
                    message.destination_id,
                    message.source_id,
                    call_id,
                    Err(not_found),
                );
            }
            P2pPayload::Tell { .. } => {
                debug!(bus = %bus.name(), destination = %message.destination_id, "Dropping tell to unreachable node");
            }
            P2pPayload::AckResult { call_id, .. } | P2pPayload::AckFin { call_id, .. } => {
                debug!(bus = %bus.name(), destination = %message.destination_id, %call_id, "Dropping unroutable acknowledgement");
            }
        }
    }

    /// Send the result of an ask back toward its caller
    pub(crate) fn reply(
        &self,
        bus: &Arc<BusInner>,
        from: NodeId,
        to: NodeId,
        call_id: CallId,
        result: Result<Value>,
    ) {
        let result: std::result::Result<Value, RemoteError> = result.map_err(|e| e.to_remote());
        self.route(
            bus,
            Hop::Local,
            P2pMessage {
                source_id: from,
                destination_id: to,
                payload: P2pPayload::AckResult { call_id, result },
            },
        );
    }

    /// Fail every outstanding ask
    pub(crate) fn fail_all(&self, error: BusError) {
        let drained: Vec<_> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for waiter in drained {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}
