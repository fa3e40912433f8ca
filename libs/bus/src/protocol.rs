//! # Protocol Coordinator
//!
//! Classifies inbound messages and hands each category to the component
//! that owns it. Handshakes are answered inline. Every other control request
//! goes through [`ProtocolCoordinator::send_request_and_wait_for_ack`], which
//! parks a oneshot under the request's correlation id until the matching
//! response, a send failure, a link drop or the timeout resolves it.

use crate::bridge::{BridgeManager, LinkId};
use crate::bus::BusInner;
use crate::error::{BusError, RemoteError, Result};
use crate::message::BusMessage;
use crate::types::{CorrelationId, Hop};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

struct PendingRequest {
    destination: Hop,
    operation: &'static str,
    responder: oneshot::Sender<Result<()>>,
}

/// Drops a request's entry when its waiter goes away
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<CorrelationId, PendingRequest>>,
    correlation_id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.correlation_id);
    }
}

/// Correlation table for control requests sent by this bus
pub struct ProtocolCoordinator {
    next_correlation_id: AtomicU64,
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
}

impl Default for ProtocolCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolCoordinator {
    pub fn new() -> Self {
        Self {
            next_correlation_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_correlation_id(&self) -> CorrelationId {
        self.next_correlation_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a correlated request and wait for its acknowledgement
    pub async fn send_request_and_wait_for_ack<F>(
        &self,
        bridge: &BridgeManager,
        destination: Hop,
        operation: &'static str,
        timeout: Duration,
        build: F,
    ) -> Result<()>
    where
        F: FnOnce(CorrelationId) -> BusMessage,
    {
        let correlation_id = self.next_correlation_id();
        let (responder, response) = oneshot::channel();
        self.pending.lock().insert(
            correlation_id,
            PendingRequest {
                destination,
                operation,
                responder,
            },
        );
        let _pending = PendingGuard {
            pending: &self.pending,
            correlation_id,
        };

        if let Err(e) = bridge.send(destination, build(correlation_id)) {
            debug!(%destination, operation, correlation_id, error = %e, "Request could not be sent");
            return Err(e);
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::LinkClosed {
                hop: destination,
                reason: format!("{operation} abandoned"),
            }),
            Err(_) => {
                warn!(%destination, operation, correlation_id, "Request timed out");
                Err(BusError::request_timeout(operation, timeout.as_millis() as u64))
            }
        }
    }

    /// Resolve a pending request from its response
    pub fn resolve(&self, source: Hop, correlation_id: CorrelationId, error: Option<RemoteError>) {
        let Some(pending) = self.pending.lock().remove(&correlation_id) else {
            debug!(%source, correlation_id, "Response for unknown or expired request");
            return;
        };

        if pending.destination != source {
            warn!(
                expected = %pending.destination,
                %source,
                correlation_id,
                "Response arrived from an unexpected hop"
            );
        }

        let result = match error {
            None => Ok(()),
            Some(remote) => Err(BusError::Rejected {
                hop: source,
                message: remote.to_string(),
            }),
        };
        trace!(operation = pending.operation, correlation_id, ok = result.is_ok(), "Request resolved");
        let _ = pending.responder.send(result);
    }

    /// Fail every request waiting on `hop`
    pub fn fail_pending_for(&self, hop: Hop) -> usize {
        let failed: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, request)| request.destination == hop)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = failed.len();
        for request in failed {
            let _ = request.responder.send(Err(BusError::LinkClosed {
                hop,
                reason: format!("{} interrupted by link drop", request.operation),
            }));
        }
        count
    }

    /// Fail every pending request
    pub fn fail_all(&self, error: BusError) {
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, r)| r).collect();
        for request in drained {
            let _ = request.responder.send(Err(error.clone()));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Route one inbound message to the component that owns its category
    pub(crate) fn handle_message(
        &self,
        bus: &Arc<BusInner>,
        hop: Hop,
        link_id: LinkId,
        message: BusMessage,
    ) {
        let kind = message.kind();
        trace!(bus = %bus.name(), %hop, message = message.name(), ?kind, "Inbound message");

        match message {
            BusMessage::Handshake { correlation_id } => {
                if hop != Hop::Parent {
                    warn!(bus = %bus.name(), %hop, "Ignoring handshake from a child link");
                    return;
                }
                if let Err(e) = bus
                    .bridge
                    .send(hop, BusMessage::HandshakeResponse { correlation_id })
                {
                    warn!(bus = %bus.name(), error = %e, "Failed to answer handshake");
                    return;
                }
                bus.bridge.mark_ready(hop, link_id);
            }
            BusMessage::HandshakeResponse { correlation_id } => {
                self.resolve(hop, correlation_id, None);
            }
            BusMessage::NodeAnnouncementResponse {
                correlation_id,
                error,
            }
            | BusMessage::SubUpdateResponse {
                correlation_id,
                error,
            } => {
                self.resolve(hop, correlation_id, error);
            }
            BusMessage::NodeAnnouncement {
                correlation_id,
                announcements,
            } => {
                bus.routing
                    .handle_node_announcement(bus, hop, correlation_id, announcements);
            }
            BusMessage::SubUpdate {
                correlation_id,
                updates,
            } => {
                bus.routing.handle_sub_update(bus, hop, correlation_id, updates);
            }
            BusMessage::P2p(message) => bus.p2p.route(bus, hop, message),
            BusMessage::Broadcast(message) => bus.broadcast.dispatch_remote(bus, hop, message),
        }
    }
}
