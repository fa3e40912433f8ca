//! # Bridge Manager
//!
//! Owns the live links of one bus instance: at most one parent link and any
//! number of child links. Holds no routing semantics; it only moves raw
//! [`BusMessage`]s and reports link lifecycle as [`LinkEvent`]s.
//!
//! ## Link State Machine
//! `Connecting -> AwaitingHandshake -> Ready -> Dropped`
//!
//! The bridging side sends a handshake and waits for the response with a
//! fixed timeout; the bridged side answers and becomes ready at once.
//!
//! ## Task Structure
//! - **Read task**: pulls from the transport and emits `Message` events,
//!   then `ConnectionDropped` when the peer goes away.
//! - **Write task**: drains an unbounded outbound queue into the transport,
//!   so `send` never waits and per-link order is kept.
//!
//! Every attach gets a fresh link id. Events carry it so that a late drop of
//! a replaced link is recognised as stale.

use crate::error::{BusError, Result};
use crate::message::BusMessage;
use crate::protocol::ProtocolCoordinator;
use crate::transport::{LinkReader, LinkWriter, Transport};
use crate::types::{BusId, Hop};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Generation id of one attached link
pub type LinkId = u64;

/// Lifecycle state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    AwaitingHandshake,
    Ready,
    Dropped,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Connecting => f.write_str("connecting"),
            LinkState::AwaitingHandshake => f.write_str("awaiting-handshake"),
            LinkState::Ready => f.write_str("ready"),
            LinkState::Dropped => f.write_str("dropped"),
        }
    }
}

/// Snapshot of one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub hop: Hop,
    pub link_id: LinkId,
    pub state: LinkState,
}

/// Lifecycle and traffic of the links, in arrival order
#[derive(Debug)]
pub enum LinkEvent {
    Message {
        hop: Hop,
        link_id: LinkId,
        message: BusMessage,
    },
    ConnectionReady {
        hop: Hop,
        link_id: LinkId,
    },
    ConnectionDropped {
        hop: Hop,
        link_id: LinkId,
        error: Option<BusError>,
    },
}

struct BridgeEntry {
    link_id: LinkId,
    state: LinkState,
    outbound: mpsc::UnboundedSender<BusMessage>,
    read_task: JoinHandle<()>,
}

/// Live parent/child links of one bus instance
pub struct BridgeManager {
    bus_name: String,
    links: Mutex<HashMap<Hop, BridgeEntry>>,
    next_bus_id: AtomicU32,
    next_link_id: AtomicU64,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl BridgeManager {
    pub fn new(bus_name: impl Into<String>, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            bus_name: bus_name.into(),
            links: Mutex::new(HashMap::new()),
            next_bus_id: AtomicU32::new(1),
            next_link_id: AtomicU64::new(1),
            events,
        }
    }

    /// Attach a transport under `hop` and start its read/write tasks
    pub fn attach<T: Transport>(&self, hop: Hop, transport: T) -> Result<LinkId> {
        if hop.is_local() {
            return Err(BusError::LinkNotFound(hop));
        }

        let mut links = self.links.lock();
        if links.contains_key(&hop) {
            return Err(BusError::Rejected {
                hop,
                message: "link already attached".to_string(),
            });
        }

        let link_id = self.next_link_id.fetch_add(1, Ordering::SeqCst);
        let (writer, reader) = transport.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        debug!(bus = %self.bus_name, %hop, link_id, state = %LinkState::Connecting, "Attaching link");

        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            hop,
            link_id,
            self.events.clone(),
        ));
        let read_task = tokio::spawn(read_loop(reader, hop, link_id, self.events.clone()));

        links.insert(
            hop,
            BridgeEntry {
                link_id,
                state: LinkState::AwaitingHandshake,
                outbound,
                read_task,
            },
        );
        Ok(link_id)
    }

    /// Attach a child link, run the handshake and return its new bus id
    pub async fn bridge_child<T: Transport>(
        &self,
        transport: T,
        protocol: &ProtocolCoordinator,
        handshake_timeout: Duration,
    ) -> Result<BusId> {
        let bus_id = BusId(self.next_bus_id.fetch_add(1, Ordering::SeqCst));
        let hop = Hop::Child(bus_id);
        let link_id = self.attach(hop, transport)?;

        let handshake = protocol
            .send_request_and_wait_for_ack(self, hop, "handshake", handshake_timeout, |correlation_id| {
                BusMessage::Handshake { correlation_id }
            })
            .await;

        match handshake {
            Ok(()) => {
                self.mark_ready(hop, link_id);
                Ok(bus_id)
            }
            Err(e) => {
                warn!(bus = %self.bus_name, %hop, error = %e, "Bridge handshake failed; discarding link");
                self.remove(hop, Some(link_id));
                if e.is_timeout() {
                    Err(BusError::HandshakeTimeout {
                        bus_id,
                        timeout_ms: handshake_timeout.as_millis() as u64,
                    })
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Mark a link ready and emit `ConnectionReady`
    pub fn mark_ready(&self, hop: Hop, link_id: LinkId) -> bool {
        {
            let mut links = self.links.lock();
            match links.get_mut(&hop) {
                Some(entry) if entry.link_id == link_id => {
                    if entry.state == LinkState::Ready {
                        return false;
                    }
                    entry.state = LinkState::Ready;
                }
                _ => return false,
            }
        }

        info!(bus = %self.bus_name, %hop, link_id, "Link ready");
        let _ = self.events.send(LinkEvent::ConnectionReady { hop, link_id });
        true
    }

    /// Queue a message for `hop`
    pub fn send(&self, hop: Hop, message: BusMessage) -> Result<()> {
        let links = self.links.lock();
        let entry = links.get(&hop).ok_or(BusError::LinkNotFound(hop))?;
        trace!(bus = %self.bus_name, %hop, message = message.name(), "Queueing outbound message");
        entry.outbound.send(message).map_err(|_| BusError::LinkClosed {
            hop,
            reason: "write task ended".to_string(),
        })
    }

    /// Remove a link. With `link_id`, only if it is still the current one.
    ///
    /// Queued outbound messages are still flushed; the read side stops now.
    pub fn remove(&self, hop: Hop, link_id: Option<LinkId>) -> Option<LinkInfo> {
        let entry = {
            let mut links = self.links.lock();
            let is_target = links
                .get(&hop)
                .is_some_and(|entry| link_id.map_or(true, |id| id == entry.link_id));
            if !is_target {
                return None;
            }
            links.remove(&hop)
        }?;

        entry.read_task.abort();
        info!(bus = %self.bus_name, %hop, link_id = entry.link_id, from = %entry.state, "Link dropped");
        Some(LinkInfo {
            hop,
            link_id: entry.link_id,
            state: LinkState::Dropped,
        })
    }

    /// Drop every link
    pub fn close_all(&self) -> Vec<LinkInfo> {
        let hops: Vec<Hop> = self.links.lock().keys().copied().collect();
        hops.into_iter()
            .filter_map(|hop| self.remove(hop, None))
            .collect()
    }

    pub fn is_current(&self, hop: Hop, link_id: LinkId) -> bool {
        self.links
            .lock()
            .get(&hop)
            .is_some_and(|entry| entry.link_id == link_id)
    }

    pub fn is_ready(&self, hop: Hop) -> bool {
        self.state(hop) == Some(LinkState::Ready)
    }

    pub fn state(&self, hop: Hop) -> Option<LinkState> {
        self.links.lock().get(&hop).map(|entry| entry.state)
    }

    pub fn link_id(&self, hop: Hop) -> Option<LinkId> {
        self.links.lock().get(&hop).map(|entry| entry.link_id)
    }

    /// Ready child links
    pub fn children(&self) -> Vec<BusId> {
        let mut children: Vec<BusId> = self
            .links
            .lock()
            .iter()
            .filter(|(_, entry)| entry.state == LinkState::Ready)
            .filter_map(|(hop, _)| hop.child_id())
            .collect();
        children.sort();
        children
    }

    pub fn links(&self) -> Vec<LinkInfo> {
        let mut links: Vec<LinkInfo> = self
            .links
            .lock()
            .iter()
            .map(|(hop, entry)| LinkInfo {
                hop: *hop,
                link_id: entry.link_id,
                state: entry.state,
            })
            .collect();
        links.sort_by_key(|info| info.link_id);
        links
    }
}

async fn write_loop<W: LinkWriter>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<BusMessage>,
    hop: Hop,
    link_id: LinkId,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut write_count = 0u64;
    while let Some(message) = outbound.recv().await {
        if let Err(e) = writer.send(message).await {
            warn!(%hop, link_id, error = %e, "Link write failed");
            let _ = events.send(LinkEvent::ConnectionDropped {
                hop,
                link_id,
                error: Some(e),
            });
            return;
        }
        write_count += 1;
    }
    debug!(%hop, link_id, write_count, "Link write task ended");
}

async fn read_loop<R: LinkReader>(
    mut reader: R,
    hop: Hop,
    link_id: LinkId,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut read_count = 0u64;
    while let Some(message) = reader.recv().await {
        read_count += 1;
        if events
            .send(LinkEvent::Message {
                hop,
                link_id,
                message,
            })
            .is_err()
        {
            return;
        }
    }

    debug!(%hop, link_id, read_count, "Link read stream closed");
    let _ = events.send(LinkEvent::ConnectionDropped {
        hop,
        link_id,
        error: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn manager() -> (BridgeManager, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BridgeManager::new("test", tx), rx)
    }

    #[tokio::test]
    async fn test_inbound_messages_become_events() {
        let (bridge, mut events) = manager();
        let (ours, theirs) = MemoryTransport::pair();
        let link_id = bridge.attach(Hop::Parent, ours).unwrap();
        assert_eq!(bridge.state(Hop::Parent), Some(LinkState::AwaitingHandshake));

        let (mut peer_tx, _peer_rx) = theirs.split();
        peer_tx
            .send(BusMessage::Handshake { correlation_id: 3 })
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            LinkEvent::Message {
                hop,
                link_id: id,
                message,
            } => {
                assert_eq!(hop, Hop::Parent);
                assert_eq!(id, link_id);
                assert_eq!(message.correlation_id(), Some(3));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_close_emits_drop() {
        let (bridge, mut events) = manager();
        let (ours, theirs) = MemoryTransport::pair();
        let link_id = bridge.attach(Hop::Child(BusId(4)), ours).unwrap();
        drop(theirs);

        match events.recv().await.unwrap() {
            LinkEvent::ConnectionDropped { hop, link_id: id, .. } => {
                assert_eq!(hop, Hop::Child(BusId(4)));
                assert_eq!(id, link_id);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_removal_is_ignored() {
        let (bridge, _events) = manager();
        let (first, _keep_first) = MemoryTransport::pair();
        let old_id = bridge.attach(Hop::Parent, first).unwrap();
        assert!(bridge.remove(Hop::Parent, Some(old_id)).is_some());

        let (second, _keep_second) = MemoryTransport::pair();
        let new_id = bridge.attach(Hop::Parent, second).unwrap();
        assert_ne!(old_id, new_id);

        assert!(bridge.remove(Hop::Parent, Some(old_id)).is_none());
        assert!(bridge.is_current(Hop::Parent, new_id));
    }

    #[tokio::test]
    async fn test_mark_ready_emits_once() {
        let (bridge, mut events) = manager();
        let (ours, _theirs) = MemoryTransport::pair();
        let link_id = bridge.attach(Hop::Parent, ours).unwrap();

        assert!(bridge.mark_ready(Hop::Parent, link_id));
        assert!(!bridge.mark_ready(Hop::Parent, link_id));
        assert!(bridge.is_ready(Hop::Parent));
        assert!(matches!(
            events.recv().await.unwrap(),
            LinkEvent::ConnectionReady { hop: Hop::Parent, .. }
        ));
    }

    #[tokio::test]
    async fn test_send_without_link_fails() {
        let (bridge, _events) = manager();
        let err = bridge
            .send(Hop::Child(BusId(9)), BusMessage::Handshake { correlation_id: 1 })
            .unwrap_err();
        assert_eq!(err, BusError::LinkNotFound(Hop::Child(BusId(9))));
    }

    #[tokio::test]
    async fn test_handshake_timeout_discards_link() {
        let (bridge, _events) = manager();
        let protocol = ProtocolCoordinator::new();
        let (ours, _silent_peer) = MemoryTransport::pair();

        let err = bridge
            .bridge_child(ours, &protocol, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::HandshakeTimeout { timeout_ms: 20, .. }));
        assert!(bridge.links().is_empty());
    }
}
