//! Bus Wire Messages
//!
//! Every message that crosses a link between two bus instances. Control
//! requests (`Handshake`, `NodeAnnouncement`, `SubUpdate`) carry a
//! correlation id that the matching `*Response` echoes back. Data messages
//! (`P2p`, `Broadcast`) carry call ids that stay the same on every hop.
//!
//! Stream handles inside call arguments travel as live handles: a
//! [`Value::Readable`] or [`Value::Writable`] keeps its channel when the
//! transport moves the message. There is therefore no stream frame and no
//! stream category in [`MessageKind`]; chunks never pass through the
//! protocol coordinator.

use crate::error::RemoteError;
use crate::types::{CallId, CorrelationId, NodeId, Topic};
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Message exchanged over a link
#[derive(Debug, Clone)]
pub enum BusMessage {
    Handshake {
        correlation_id: CorrelationId,
    },
    HandshakeResponse {
        correlation_id: CorrelationId,
    },
    NodeAnnouncement {
        correlation_id: CorrelationId,
        announcements: Vec<NodeAnnouncement>,
    },
    NodeAnnouncementResponse {
        correlation_id: CorrelationId,
        error: Option<RemoteError>,
    },
    SubUpdate {
        correlation_id: CorrelationId,
        updates: Vec<SubscriptionUpdate>,
    },
    SubUpdateResponse {
        correlation_id: CorrelationId,
        error: Option<RemoteError>,
    },
    P2p(P2pMessage),
    Broadcast(BroadcastMessage),
}

/// Availability change of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    pub node_id: NodeId,
    pub is_available: bool,
}

/// Interest change of one topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    pub topic: Topic,
    pub is_subscribed: bool,
}

/// Point-to-point call or reply
#[derive(Debug, Clone)]
pub struct P2pMessage {
    pub source_id: NodeId,
    pub destination_id: NodeId,
    pub payload: P2pPayload,
}

#[derive(Debug, Clone)]
pub enum P2pPayload {
    Ask {
        call_id: CallId,
        path: String,
        args: Vec<Value>,
    },
    Tell {
        path: String,
        args: Vec<Value>,
    },
    /// One result of an ask or of one ask-all target
    AckResult {
        call_id: CallId,
        result: std::result::Result<Value, RemoteError>,
    },
    /// A branch of an ask-all finished after sending `total_results`
    AckFin {
        call_id: CallId,
        total_results: usize,
    },
}

/// Topic publication
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub source_id: NodeId,
    pub topic: Topic,
    pub loopback: Option<bool>,
    pub payload: BroadcastPayload,
}

#[derive(Debug, Clone)]
pub enum BroadcastPayload {
    Ask {
        call_id: CallId,
        path: String,
        args: Vec<Value>,
    },
    Tell {
        path: String,
        args: Vec<Value>,
    },
}

/// Semantic category of an inbound message. Streams have none; see the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    P2p,
    Broadcast,
    SubscriptionUpdate,
    NodeAnnouncement,
    Handshake,
    Response,
}

impl BusMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            BusMessage::Handshake { .. } => MessageKind::Handshake,
            BusMessage::NodeAnnouncement { .. } => MessageKind::NodeAnnouncement,
            BusMessage::SubUpdate { .. } => MessageKind::SubscriptionUpdate,
            BusMessage::P2p(_) => MessageKind::P2p,
            BusMessage::Broadcast(_) => MessageKind::Broadcast,
            BusMessage::HandshakeResponse { .. }
            | BusMessage::NodeAnnouncementResponse { .. }
            | BusMessage::SubUpdateResponse { .. } => MessageKind::Response,
        }
    }

    /// Correlation id of control requests and responses
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            BusMessage::Handshake { correlation_id }
            | BusMessage::HandshakeResponse { correlation_id }
            | BusMessage::NodeAnnouncement { correlation_id, .. }
            | BusMessage::NodeAnnouncementResponse { correlation_id, .. }
            | BusMessage::SubUpdate { correlation_id, .. }
            | BusMessage::SubUpdateResponse { correlation_id, .. } => Some(*correlation_id),
            BusMessage::P2p(_) | BusMessage::Broadcast(_) => None,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            BusMessage::Handshake { .. } => "handshake",
            BusMessage::HandshakeResponse { .. } => "handshake-response",
            BusMessage::NodeAnnouncement { .. } => "node-announcement",
            BusMessage::NodeAnnouncementResponse { .. } => "node-announcement-response",
            BusMessage::SubUpdate { .. } => "sub-update",
            BusMessage::SubUpdateResponse { .. } => "sub-update-response",
            BusMessage::P2p(m) => match m.payload {
                P2pPayload::Ask { .. } => "p2p-ask",
                P2pPayload::Tell { .. } => "p2p-tell",
                P2pPayload::AckResult { .. } => "p2p-ack-result",
                P2pPayload::AckFin { .. } => "p2p-ack-fin",
            },
            BusMessage::Broadcast(m) => match m.payload {
                BroadcastPayload::Ask { .. } => "broadcast-ask",
                BroadcastPayload::Tell { .. } => "broadcast-tell",
            },
        }
    }
}

impl P2pPayload {
    /// Call id for asks and acknowledgements; tells have none
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            P2pPayload::Ask { call_id, .. }
            | P2pPayload::AckResult { call_id, .. }
            | P2pPayload::AckFin { call_id, .. } => Some(*call_id),
            P2pPayload::Tell { .. } => None,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, P2pPayload::AckResult { .. } | P2pPayload::AckFin { .. })
    }
}

impl BroadcastPayload {
    pub fn path(&self) -> &str {
        match self {
            BroadcastPayload::Ask { path, .. } | BroadcastPayload::Tell { path, .. } => path,
        }
    }

    pub fn args(&self) -> &[Value] {
        match self {
            BroadcastPayload::Ask { args, .. } | BroadcastPayload::Tell { args, .. } => args,
        }
    }

    /// Same payload with a different argument list
    pub fn with_args(&self, args: Vec<Value>) -> Self {
        match self {
            BroadcastPayload::Ask { call_id, path, .. } => BroadcastPayload::Ask {
                call_id: *call_id,
                path: path.clone(),
                args,
            },
            BroadcastPayload::Tell { path, .. } => BroadcastPayload::Tell {
                path: path.clone(),
                args,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let ack = BusMessage::SubUpdateResponse {
            correlation_id: 9,
            error: None,
        };
        assert_eq!(ack.kind(), MessageKind::Response);
        assert_eq!(ack.correlation_id(), Some(9));

        let p2p = BusMessage::P2p(P2pMessage {
            source_id: NodeId::from("a"),
            destination_id: NodeId::from("b"),
            payload: P2pPayload::Tell {
                path: "ping".to_string(),
                args: vec![],
            },
        });
        assert_eq!(p2p.kind(), MessageKind::P2p);
        assert_eq!(p2p.correlation_id(), None);
        assert_eq!(p2p.name(), "p2p-tell");
    }

    #[test]
    fn test_with_args_keeps_call_id() {
        let call_id = CallId::new();
        let payload = BroadcastPayload::Ask {
            call_id,
            path: "price".to_string(),
            args: vec![Value::from(1)],
        };

        match payload.with_args(vec![Value::from(2)]) {
            BroadcastPayload::Ask { call_id: id, args, .. } => {
                assert_eq!(id, call_id);
                assert_eq!(args, vec![Value::from(2)]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_control_payloads_serialize() {
        let announcement = NodeAnnouncement {
            node_id: NodeId::from("n1"),
            is_available: true,
        };
        let json = serde_json::to_value(&announcement).unwrap();
        assert_eq!(json["node_id"], "n1");
        assert_eq!(json["is_available"], true);
    }

    #[tokio::test]
    async fn test_stream_handle_crosses_a_link_inside_its_call() {
        use crate::stream::stream_pair;
        use crate::transport::{LinkReader, LinkWriter, MemoryTransport, Transport};

        let (near, far) = MemoryTransport::pair();
        let (mut writer, _) = near.split();
        let (_, mut reader) = far.split();

        let (chunks, readable) = stream_pair(4);
        writer
            .send(BusMessage::P2p(P2pMessage {
                source_id: NodeId::from("a"),
                destination_id: NodeId::from("b"),
                payload: P2pPayload::Tell {
                    path: "upload".to_string(),
                    args: vec![Value::from(readable)],
                },
            }))
            .await
            .unwrap();

        let received = reader.recv().await.unwrap();
        assert_eq!(received.kind(), MessageKind::P2p);
        let BusMessage::P2p(P2pMessage {
            payload: P2pPayload::Tell { args, .. },
            ..
        }) = received
        else {
            panic!("unexpected message");
        };
        let Some(Value::Readable(stream)) = args.into_iter().next() else {
            panic!("stream argument lost");
        };

        chunks.send(Value::from("chunk")).await.unwrap();
        chunks.close();
        assert_eq!(stream.collect().await.unwrap(), vec![Value::from("chunk")]);
    }
}
