//! Bus Error Types
//!
//! Error taxonomy for routing, control-message propagation and procedure
//! execution. Errors that cross a link travel as [`RemoteError`], a
//! wire-safe structured form that maps back onto the same variants.

use crate::types::{BusId, Hop, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main bus error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    /// Destination node is unreachable anywhere in the tree
    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: NodeId },

    /// Node is registered but has no procedure table for the call
    #[error("Procedure not ready on node {node_id}")]
    ProcedureNotReady { node_id: NodeId },

    /// Node has a procedure table but no entry for the path
    #[error("Procedure '{path}' not found on node {node_id}")]
    ProcedureNotFound { node_id: NodeId, path: String },

    /// Node is shutting down and refuses new asks
    #[error("Node {node_id} is closing")]
    NodeClosing { node_id: NodeId },

    /// Two paths claim the same node id
    #[error("Node id conflict: {node_id} already routed via {existing}")]
    NodeIdConflict { node_id: NodeId, existing: Hop },

    /// Child link did not answer the handshake in time
    #[error("Handshake timeout: bus {bus_id} did not respond within {timeout_ms}ms")]
    HandshakeTimeout { bus_id: BusId, timeout_ms: u64 },

    /// Correlated request was not acknowledged in time
    #[error("Request timeout: {operation} exceeded {timeout_ms}ms")]
    RequestTimeout { operation: String, timeout_ms: u64 },

    /// Producer pushed into a buffer whose consumer went away
    #[error("Buffer closed: {0}")]
    BufferClosed(String),

    /// No live link for the requested hop
    #[error("No link for hop {0}")]
    LinkNotFound(Hop),

    /// Link closed while a request was outstanding
    #[error("Link {hop} closed: {reason}")]
    LinkClosed { hop: Hop, reason: String },

    /// Peer refused a control message
    #[error("Rejected by {hop}: {message}")]
    Rejected { hop: Hop, message: String },

    /// Error raised by a procedure handler
    #[error("{name}: {message}")]
    Application {
        name: String,
        message: String,
        details: Option<serde_json::Value>,
    },

    /// Owning bus instance shut down
    #[error("Bus shut down")]
    Shutdown,

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Wire-safe structured error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl BusError {
    /// Create an application error from a handler failure
    pub fn application(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Application {
            name: name.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a request timeout error
    pub fn request_timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Stable name used on the wire
    pub fn name(&self) -> &str {
        match self {
            BusError::NodeNotFound { .. } => "NodeNotFound",
            BusError::ProcedureNotReady { .. } => "ProcedureNotReady",
            BusError::ProcedureNotFound { .. } => "ProcedureNotFound",
            BusError::NodeClosing { .. } => "NodeClosing",
            BusError::NodeIdConflict { .. } => "NodeIdConflict",
            BusError::HandshakeTimeout { .. } => "HandshakeTimeout",
            BusError::RequestTimeout { .. } => "RequestTimeout",
            BusError::BufferClosed(_) => "BufferClosed",
            BusError::LinkNotFound(_) => "LinkNotFound",
            BusError::LinkClosed { .. } => "LinkClosed",
            BusError::Rejected { .. } => "Rejected",
            BusError::Application { name, .. } => name,
            BusError::Shutdown => "Shutdown",
            BusError::Configuration { .. } => "Configuration",
        }
    }

    /// Check if the destination could not be reached at all
    pub fn is_not_found(&self) -> bool {
        matches!(self, BusError::NodeNotFound { .. })
    }

    /// Check if this is a timeout of any layer
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            BusError::HandshakeTimeout { .. } | BusError::RequestTimeout { .. }
        )
    }

    /// Serialize into the structured wire form
    pub fn to_remote(&self) -> RemoteError {
        let details = match self {
            BusError::NodeNotFound { node_id }
            | BusError::ProcedureNotReady { node_id }
            | BusError::NodeClosing { node_id } => {
                Some(serde_json::json!({ "nodeId": node_id.as_str() }))
            }
            BusError::ProcedureNotFound { node_id, path } => {
                Some(serde_json::json!({ "nodeId": node_id.as_str(), "path": path }))
            }
            BusError::NodeIdConflict { node_id, existing } => Some(serde_json::json!({
                "nodeId": node_id.as_str(),
                "existing": existing.to_string(),
            })),
            BusError::HandshakeTimeout { bus_id, timeout_ms } => {
                Some(serde_json::json!({ "busId": bus_id.0, "timeoutMs": timeout_ms }))
            }
            BusError::RequestTimeout {
                operation,
                timeout_ms,
            } => Some(serde_json::json!({ "operation": operation, "timeoutMs": timeout_ms })),
            BusError::BufferClosed(reason) => Some(serde_json::json!({ "reason": reason })),
            BusError::LinkNotFound(hop) => Some(serde_json::json!({ "hop": hop.to_string() })),
            BusError::LinkClosed { hop, reason } => {
                Some(serde_json::json!({ "hop": hop.to_string(), "reason": reason }))
            }
            BusError::Rejected { hop, message } => {
                Some(serde_json::json!({ "hop": hop.to_string(), "message": message }))
            }
            BusError::Configuration { message, field } => {
                Some(serde_json::json!({ "message": message, "field": field }))
            }
            BusError::Application { details, .. } => details.clone(),
            _ => None,
        };

        let message = match self {
            BusError::Application { message, .. } => message.clone(),
            other => other.to_string(),
        };

        RemoteError {
            name: self.name().to_string(),
            message,
            details,
        }
    }

    /// Rebuild a typed error from its wire form.
    ///
    /// Well-known names map back to their variants when the details they
    /// need are present; anything else stays an application error.
    pub fn from_remote(remote: RemoteError) -> Self {
        let details = remote.details.as_ref();
        let text = |key: &str| details.and_then(|d| d.get(key)).and_then(|v| v.as_str());
        let number = |key: &str| details.and_then(|d| d.get(key)).and_then(|v| v.as_u64());
        let node_id = text("nodeId").map(NodeId::from);
        let hop = |key: &str| text(key).and_then(parse_hop);

        let known = match remote.name.as_str() {
            "NodeNotFound" => node_id.map(|node_id| BusError::NodeNotFound { node_id }),
            "ProcedureNotReady" => node_id.map(|node_id| BusError::ProcedureNotReady { node_id }),
            "NodeClosing" => node_id.map(|node_id| BusError::NodeClosing { node_id }),
            "ProcedureNotFound" => node_id.map(|node_id| BusError::ProcedureNotFound {
                node_id,
                path: text("path").unwrap_or_default().to_string(),
            }),
            "NodeIdConflict" => node_id
                .zip(hop("existing"))
                .map(|(node_id, existing)| BusError::NodeIdConflict { node_id, existing }),
            "HandshakeTimeout" => number("busId")
                .and_then(|id| u32::try_from(id).ok())
                .zip(number("timeoutMs"))
                .map(|(id, timeout_ms)| BusError::HandshakeTimeout {
                    bus_id: BusId(id),
                    timeout_ms,
                }),
            "RequestTimeout" => text("operation")
                .zip(number("timeoutMs"))
                .map(|(operation, timeout_ms)| BusError::request_timeout(operation, timeout_ms)),
            "BufferClosed" => text("reason").map(|reason| BusError::BufferClosed(reason.to_string())),
            "LinkNotFound" => hop("hop").map(BusError::LinkNotFound),
            "LinkClosed" => hop("hop").zip(text("reason")).map(|(hop, reason)| BusError::LinkClosed {
                hop,
                reason: reason.to_string(),
            }),
            "Rejected" => hop("hop").zip(text("message")).map(|(hop, message)| BusError::Rejected {
                hop,
                message: message.to_string(),
            }),
            "Configuration" => text("message").map(|message| BusError::Configuration {
                message: message.to_string(),
                field: text("field").map(str::to_string),
            }),
            "Shutdown" => Some(BusError::Shutdown),
            _ => None,
        };

        known.unwrap_or(BusError::Application {
            name: remote.name,
            message: remote.message,
            details: remote.details,
        })
    }
}

/// Inverse of `Hop`'s display form
fn parse_hop(text: &str) -> Option<Hop> {
    match text {
        "local" => Some(Hop::Local),
        "parent" => Some(Hop::Parent),
        other => other
            .strip_prefix("child:")
            .and_then(|id| id.parse().ok())
            .map(|id| Hop::Child(BusId(id))),
    }
}

impl From<RemoteError> for BusError {
    fn from(remote: RemoteError) -> Self {
        BusError::from_remote(remote)
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::application("SerializationError", err.to_string())
    }
}
