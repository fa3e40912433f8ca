//! Bus Identifier Types
//!
//! Node ids and topics are opaque strings; bus ids are integers that are
//! only unique among the direct children of one bus instance. A [`Hop`]
//! says how to reach something from here, and doubles as the source of an
//! inbound message.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Globally unique identifier of a logical node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Publish/subscribe topic name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    pub fn new(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(topic: &str) -> Self {
        Self(topic.to_string())
    }
}

impl From<String> for Topic {
    fn from(topic: String) -> Self {
        Self(topic)
    }
}

/// Identifier of a child link, assigned by the parent when bridging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusId(pub u32);

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus-{}", self.0)
    }
}

/// Direction used to reach a destination from this bus instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Hop {
    /// Hosted on this instance
    Local,
    /// Through the parent link
    Parent,
    /// Through the child link with this id
    Child(BusId),
}

/// Origin of an inbound message. `Local` means a node hosted here.
pub type MessageSource = Hop;

impl Hop {
    pub fn is_local(&self) -> bool {
        matches!(self, Hop::Local)
    }

    pub fn is_remote(&self) -> bool {
        !self.is_local()
    }

    pub fn child_id(&self) -> Option<BusId> {
        match self {
            Hop::Child(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hop::Local => f.write_str("local"),
            Hop::Parent => f.write_str("parent"),
            Hop::Child(id) => write!(f, "child:{}", id.0),
        }
    }
}

/// Correlation id of one P2P or broadcast call, unique across the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0.simple())
    }
}

/// Correlation id of a control request, unique per sending bus
pub type CorrelationId = u64;

/// Request/response versus fire-and-forget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    Ask,
    Tell,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKind::Ask => f.write_str("ask"),
            CallKind::Tell => f.write_str("tell"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_hop_is_a_structural_key() {
        let mut hops = HashSet::new();
        hops.insert(Hop::Child(BusId(1)));
        hops.insert(Hop::Child(BusId(1)));
        hops.insert(Hop::Child(BusId(2)));
        hops.insert(Hop::Parent);

        assert_eq!(hops.len(), 3);
        assert!(hops.contains(&Hop::Child(BusId(2))));
    }

    #[test]
    fn test_display_forms() {
        assert_eq!(Hop::Child(BusId(7)).to_string(), "child:7");
        assert_eq!(Hop::Parent.to_string(), "parent");
        assert!(CallId::new().to_string().starts_with("call-"));
        assert_ne!(CallId::new(), CallId::new());
    }
}
