//! # Bus Core
//!
//! Hierarchical message bus. Bus instances form a tree of parent/child
//! links; each hosts addressable nodes that talk point-to-point (ask/tell)
//! or through topics (tell, and ask-all with streamed results).
//!
//! ## Components
//! - [`dispatcher`]: N-way value replication for fan-out
//! - [`routing`]: node routes, topic interest and upward propagation
//! - [`bridge`]: link lifecycle and raw message I/O
//! - [`protocol`]: inbound classification and request/ack correlation
//! - [`p2p`]: next-hop forwarding of point-to-point calls
//! - [`broadcast`] / [`session`]: topic fan-out and ask-all completion
//! - [`directory`]: locally hosted nodes and procedure execution
//!
//! ## Usage
//! ```no_run
//! use bus_core::{Bus, BusConfig, MemoryTransport, NodeOptions, ProcedureTable, Value};
//!
//! # async fn demo() -> bus_core::Result<()> {
//! let root = Bus::new(BusConfig::named("root"))?;
//! let (up, down) = MemoryTransport::pair();
//! let leaf = Bus::with_parent(BusConfig::named("leaf"), up)?;
//! root.bridge(down).await?;
//!
//! let worker = leaf.join(NodeOptions::new("worker")).await?;
//! worker
//!     .subscribe("jobs", ProcedureTable::new().with("run", |args: Vec<Value>| async move {
//!         Ok(args.into_iter().next().unwrap_or(Value::Null))
//!     }))
//!     .await?;
//!
//! let client = root.join(NodeOptions::new("client")).await?;
//! let results = client.topic("jobs").all("run", vec![Value::from(42)])?.collect_all().await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod broadcast;
pub mod bus;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod node;
pub mod p2p;
pub mod protocol;
pub mod routing;
pub mod session;
pub mod stream;
pub mod transport;
pub mod types;
pub mod value;

pub use bridge::{LinkEvent, LinkId, LinkInfo, LinkState};
pub use bus::Bus;
pub use config::BusConfig;
pub use directory::{ProcedureFuture, ProcedureTable};
pub use dispatcher::{CloneStrategy, DispatchContext, Dispatcher};
pub use error::{BusError, RemoteError, Result};
pub use node::{NodeHandle, NodeOptions, TopicPublisher};
pub use routing::RoutingTable;
pub use session::{AskAllStream, AskSession};
pub use stream::{stream_pair, ReadableStream, WritableStream};
pub use transport::{MemoryTransport, Transport};
pub use types::{BusId, CallId, CallKind, Hop, MessageSource, NodeId, Topic};
pub use value::{ArrayRef, ObjectRef, PinnedHandle, Value};
