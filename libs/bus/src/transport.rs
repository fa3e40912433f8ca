//! Link Transport
//!
//! The narrow contract the bus needs from whatever carries messages between
//! two bus instances: an ordered, reliable duplex of [`BusMessage`]s that can
//! be split into a writer half and a reader half. Each half is driven by its
//! own task (see `bridge`).
//!
//! [`MemoryTransport`] connects two buses in the same process.

use crate::error::{BusError, Result};
use crate::message::BusMessage;
use crate::types::Hop;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Outbound half of a link
#[async_trait]
pub trait LinkWriter: Send + 'static {
    /// Send one message. An error means the link is gone.
    async fn send(&mut self, message: BusMessage) -> Result<()>;
}

/// Inbound half of a link
#[async_trait]
pub trait LinkReader: Send + 'static {
    /// Next message, or `None` once the peer closed the link
    async fn recv(&mut self) -> Option<BusMessage>;
}

/// Duplex link between two bus instances
pub trait Transport: Send + 'static {
    type Writer: LinkWriter;
    type Reader: LinkReader;

    fn split(self) -> (Self::Writer, Self::Reader);
}

/// In-process link backed by unbounded channels
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<BusMessage>,
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

pub struct MemoryWriter {
    tx: mpsc::UnboundedSender<BusMessage>,
}

pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl MemoryTransport {
    /// Two connected ends. Whatever one end sends, the other receives.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport { tx: a_tx, rx: b_rx },
            MemoryTransport { tx: b_tx, rx: a_rx },
        )
    }
}

impl Transport for MemoryTransport {
    type Writer = MemoryWriter;
    type Reader = MemoryReader;

    fn split(self) -> (MemoryWriter, MemoryReader) {
        (MemoryWriter { tx: self.tx }, MemoryReader { rx: self.rx })
    }
}

#[async_trait]
impl LinkWriter for MemoryWriter {
    async fn send(&mut self, message: BusMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| BusError::LinkClosed {
            hop: Hop::Local,
            reason: "peer dropped the in-memory link".to_string(),
        })
    }
}

#[async_trait]
impl LinkReader for MemoryReader {
    async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}
