//! Duplex Stream Handles
//!
//! The two sides of a duplex stream as they travel inside call arguments.
//! A [`WritableStream`] feeds chunks into a bounded `tokio::sync::mpsc`
//! channel and a [`ReadableStream`] pulls them out. Handles are cheap
//! clones of one shared endpoint; the dispatcher takes the endpoint out when
//! it builds fan-out or fan-in proxies.
//!
//! ## Termination
//! - The readable side ends (`None`) once every writer has closed.
//! - An `Err` chunk aborts the stream: it is delivered once, then the
//!   readable side is closed.
//! - Cancelling or dropping every readable handle makes writers fail with
//!   [`BusError::BufferClosed`].

use crate::error::{BusError, Result};
use crate::value::Value;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// One chunk as seen by the reader
pub type StreamItem = Result<Value>;

/// Default per-stream buffer
pub const DEFAULT_STREAM_CAPACITY: usize = 16;

/// Create a connected writable/readable pair
pub fn stream_pair(capacity: usize) -> (WritableStream, ReadableStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (WritableStream::from_sender(tx), ReadableStream::from_receiver(rx))
}

/// Readable side of a duplex stream
#[derive(Clone)]
pub struct ReadableStream {
    inner: Arc<ReadableInner>,
}

struct ReadableInner {
    rx: tokio::sync::Mutex<Option<mpsc::Receiver<StreamItem>>>,
    cancel_tx: watch::Sender<bool>,
}

impl ReadableStream {
    pub fn from_receiver(rx: mpsc::Receiver<StreamItem>) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ReadableInner {
                rx: tokio::sync::Mutex::new(Some(rx)),
                cancel_tx,
            }),
        }
    }

    /// A stream that is already finished
    pub fn closed() -> Self {
        let stream = Self::from_receiver(mpsc::channel(1).1);
        stream.cancel();
        stream
    }

    /// Receive the next chunk; `None` once the stream is over
    pub async fn recv(&self) -> Option<StreamItem> {
        let mut cancelled = self.inner.cancel_tx.subscribe();
        if *cancelled.borrow() {
            return None;
        }

        let mut guard = self.inner.rx.lock().await;
        let rx = guard.as_mut()?;

        tokio::select! {
            item = rx.recv() => match item {
                Some(Ok(chunk)) => Some(Ok(chunk)),
                Some(Err(e)) => {
                    *guard = None;
                    Some(Err(e))
                }
                None => {
                    *guard = None;
                    None
                }
            },
            _ = cancelled.wait_for(|c| *c) => {
                *guard = None;
                None
            }
        }
    }

    /// Stop consuming. Writers observe the closed buffer on their next send.
    pub fn cancel(&self) {
        self.inner.cancel_tx.send_replace(true);
        if let Ok(mut guard) = self.inner.rx.try_lock() {
            guard.take();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancel_tx.borrow()
    }

    /// Take the underlying source, leaving this handle finished
    pub(crate) fn take_source(&self) -> Option<mpsc::Receiver<StreamItem>> {
        if self.is_cancelled() {
            return None;
        }
        self.inner.rx.try_lock().ok()?.take()
    }

    /// Drain the stream into a vector, stopping at the first error
    pub async fn collect(&self) -> Result<Vec<Value>> {
        let mut chunks = Vec::new();
        while let Some(item) = self.recv().await {
            chunks.push(item?);
        }
        Ok(chunks)
    }

    pub fn ptr_eq(&self, other: &ReadableStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl fmt::Debug for ReadableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Readable@{:x}", self.identity())
    }
}

/// Writable side of a duplex stream
#[derive(Clone)]
pub struct WritableStream {
    inner: Arc<WritableInner>,
}

struct WritableInner {
    tx: Mutex<Option<mpsc::Sender<StreamItem>>>,
}

impl WritableStream {
    pub fn from_sender(tx: mpsc::Sender<StreamItem>) -> Self {
        Self {
            inner: Arc::new(WritableInner {
                tx: Mutex::new(Some(tx)),
            }),
        }
    }

    /// A writer whose sink is already gone
    pub fn closed() -> Self {
        Self {
            inner: Arc::new(WritableInner {
                tx: Mutex::new(None),
            }),
        }
    }

    /// Write one chunk, waiting for buffer space
    pub async fn send(&self, chunk: Value) -> Result<()> {
        let tx = self
            .inner
            .tx
            .lock()
            .clone()
            .ok_or_else(|| BusError::BufferClosed("writer already closed".to_string()))?;

        tx.send(Ok(chunk))
            .await
            .map_err(|_| BusError::BufferClosed("reader went away".to_string()))
    }

    /// Close this contributor. The sink ends once all contributors closed.
    pub fn close(&self) {
        self.inner.tx.lock().take();
    }

    /// Abort the sink with an error
    pub async fn abort(&self, error: BusError) {
        let tx = self.inner.tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(Err(error)).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        match self.inner.tx.lock().as_ref() {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }

    /// Take the underlying sink, leaving this handle closed
    pub(crate) fn take_sink(&self) -> Option<mpsc::Sender<StreamItem>> {
        self.inner.tx.lock().take()
    }

    pub fn ptr_eq(&self, other: &WritableStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl fmt::Debug for WritableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Writable@{:x}", self.identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order_then_ends() {
        let (writer, reader) = stream_pair(4);
        writer.send(Value::from(1)).await.unwrap();
        writer.send(Value::from(2)).await.unwrap();
        writer.close();

        let chunks = reader.collect().await.unwrap();
        assert_eq!(chunks, vec![Value::from(1), Value::from(2)]);
        assert!(reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_abort_is_delivered_once() {
        let (writer, reader) = stream_pair(4);
        writer.send(Value::from("a")).await.unwrap();
        writer.abort(BusError::application("Boom", "producer failed")).await;

        assert!(reader.recv().await.unwrap().is_ok());
        assert!(reader.recv().await.unwrap().is_err());
        assert!(reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_closes_buffer_for_writer() {
        let (writer, reader) = stream_pair(1);
        reader.cancel();

        let err = writer.send(Value::from(1)).await.unwrap_err();
        assert!(matches!(err, BusError::BufferClosed(_)));
        assert!(writer.is_closed());
    }
}
