//! Value Dispatcher - N-way Argument Replication
//!
//! Produces `count` independent copies of a value so that every fan-out
//! target receives its own argument. Plain data is deep-cloned; handle types
//! are replicated by pluggable [`CloneStrategy`] implementations that keep
//! one underlying resource instead of duplicating it.
//!
//! ## Resolution Order
//! 1. Identity seen-map: a container or handle already visited in this
//!    dispatch reuses its clone array, so aliasing and cycles are preserved
//!    across all copies.
//! 2. Registered strategies, in registration order, first match wins.
//! 3. Generic structural clone.
//!
//! ## Default Strategies
//! - [`PinnedShare`]: all copies are the same remote handle.
//! - [`ReadableFanOut`]: one source, N readable proxies. Each chunk is itself
//!   dispatched to the consumers still alive.
//! - [`WritableFanIn`]: N writable proxies, one sink. The sink ends when the
//!   last proxy closes and is aborted by any proxy.

use crate::stream::{ReadableStream, StreamItem, WritableStream, DEFAULT_STREAM_CAPACITY};
use crate::value::{ArrayRef, ObjectRef, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Replication strategy for one family of values
pub trait CloneStrategy: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    fn can_handle(&self, value: &Value) -> bool;

    /// Produce exactly `count` values
    fn replicate(&self, value: &Value, count: usize, ctx: &mut DispatchContext<'_>) -> Vec<Value>;
}

/// Ordered strategy registry with structural-clone fallback
#[derive(Clone, Default)]
pub struct Dispatcher {
    strategies: Vec<Arc<dyn CloneStrategy>>,
}

/// State carried through one dispatch call
pub struct DispatchContext<'a> {
    dispatcher: &'a Dispatcher,
    seen: HashMap<usize, Vec<Value>>,
}

impl Dispatcher {
    /// Dispatcher without any strategies
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher with the pinned/readable/writable strategies registered
    pub fn with_defaults() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(PinnedShare);
        dispatcher.register(ReadableFanOut::default());
        dispatcher.register(WritableFanIn);
        dispatcher
    }

    /// Append a strategy. Earlier registrations take precedence.
    pub fn register<S: CloneStrategy + 'static>(&mut self, strategy: S) {
        self.strategies.push(Arc::new(strategy));
    }

    /// Insert a strategy ahead of every existing one
    pub fn register_first<S: CloneStrategy + 'static>(&mut self, strategy: S) {
        self.strategies.insert(0, Arc::new(strategy));
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Produce `count` independent copies of `value`
    pub fn dispatch(&self, value: &Value, count: usize) -> Vec<Value> {
        if count == 0 {
            return Vec::new();
        }
        let mut ctx = DispatchContext {
            dispatcher: self,
            seen: HashMap::new(),
        };
        ctx.dispatch(value, count)
    }

    /// Replicate an argument list for `count` targets.
    ///
    /// Returns one argument vector per target. All arguments share one
    /// seen-map so aliasing between arguments is preserved per target.
    pub fn dispatch_args(&self, args: &[Value], count: usize) -> Vec<Vec<Value>> {
        if count == 0 {
            return Vec::new();
        }
        let mut ctx = DispatchContext {
            dispatcher: self,
            seen: HashMap::new(),
        };

        let mut per_target: Vec<Vec<Value>> = (0..count)
            .map(|_| Vec::with_capacity(args.len()))
            .collect();
        for arg in args {
            for (target, copy) in per_target.iter_mut().zip(ctx.dispatch(arg, count)) {
                target.push(copy);
            }
        }
        per_target
    }
}

impl<'a> DispatchContext<'a> {
    /// Recursive entry point for strategies that contain nested values
    pub fn dispatch(&mut self, value: &Value, count: usize) -> Vec<Value> {
        let identity = value.identity();
        if let Some(id) = identity {
            if let Some(copies) = self.seen.get(&id) {
                trace!("Reusing clone array for already visited value");
                return copies.clone();
            }
        }

        let dispatcher = self.dispatcher;
        if let Some(strategy) = dispatcher.strategies.iter().find(|s| s.can_handle(value)) {
            let copies = strategy.replicate(value, count, self);
            debug_assert_eq!(copies.len(), count, "strategy {} miscounted", strategy.name());
            if let Some(id) = identity {
                self.seen.insert(id, copies.clone());
            }
            return copies;
        }

        match (value, identity) {
            (Value::Array(source), Some(id)) => self.clone_array(id, source, count),
            (Value::Object(source), Some(id)) => self.clone_object(id, source, count),
            (other, _) => vec![other.clone(); count],
        }
    }

    /// Dispatcher driving this context
    pub fn dispatcher(&self) -> &Dispatcher {
        self.dispatcher
    }

    fn clone_array(&mut self, id: usize, source: &ArrayRef, count: usize) -> Vec<Value> {
        let copies: Vec<ArrayRef> = (0..count).map(|_| ArrayRef::new()).collect();
        let values: Vec<Value> = copies.iter().cloned().map(Value::Array).collect();
        self.seen.insert(id, values.clone());

        for item in source.snapshot() {
            for (copy, item_copy) in copies.iter().zip(self.dispatch(&item, count)) {
                copy.push(item_copy);
            }
        }
        values
    }

    fn clone_object(&mut self, id: usize, source: &ObjectRef, count: usize) -> Vec<Value> {
        let copies: Vec<ObjectRef> = (0..count).map(|_| ObjectRef::new()).collect();
        let values: Vec<Value> = copies.iter().cloned().map(Value::Object).collect();
        self.seen.insert(id, values.clone());

        for (key, field) in source.snapshot() {
            for (copy, field_copy) in copies.iter().zip(self.dispatch(&field, count)) {
                copy.insert(key.clone(), field_copy);
            }
        }
        values
    }
}

/// Remote references are shared, never duplicated
pub struct PinnedShare;

impl CloneStrategy for PinnedShare {
    fn name(&self) -> &'static str {
        "pinned"
    }

    fn can_handle(&self, value: &Value) -> bool {
        matches!(value, Value::Pinned(_))
    }

    fn replicate(&self, value: &Value, count: usize, _ctx: &mut DispatchContext<'_>) -> Vec<Value> {
        vec![value.clone(); count]
    }
}

/// Single producer, many consumers
pub struct ReadableFanOut {
    capacity: usize,
}

impl Default for ReadableFanOut {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_STREAM_CAPACITY,
        }
    }
}

impl ReadableFanOut {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }
}

impl CloneStrategy for ReadableFanOut {
    fn name(&self) -> &'static str {
        "readable-fan-out"
    }

    fn can_handle(&self, value: &Value) -> bool {
        matches!(value, Value::Readable(_))
    }

    fn replicate(&self, value: &Value, count: usize, ctx: &mut DispatchContext<'_>) -> Vec<Value> {
        let Value::Readable(stream) = value else {
            return vec![value.clone(); count];
        };

        let runtime = tokio::runtime::Handle::try_current();
        let source = match (stream.take_source(), runtime) {
            (Some(source), Ok(runtime)) => Some((source, runtime)),
            (Some(_), Err(_)) => {
                warn!("Readable fan-out requires a tokio runtime; handing out closed proxies");
                None
            }
            (None, _) => {
                debug!("Readable source already consumed; handing out closed proxies");
                None
            }
        };

        let Some((source, runtime)) = source else {
            return (0..count)
                .map(|_| Value::Readable(ReadableStream::closed()))
                .collect();
        };

        let mut senders = Vec::with_capacity(count);
        let mut proxies = Vec::with_capacity(count);
        for _ in 0..count {
            let (tx, rx) = mpsc::channel(self.capacity);
            senders.push(tx);
            proxies.push(Value::Readable(ReadableStream::from_receiver(rx)));
        }

        runtime.spawn(pump_fan_out(source, senders, ctx.dispatcher().clone()));
        proxies
    }
}

/// Pull from one source and hand each chunk to every live consumer
async fn pump_fan_out(
    mut source: mpsc::Receiver<StreamItem>,
    mut consumers: Vec<mpsc::Sender<StreamItem>>,
    dispatcher: Dispatcher,
) {
    loop {
        consumers.retain(|tx| !tx.is_closed());
        if consumers.is_empty() {
            debug!("All readable proxies cancelled; releasing source");
            break;
        }

        match source.recv().await {
            Some(Ok(chunk)) => {
                let copies = dispatcher.dispatch(&chunk, consumers.len());
                let mut alive = Vec::with_capacity(consumers.len());
                for (tx, copy) in consumers.into_iter().zip(copies) {
                    if tx.send(Ok(copy)).await.is_ok() {
                        alive.push(tx);
                    }
                }
                consumers = alive;
            }
            Some(Err(e)) => {
                for tx in &consumers {
                    let _ = tx.send(Err(e.clone())).await;
                }
                break;
            }
            None => break,
        }
    }
    trace!("Readable fan-out finished");
}

/// Many producers, single sink
pub struct WritableFanIn;

impl CloneStrategy for WritableFanIn {
    fn name(&self) -> &'static str {
        "writable-fan-in"
    }

    fn can_handle(&self, value: &Value) -> bool {
        matches!(value, Value::Writable(_))
    }

    fn replicate(&self, value: &Value, count: usize, _ctx: &mut DispatchContext<'_>) -> Vec<Value> {
        let Value::Writable(stream) = value else {
            return vec![value.clone(); count];
        };

        match stream.take_sink() {
            Some(sink) => (0..count)
                .map(|_| Value::Writable(WritableStream::from_sender(sink.clone())))
                .collect(),
            None => {
                debug!("Writable sink already consumed; handing out closed proxies");
                (0..count)
                    .map(|_| Value::Writable(WritableStream::closed()))
                    .collect()
            }
        }
    }
}
