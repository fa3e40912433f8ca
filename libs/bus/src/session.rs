//! # Ask Sessions
//!
//! Completion tracking for scatter-gather ("ask-all") calls.
//!
//! One [`AskSession`] exists per in-flight ask-all on every bus the call
//! passes through. It counts results per branch: the local branch (local
//! subscribers) and one entry per remote hop the call was forwarded to.
//! A session is complete once every branch has sent its fin and delivered at
//! least as many results as the fin announced.
//!
//! ## Result Delivery
//! - Local origin: results are pushed into the caller's [`AskAllStream`];
//!   completion closes the stream.
//! - Remote origin: each result is forwarded to the origin hop as an
//!   `ack_result`; completion sends one aggregate `ack_fin`.
//!
//! A dropped branch link counts as a fin with zero results. Dropping or
//! cancelling the stream removes the session at once.

use crate::error::{BusError, Result};
use crate::message::{BusMessage, P2pMessage, P2pPayload};
use crate::types::{CallId, Hop, MessageSource, NodeId};
use crate::value::Value;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchStatus {
    Pending,
    FinReceived,
}

/// Progress of one branch of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchProgress {
    pub status: BranchStatus,
    pub expected: usize,
    pub received: usize,
}

impl BranchProgress {
    fn pending(expected: usize) -> Self {
        Self {
            status: BranchStatus::Pending,
            expected,
            received: 0,
        }
    }

    fn finished() -> Self {
        Self {
            status: BranchStatus::FinReceived,
            expected: 0,
            received: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == BranchStatus::FinReceived && self.received >= self.expected
    }
}

/// Completion state of one ask-all call on this bus
#[derive(Debug, Clone)]
pub struct AskSession {
    call_id: CallId,
    origin: MessageSource,
    local: BranchProgress,
    downstream: HashMap<Hop, BranchProgress>,
}

impl AskSession {
    pub fn new(call_id: CallId, origin: MessageSource, local_targets: usize, remote: &[Hop]) -> Self {
        let local = if local_targets == 0 {
            BranchProgress::finished()
        } else {
            BranchProgress::pending(local_targets)
        };
        let downstream = remote
            .iter()
            .filter(|hop| hop.is_remote())
            .map(|hop| (*hop, BranchProgress::pending(0)))
            .collect();

        Self {
            call_id,
            origin,
            local,
            downstream,
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn origin(&self) -> MessageSource {
        self.origin
    }

    /// Progress of a branch; `Hop::Local` is the local branch
    pub fn branch(&self, hop: Hop) -> Option<&BranchProgress> {
        match hop {
            Hop::Local => Some(&self.local),
            remote => self.downstream.get(&remote),
        }
    }

    fn branch_mut(&mut self, hop: Hop) -> Option<&mut BranchProgress> {
        match hop {
            Hop::Local => Some(&mut self.local),
            remote => self.downstream.get_mut(&remote),
        }
    }

    /// Count one result from a branch. `false` if the branch is unknown.
    pub fn record_result(&mut self, branch: Hop) -> bool {
        match self.branch_mut(branch) {
            Some(progress) => {
                progress.received += 1;
                true
            }
            None => false,
        }
    }

    /// Mark a branch finished. Remote branches announce their total; the
    /// local branch keeps the target count it was created with.
    pub fn record_fin(&mut self, branch: Hop, total: Option<usize>) -> bool {
        match self.branch_mut(branch) {
            Some(progress) => {
                progress.status = BranchStatus::FinReceived;
                if let Some(total) = total {
                    progress.expected = total;
                }
                true
            }
            None => false,
        }
    }

    /// Treat a dropped branch as finished with zero results
    pub fn branch_dropped(&mut self, hop: Hop) -> bool {
        match self.downstream.get_mut(&hop) {
            Some(progress) if progress.status == BranchStatus::Pending => {
                progress.status = BranchStatus::FinReceived;
                progress.expected = 0;
                true
            }
            _ => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.local.is_done() && self.downstream.values().all(BranchProgress::is_done)
    }

    pub fn total_received(&self) -> usize {
        self.local.received + self.downstream.values().map(|b| b.received).sum::<usize>()
    }
}

/// Where a session's results go
pub(crate) enum ResultSink {
    Local(mpsc::UnboundedSender<Result<Value>>),
    Remote {
        hop: Hop,
        reply_to: NodeId,
        fin_source: NodeId,
    },
}

struct SessionEntry {
    session: AskSession,
    sink: ResultSink,
}

/// Message to send once the session lock is released
pub(crate) type Outbound = (Hop, BusMessage);

/// Active sessions of one bus instance
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<CallId, SessionEntry>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn contains(&self, call_id: &CallId) -> bool {
        self.sessions.lock().contains_key(call_id)
    }

    /// Progress snapshot of a session
    pub fn get(&self, call_id: &CallId) -> Option<AskSession> {
        self.sessions
            .lock()
            .get(call_id)
            .map(|entry| entry.session.clone())
    }

    pub(crate) fn open(&self, session: AskSession, sink: ResultSink) {
        debug!(call_id = %session.call_id, origin = %session.origin, branches = session.downstream.len(), "Ask session opened");
        self.sessions
            .lock()
            .insert(session.call_id, SessionEntry { session, sink });
    }

    /// Record one result and deliver it toward the origin
    pub(crate) fn record_result(
        &self,
        call_id: CallId,
        branch: Hop,
        responder: NodeId,
        result: Result<Value>,
    ) -> Vec<Outbound> {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(&call_id) else {
            trace!(%call_id, %branch, "Result for a closed session");
            return Vec::new();
        };
        if !entry.session.record_result(branch) {
            warn!(%call_id, %branch, "Result from a hop outside the session");
            return Vec::new();
        }

        let mut outbound = Vec::new();
        match &entry.sink {
            ResultSink::Local(results) => {
                let _ = results.send(result);
            }
            ResultSink::Remote { hop, reply_to, .. } => outbound.push((
                *hop,
                BusMessage::P2p(P2pMessage {
                    source_id: responder,
                    destination_id: reply_to.clone(),
                    payload: P2pPayload::AckResult {
                        call_id,
                        result: result.map_err(|e| e.to_remote()),
                    },
                }),
            )),
        }

        outbound.extend(complete_if_done(&mut sessions, call_id));
        outbound
    }

    /// Record a branch fin
    pub(crate) fn record_fin(&self, call_id: CallId, branch: Hop, total: Option<usize>) -> Vec<Outbound> {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(&call_id) else {
            trace!(%call_id, %branch, "Fin for a closed session");
            return Vec::new();
        };
        if !entry.session.record_fin(branch, total) {
            warn!(%call_id, %branch, "Fin from a hop outside the session");
            return Vec::new();
        }
        complete_if_done(&mut sessions, call_id)
    }

    /// Unblock every session waiting on `hop`, tear down those originating there
    pub(crate) fn link_dropped(&self, hop: Hop) -> Vec<Outbound> {
        let mut sessions = self.sessions.lock();

        let orphaned: Vec<CallId> = sessions
            .iter()
            .filter(|(_, entry)| entry.session.origin == hop)
            .map(|(call_id, _)| *call_id)
            .collect();
        for call_id in orphaned {
            sessions.remove(&call_id);
            debug!(%call_id, %hop, "Origin link dropped; session torn down");
        }

        let unblocked: Vec<CallId> = sessions
            .iter_mut()
            .filter_map(|(call_id, entry)| entry.session.branch_dropped(hop).then_some(*call_id))
            .collect();

        let mut outbound = Vec::new();
        for call_id in unblocked {
            debug!(%call_id, %hop, "Branch link dropped; counting it as finished");
            outbound.extend(complete_if_done(&mut sessions, call_id));
        }
        outbound
    }

    /// Remove a session on behalf of its consumer
    pub fn cancel(&self, call_id: &CallId) -> bool {
        let removed = self.sessions.lock().remove(call_id).is_some();
        if removed {
            debug!(%call_id, "Ask session cancelled by consumer");
        }
        removed
    }

    /// Terminate every session; local callers see `Shutdown`
    pub(crate) fn shutdown(&self) {
        let drained: Vec<SessionEntry> = self.sessions.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            if let ResultSink::Local(results) = entry.sink {
                let _ = results.send(Err(BusError::Shutdown));
            }
        }
    }
}

fn complete_if_done(sessions: &mut HashMap<CallId, SessionEntry>, call_id: CallId) -> Vec<Outbound> {
    let done = sessions
        .get(&call_id)
        .is_some_and(|entry| entry.session.is_complete());
    if !done {
        return Vec::new();
    }
    let Some(entry) = sessions.remove(&call_id) else {
        return Vec::new();
    };

    let total_results = entry.session.total_received();
    debug!(%call_id, total_results, "Ask session complete");
    match entry.sink {
        // Dropping the sender closes the caller's stream
        ResultSink::Local(_) => Vec::new(),
        ResultSink::Remote {
            hop,
            reply_to,
            fin_source,
        } => vec![(
            hop,
            BusMessage::P2p(P2pMessage {
                source_id: fin_source,
                destination_id: reply_to,
                payload: P2pPayload::AckFin {
                    call_id,
                    total_results,
                },
            }),
        )],
    }
}

/// Caller-facing results of an ask-all.
///
/// Yields one item per responding target, in arrival order, then ends.
/// Dropping it early cancels the session.
pub struct AskAllStream {
    call_id: CallId,
    results: mpsc::UnboundedReceiver<Result<Value>>,
    sessions: Option<Arc<SessionTable>>,
}

impl AskAllStream {
    pub(crate) fn new(
        call_id: CallId,
        results: mpsc::UnboundedReceiver<Result<Value>>,
        sessions: Arc<SessionTable>,
    ) -> Self {
        Self {
            call_id,
            results,
            sessions: Some(sessions),
        }
    }

    /// A stream with no targets; it ends immediately
    pub(crate) fn empty(call_id: CallId) -> Self {
        let (_, results) = mpsc::unbounded_channel();
        Self {
            call_id,
            results,
            sessions: None,
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Next result, or `None` once every target has answered
    pub async fn recv(&mut self) -> Option<Result<Value>> {
        self.results.recv().await
    }

    /// Wait for every result
    pub async fn collect_all(mut self) -> Vec<Result<Value>> {
        let mut results = Vec::new();
        while let Some(result) = self.results.recv().await {
            results.push(result);
        }
        results
    }

    /// Stop waiting. The session is removed now; late results are discarded.
    pub fn cancel(&mut self) {
        if let Some(sessions) = self.sessions.take() {
            sessions.cancel(&self.call_id);
        }
        self.results.close();
    }
}

impl Stream for AskAllStream {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.results.poll_recv(cx)
    }
}

impl Drop for AskAllStream {
    fn drop(&mut self) {
        if let Some(sessions) = self.sessions.take() {
            sessions.cancel(&self.call_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BusId;
    use futures::StreamExt;

    const LEFT: Hop = Hop::Child(BusId(1));
    const RIGHT: Hop = Hop::Child(BusId(2));

    #[test]
    fn test_completion_needs_every_branch() {
        let mut session = AskSession::new(CallId::new(), Hop::Local, 2, &[LEFT, RIGHT]);

        for _ in 0..3 {
            assert!(session.record_result(LEFT));
        }
        assert!(session.record_result(Hop::Local));
        assert!(session.record_result(Hop::Local));
        assert!(session.record_fin(Hop::Local, None));
        assert!(session.record_fin(RIGHT, Some(0)));
        assert!(!session.is_complete(), "left branch has not sent its fin");

        assert!(session.record_fin(LEFT, Some(3)));
        assert!(session.is_complete());
        assert_eq!(session.total_received(), 5);
    }

    #[test]
    fn test_fin_before_results_waits_for_them() {
        let mut session = AskSession::new(CallId::new(), Hop::Parent, 0, &[LEFT]);
        session.record_fin(LEFT, Some(2));
        assert!(!session.is_complete());
        session.record_result(LEFT);
        session.record_result(LEFT);
        assert!(session.is_complete());
    }

    #[test]
    fn test_dropped_branch_counts_as_empty_fin() {
        let mut session = AskSession::new(CallId::new(), Hop::Local, 0, &[LEFT, RIGHT]);
        session.record_fin(RIGHT, Some(0));
        assert!(!session.is_complete());

        assert!(session.branch_dropped(LEFT));
        assert!(!session.branch_dropped(LEFT));
        assert!(session.is_complete());
        assert_eq!(session.total_received(), 0);
    }

    #[test]
    fn test_unknown_branch_is_rejected() {
        let mut session = AskSession::new(CallId::new(), Hop::Local, 1, &[LEFT]);
        assert!(!session.record_result(RIGHT));
        assert!(!session.record_fin(Hop::Parent, Some(1)));
    }

    #[tokio::test]
    async fn test_local_origin_streams_then_closes() {
        let table = Arc::new(SessionTable::new());
        let call_id = CallId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        table.open(AskSession::new(call_id, Hop::Local, 1, &[LEFT]), ResultSink::Local(tx));
        let mut stream = AskAllStream::new(call_id, rx, table.clone());

        let responder = NodeId::from("n1");
        assert!(table
            .record_result(call_id, LEFT, responder.clone(), Ok(Value::from(1)))
            .is_empty());
        table.record_result(call_id, Hop::Local, responder, Ok(Value::from(2)));
        table.record_fin(call_id, Hop::Local, None);
        assert_eq!(table.len(), 1);
        table.record_fin(call_id, LEFT, Some(1));
        assert!(table.is_empty(), "completion removes the session");

        assert_eq!(stream.next().await.unwrap().unwrap(), Value::from(1));
        assert_eq!(stream.next().await.unwrap().unwrap(), Value::from(2));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_remote_origin_forwards_results_and_one_fin() {
        let table = SessionTable::new();
        let call_id = CallId::new();
        table.open(
            AskSession::new(call_id, Hop::Parent, 1, &[LEFT]),
            ResultSink::Remote {
                hop: Hop::Parent,
                reply_to: NodeId::from("caller"),
                fin_source: NodeId::from("bus-b"),
            },
        );

        let out = table.record_result(call_id, Hop::Local, NodeId::from("n1"), Ok(Value::from(7)));
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0],
            (Hop::Parent, BusMessage::P2p(P2pMessage { payload: P2pPayload::AckResult { .. }, .. }))
        ));

        assert!(table.record_fin(call_id, Hop::Local, None).is_empty());
        let out = table.link_dropped(LEFT);
        assert_eq!(out.len(), 1);
        match &out[0] {
            (Hop::Parent, BusMessage::P2p(P2pMessage { destination_id, payload: P2pPayload::AckFin { total_results, .. }, .. })) => {
                assert_eq!(destination_id.as_str(), "caller");
                assert_eq!(*total_results, 1);
            }
            other => panic!("unexpected outbound {other:?}"),
        }
        assert!(table.record_fin(call_id, LEFT, Some(0)).is_empty(), "completion is reported once");
    }

    #[tokio::test]
    async fn test_origin_drop_tears_down_session() {
        let table = SessionTable::new();
        let call_id = CallId::new();
        table.open(
            AskSession::new(call_id, Hop::Parent, 0, &[LEFT]),
            ResultSink::Remote {
                hop: Hop::Parent,
                reply_to: NodeId::from("caller"),
                fin_source: NodeId::from("bus-b"),
            },
        );

        assert!(table.link_dropped(Hop::Parent).is_empty());
        assert!(!table.contains(&call_id));
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_session() {
        let table = Arc::new(SessionTable::new());
        let call_id = CallId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        table.open(AskSession::new(call_id, Hop::Local, 0, &[LEFT]), ResultSink::Local(tx));

        let stream = AskAllStream::new(call_id, rx, table.clone());
        assert!(table.contains(&call_id));
        drop(stream);
        assert!(!table.contains(&call_id));
    }

    #[tokio::test]
    async fn test_shutdown_errors_local_streams() {
        let table = Arc::new(SessionTable::new());
        let call_id = CallId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        table.open(AskSession::new(call_id, Hop::Local, 1, &[]), ResultSink::Local(tx));
        let stream = AskAllStream::new(call_id, rx, table.clone());

        table.shutdown();
        let results = stream.collect_all().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], Err(BusError::Shutdown));
    }
}
