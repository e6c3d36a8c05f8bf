//! Pending-request queue.
//!
//! RESP answers commands on one connection in exactly the order they were
//! written. The queue records each outstanding command at write time and
//! pairs replies with them purely by position, never by content.

use crate::connection::pubsub::PendingAcks;
use crate::error::{Error, Result};
use crate::protocol::RespValue;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::trace;

/// Receiving half of a completion handle.
pub type ReplyReceiver = oneshot::Receiver<Result<RespValue>>;

/// Resolves one caller exactly once.
///
/// `complete` consumes the handle, so a second resolution cannot be written.
/// A detached handle resolves nobody; it stands in for replies the engine
/// consumes internally (for example the `QUEUED` acknowledgement of a
/// command inside `MULTI`, whose real caller waits for `EXEC`).
#[derive(Debug)]
pub struct Completion {
    tx: Option<oneshot::Sender<Result<RespValue>>>,
}

impl Completion {
    pub fn channel() -> (Completion, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        (Completion { tx: Some(tx) }, rx)
    }

    pub fn detached() -> Completion {
        Completion { tx: None }
    }

    pub fn complete(self, result: Result<RespValue>) {
        if let Some(tx) = self.tx {
            if tx.send(result).is_err() {
                // Cancelled by the caller; the reply was still consumed.
                trace!("Reply receiver dropped before completion");
            }
        }
    }

    /// True once the caller has stopped waiting.
    pub fn is_cancelled(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.is_closed())
    }
}

/// What kind of reply the request at this position expects.
#[derive(Debug)]
pub enum Expect {
    /// An ordinary reply delivered as-is
    Reply,
    /// The reply to `MULTI`
    Multi { txn: u64 },
    /// The `QUEUED` acknowledgement of command `slot` inside transaction `txn`
    Queued { txn: u64, slot: usize },
    /// The reply to `EXEC`
    Exec { txn: u64 },
    /// The reply to `DISCARD`
    Discard,
    /// The reply to `RESET`
    Reset,
    /// Acknowledgements for a subscribe-family command, delivered as pushes
    Subscription(PendingAcks),
}

/// A command written to the transport whose reply has not arrived yet.
#[derive(Debug)]
pub struct PendingRequest {
    pub command: String,
    pub expect: Expect,
    pub completion: Completion,
}

impl PendingRequest {
    pub fn new(command: impl Into<String>, expect: Expect, completion: Completion) -> Self {
        Self {
            command: command.into(),
            expect,
            completion,
        }
    }

    pub fn is_subscription(&self) -> bool {
        matches!(self.expect, Expect::Subscription(_))
    }
}

/// FIFO of outstanding requests.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<PendingRequest>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, request: PendingRequest) {
        self.entries.push_back(request);
    }

    pub fn front(&self) -> Option<&PendingRequest> {
        self.entries.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut PendingRequest> {
        self.entries.front_mut()
    }

    /// Removes the oldest request. An empty queue means the server sent
    /// more replies than commands were written.
    pub fn pop(&mut self) -> Result<PendingRequest> {
        self.entries.pop_front().ok_or_else(|| {
            Error::Protocol("unexpected reply with no pending request".to_string())
        })
    }

    /// Pops the oldest request and resolves it with `result`.
    pub fn resolve_next(&mut self, result: Result<RespValue>) -> Result<()> {
        let request = self.pop()?;
        trace!(command = %request.command, "Resolving pending request");
        request.completion.complete(result);
        Ok(())
    }

    /// Fails every outstanding request with the same error. Returns how many
    /// were drained.
    pub fn drain(&mut self, err: &Error) -> usize {
        let count = self.entries.len();
        for request in self.entries.drain(..) {
            request.completion.complete(Err(err.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
