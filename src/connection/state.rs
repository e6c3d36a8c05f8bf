//! Connection state machine.
//!
//! [`ConnectionCore`] owns everything that must change atomically with
//! respect to the wire: the decoder, the pending-request queue, the
//! subscription table and the transaction coordinator. It performs no I/O.
//! The write path calls [`ConnectionCore::issue`] to get the bytes to send
//! and the read path hands every received chunk to
//! [`ConnectionCore::receive`].
//!
//! ```text
//!   Connecting ──handshake──> Ready <──ack count──> SubscribedOnly
//!        │                      │                        │
//!        └──────────────────────┴────────────────────────┴──> Closed | Failed
//! ```
//!
//! Transactions are an orthogonal sub-state of `Ready`, tracked by the
//! [`TransactionCoordinator`].

use crate::connection::pubsub::{
    classify, AckAction, Classified, ListenerId, Message, PendingAcks, Push, SubscriptionKind,
    SubscriptionRouter,
};
use crate::connection::queue::{Completion, Expect, PendingQueue, PendingRequest, ReplyReceiver};
use crate::connection::transaction::{into_result, TransactionCoordinator, TransactionState};
use crate::error::{Error, Result};
use crate::protocol::{encode, Command, Decoder, RespValue};
use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Commands a connection in subscribed mode may issue.
const SUBSCRIBED_COMMANDS: &[&str] = &[
    "SUBSCRIBE",
    "UNSUBSCRIBE",
    "PSUBSCRIBE",
    "PUNSUBSCRIBE",
    "PING",
    "QUIT",
    "RESET",
];

/// Lifecycle of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is up, handshake not finished
    Connecting,
    Ready,
    /// At least one subscription is active
    SubscribedOnly,
    /// Closed by the local side
    Closed,
    /// Torn down by a protocol or transport error
    Failed(String),
}

impl ConnectionState {
    /// True for `Closed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::SubscribedOnly => write!(f, "subscribed"),
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Sans-IO protocol engine for one connection.
pub struct ConnectionCore {
    state: ConnectionState,
    decoder: Box<dyn Decoder>,
    pending: PendingQueue,
    router: SubscriptionRouter,
    transaction: TransactionCoordinator,
}

impl fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("buffered", &self.decoder.buffered())
            .field("transaction", &self.transaction.state())
            .finish()
    }
}

impl ConnectionCore {
    /// Creates a core in `Connecting`.
    pub fn new(decoder: Box<dyn Decoder>) -> Self {
        Self {
            state: ConnectionState::Connecting,
            decoder,
            pending: PendingQueue::new(),
            router: SubscriptionRouter::new(),
            transaction: TransactionCoordinator::new(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.transaction.state()
    }

    /// Number of requests written but not yet answered.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn router(&self) -> &SubscriptionRouter {
        &self.router
    }

    /// Completes the handshake.
    pub fn mark_ready(&mut self) -> Result<()> {
        match &self.state {
            ConnectionState::Connecting => {
                self.state = ConnectionState::Ready;
                debug!("Connection ready");
                Ok(())
            }
            other => Err(Error::InvalidState(format!(
                "cannot finish handshake while {}",
                other
            ))),
        }
    }

    /// Registers a user command and returns its wire bytes and reply handle.
    ///
    /// The bytes must be written to the transport in the same order `issue`
    /// is called, before any later call's bytes.
    pub fn issue(&mut self, command: &Command) -> Result<(Bytes, ReplyReceiver)> {
        if self.state == ConnectionState::Connecting {
            return Err(Error::InvalidState(
                "connection handshake has not completed".to_string(),
            ));
        }
        self.enqueue(command)
    }

    /// Registers a handshake command (`AUTH`, `SELECT`) while `Connecting`.
    pub fn issue_handshake(&mut self, command: &Command) -> Result<(Bytes, ReplyReceiver)> {
        if self.state != ConnectionState::Connecting {
            return Err(Error::InvalidState(format!(
                "handshake command while {}",
                self.state
            )));
        }
        self.enqueue(command)
    }

    /// Issues a subscribe-family command and registers `tx` as the listener
    /// for every name it carries. Returns the listener ids in name order.
    pub fn subscribe(
        &mut self,
        command: &Command,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Result<(Bytes, ReplyReceiver, Vec<ListenerId>)> {
        let name = command.name();
        let Some((AckAction::Subscribe, kind)) = AckAction::for_command(&name) else {
            return Err(Error::InvalidState(format!(
                "{} is not a subscribe command",
                name
            )));
        };

        let (bytes, rx) = self.issue(command)?;
        let ids = command
            .params()
            .iter()
            .map(|channel| self.router.register(kind, channel.clone(), tx.clone()))
            .collect();
        Ok((bytes, rx, ids))
    }

    /// Detaches one listener locally. No command is sent.
    pub fn unregister(&mut self, kind: SubscriptionKind, name: &[u8], id: ListenerId) {
        if self.router.unregister(kind, name, id) {
            trace!(name = %String::from_utf8_lossy(name), "Last local listener detached");
        }
    }

    fn enqueue(&mut self, command: &Command) -> Result<(Bytes, ReplyReceiver)> {
        match &self.state {
            ConnectionState::Closed => {
                return Err(Error::ConnectionLost("connection closed".to_string()))
            }
            ConnectionState::Failed(reason) => return Err(Error::ConnectionLost(reason.clone())),
            _ => {}
        }

        let name = command.name();
        if self.state == ConnectionState::SubscribedOnly
            && !SUBSCRIBED_COMMANDS.contains(&name.as_str())
        {
            return Err(Error::InvalidState(format!(
                "{} is not allowed while subscribed",
                name
            )));
        }

        // Encoding failures leave every piece of state untouched.
        let bytes = encode(command)?;
        let (completion, rx) = Completion::channel();
        let request = match self.transaction.state() {
            TransactionState::Queuing => self.expect_queuing(&name, completion)?,
            _ => self.expect_normal(command, &name, completion)?,
        };
        trace!(command = %name, pending = self.pending.len() + 1, "Command issued");
        self.pending.enqueue(request);
        Ok((bytes, rx))
    }

    /// Classifies a command written inside `MULTI`.
    fn expect_queuing(&mut self, name: &str, completion: Completion) -> Result<PendingRequest> {
        let expect = match name {
            "MULTI" => {
                return Err(Error::InvalidState(
                    "MULTI calls can not be nested".to_string(),
                ))
            }
            "EXEC" => Expect::Exec {
                txn: self.transaction.commit()?,
            },
            "DISCARD" => {
                self.transaction.abort()?;
                Expect::Discard
            }
            "RESET" => {
                // The server leaves MULTI on RESET, so later commands are not queued.
                self.transaction.reset();
                Expect::Reset
            }
            "WATCH" => {
                return Err(Error::InvalidState(
                    "WATCH inside MULTI is not allowed".to_string(),
                ))
            }
            _ if AckAction::for_command(name).is_some() => {
                return Err(Error::InvalidState(format!(
                    "{} inside MULTI is not allowed",
                    name
                )))
            }
            _ => {
                let txn = self.transaction.txn();
                let slot = self.transaction.queue(name, completion)?;
                return Ok(PendingRequest::new(
                    name,
                    Expect::Queued { txn, slot },
                    Completion::detached(),
                ));
            }
        };
        Ok(PendingRequest::new(name, expect, completion))
    }

    fn expect_normal(
        &mut self,
        command: &Command,
        name: &str,
        completion: Completion,
    ) -> Result<PendingRequest> {
        let expect = match name {
            "MULTI" => Expect::Multi {
                txn: self.transaction.begin()?,
            },
            "EXEC" => Expect::Exec {
                txn: self.transaction.commit()?,
            },
            "DISCARD" => {
                self.transaction.abort()?;
                Expect::Discard
            }
            "RESET" => Expect::Reset,
            _ => match AckAction::for_command(name) {
                Some((action, kind)) => Expect::Subscription(PendingAcks::new(
                    action,
                    kind,
                    command.params().len(),
                )),
                None => Expect::Reply,
            },
        };
        Ok(PendingRequest::new(name, expect, completion))
    }

    /// Feeds bytes read from the transport and routes every completed value.
    ///
    /// A decoding failure or an unmatched reply fails the connection and is
    /// returned; the stream cannot be resynchronized.
    pub fn receive(&mut self, chunk: &[u8]) -> Result<()> {
        if self.state.is_terminal() {
            trace!(bytes = chunk.len(), "Dropping bytes received after teardown");
            return Ok(());
        }

        self.decoder.extend(chunk);
        loop {
            let value = match self.decoder.next_value() {
                Ok(Some(value)) => value,
                Ok(None) => return Ok(()),
                Err(e) => {
                    let err = Error::from(e);
                    self.fail(err.to_string());
                    return Err(err);
                }
            };

            if let Err(err) = self.dispatch(value) {
                self.fail(err.to_string());
                return Err(err);
            }
            if self.state.is_terminal() {
                return Ok(());
            }
        }
    }

    /// A value is a push only while subscribed, or while the oldest
    /// outstanding request is itself a subscribe-family command.
    fn push_eligible(&self) -> bool {
        self.state == ConnectionState::SubscribedOnly
            || self.pending.front().is_some_and(PendingRequest::is_subscription)
    }

    fn dispatch(&mut self, value: RespValue) -> Result<()> {
        if !self.push_eligible() {
            return self.resolve(value);
        }
        match classify(value)? {
            Classified::Reply(value) => self.resolve(value),
            Classified::Push(Push::Message(message)) => {
                let delivered = self.router.dispatch(message);
                trace!(listeners = delivered, "Message routed");
                Ok(())
            }
            Classified::Push(Push::Ack {
                action,
                kind,
                name,
                count,
                reply,
            }) => {
                self.handle_ack(action, kind, name, count, reply);
                Ok(())
            }
        }
    }

    fn handle_ack(
        &mut self,
        action: AckAction,
        kind: SubscriptionKind,
        name: Option<Bytes>,
        count: i64,
        reply: RespValue,
    ) {
        self.router.apply_ack(action, kind, name.as_ref(), count);
        let none_confirmed = self.router.none_confirmed(kind);

        let complete = match self.pending.front_mut() {
            Some(PendingRequest {
                expect: Expect::Subscription(acks),
                ..
            }) if acks.matches(action, kind) => acks.record(name.is_none(), none_confirmed),
            _ => {
                debug!(?action, count, "Unsolicited subscription acknowledgement");
                false
            }
        };
        if complete {
            if let Ok(request) = self.pending.pop() {
                request.completion.complete(Ok(reply));
            }
        }

        match self.state {
            ConnectionState::Ready if count >= 1 => {
                debug!(count, "Entering subscribed mode");
                self.state = ConnectionState::SubscribedOnly;
            }
            ConnectionState::SubscribedOnly if count == 0 => {
                debug!("Leaving subscribed mode");
                self.state = ConnectionState::Ready;
            }
            _ => {}
        }
    }

    /// Pairs an ordinary reply with the oldest pending request.
    fn resolve(&mut self, value: RespValue) -> Result<()> {
        let request = self.pending.pop()?;
        trace!(command = %request.command, pending = self.pending.len(), "Reply received");

        match request.expect {
            Expect::Reply => {
                let quit = request.command == "QUIT" && value.is_status("OK");
                request.completion.complete(into_result(value));
                if quit {
                    self.close();
                }
            }
            Expect::Multi { txn } => {
                self.transaction.on_multi_reply(txn, &value);
                request.completion.complete(into_result(value));
            }
            Expect::Queued { txn, slot } => {
                self.transaction.on_queued_reply(txn, slot, value)?;
            }
            Expect::Exec { txn } => {
                match self.transaction.on_exec_reply(txn, value) {
                    Ok(outcome) => request.completion.complete(outcome),
                    Err(err) => {
                        // Already popped, so the teardown drain will not reach it.
                        request
                            .completion
                            .complete(Err(Error::ConnectionLost(err.to_string())));
                        return Err(err);
                    }
                }
            }
            Expect::Discard | Expect::Subscription(_) => {
                request.completion.complete(into_result(value));
            }
            Expect::Reset => {
                if !value.is_error() {
                    self.router.clear();
                    if self.state == ConnectionState::SubscribedOnly {
                        self.state = ConnectionState::Ready;
                    }
                }
                request.completion.complete(into_result(value));
            }
        }
        Ok(())
    }

    /// Tears the connection down after a protocol or transport error.
    /// Every outstanding caller receives `ConnectionLost`.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        let reason = reason.into();
        let drained = self.teardown(&Error::ConnectionLost(reason.clone()));
        warn!(reason = %reason, drained, "Connection failed");
        self.state = ConnectionState::Failed(reason);
    }

    /// Closes the connection locally.
    pub fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        let drained = self.teardown(&Error::ConnectionLost("connection closed".to_string()));
        info!(drained, "Connection closed");
        self.state = ConnectionState::Closed;
    }

    fn teardown(&mut self, err: &Error) -> usize {
        let drained = self.pending.drain(err);
        self.transaction.fail_all(err);
        self.router.clear();
        drained
    }
}
