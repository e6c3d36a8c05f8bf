//! MULTI/EXEC coordination.
//!
//! Between `MULTI` and `EXEC` the server answers every command with a
//! `QUEUED` status and defers the real results into the single array reply
//! of `EXEC`. The coordinator keeps each queued caller's completion handle
//! until that array arrives and then resolves them by position.
//!
//! ```text
//! MULTI        -> +OK
//! SET k v      -> +QUEUED       (caller 0 keeps waiting)
//! INCR n       -> +QUEUED       (caller 1 keeps waiting)
//! EXEC         -> *2 +OK :5     (caller 0 <- OK, caller 1 <- 5)
//! ```

use crate::connection::queue::Completion;
use crate::error::{Error, Result};
use crate::protocol::RespValue;
use tracing::{debug, trace, warn};

/// Where the connection is in a MULTI/EXEC exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Queuing,
    AwaitingExecResult,
}

/// A queued caller waiting for its positional EXEC result.
#[derive(Debug)]
struct Deferred {
    command: String,
    completion: Completion,
}

#[derive(Debug)]
pub struct TransactionCoordinator {
    state: TransactionState,
    /// Identifies the current transaction; acknowledgements for older ones
    /// are matched against it and ignored
    txn: u64,
    deferred: Vec<Deferred>,
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self {
            state: TransactionState::Idle,
            txn: 0,
            deferred: Vec::new(),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn txn(&self) -> u64 {
        self.txn
    }

    /// Number of commands queued in the current transaction.
    pub fn queued(&self) -> usize {
        self.deferred.len()
    }

    /// Enters `Queuing` for a `MULTI` being written. Returns the transaction id.
    pub fn begin(&mut self) -> Result<u64> {
        match self.state {
            TransactionState::Idle => {
                self.txn += 1;
                self.state = TransactionState::Queuing;
                self.deferred.clear();
                debug!(txn = self.txn, "Transaction started");
                Ok(self.txn)
            }
            TransactionState::Queuing => Err(Error::InvalidState(
                "MULTI calls can not be nested".to_string(),
            )),
            TransactionState::AwaitingExecResult => Err(Error::InvalidState(
                "previous transaction is still awaiting its EXEC result".to_string(),
            )),
        }
    }

    /// Records a caller for a command written while `Queuing`. Returns its slot.
    pub fn queue(&mut self, command: impl Into<String>, completion: Completion) -> Result<usize> {
        if self.state != TransactionState::Queuing {
            return Err(Error::InvalidState("no transaction is queuing".to_string()));
        }
        self.deferred.push(Deferred {
            command: command.into(),
            completion,
        });
        Ok(self.deferred.len() - 1)
    }

    /// Handles the immediate reply to a queued command.
    ///
    /// `QUEUED` is swallowed. Any other value, an error reply included, means
    /// the positional mapping of the EXEC result can no longer be trusted and
    /// is a protocol error.
    pub fn on_queued_reply(&mut self, txn: u64, slot: usize, value: RespValue) -> Result<()> {
        if value.is_status("QUEUED") {
            return Ok(());
        }
        if txn != self.txn || self.state == TransactionState::Idle {
            // Transaction already ended; its callers were resolved then.
            trace!(txn, "Ignoring reply for finished transaction");
            return Ok(());
        }

        let command = self
            .deferred
            .get(slot)
            .map(|d| d.command.as_str())
            .unwrap_or("?");
        warn!(command, reply = ?value, "Queued command was not acknowledged with QUEUED");
        Err(Error::Protocol(format!(
            "expected QUEUED for {} inside MULTI, got {:?}",
            command, value
        )))
    }

    /// Handles the reply to `MULTI`. An error reply ends the transaction.
    pub fn on_multi_reply(&mut self, txn: u64, value: &RespValue) {
        if let RespValue::Error(msg) = value {
            if txn == self.txn {
                warn!(error = %msg, "MULTI refused");
                self.finish(|| Error::TransactionAborted);
            }
        }
    }

    /// Moves to `AwaitingExecResult` for an `EXEC` being written.
    pub fn commit(&mut self) -> Result<u64> {
        if self.state != TransactionState::Queuing {
            return Err(Error::InvalidState("EXEC without MULTI".to_string()));
        }
        self.state = TransactionState::AwaitingExecResult;
        Ok(self.txn)
    }

    /// Ends the transaction for a `DISCARD` being written; every queued
    /// caller resolves with `TransactionAborted`.
    pub fn abort(&mut self) -> Result<()> {
        if self.state != TransactionState::Queuing {
            return Err(Error::InvalidState("DISCARD without MULTI".to_string()));
        }
        debug!(txn = self.txn, queued = self.deferred.len(), "Transaction discarded");
        self.finish(|| Error::TransactionAborted);
        Ok(())
    }

    /// Distributes the reply to `EXEC` among the queued callers and returns
    /// what the committing caller receives.
    ///
    /// A null array (WATCH conflict) or an error reply (e.g. `EXECABORT`)
    /// resolves every queued caller with `TransactionAborted`. An array whose
    /// length differs from the number of queued commands is a fatal
    /// protocol error.
    pub fn on_exec_reply(&mut self, txn: u64, value: RespValue) -> Result<Result<RespValue>> {
        if txn != self.txn || self.state != TransactionState::AwaitingExecResult {
            // MULTI was refused, so the server answers EXEC on its own.
            debug!(txn, "EXEC reply for a transaction that already ended");
            return Ok(into_result(value));
        }

        match value {
            RespValue::NullArray => {
                debug!(txn, "Transaction aborted by server");
                self.finish(|| Error::TransactionAborted);
                Ok(Err(Error::TransactionAborted))
            }
            RespValue::Error(msg) => {
                warn!(txn, error = %msg, "EXEC failed");
                self.finish(|| Error::TransactionAborted);
                Ok(Err(Error::Application(msg)))
            }
            RespValue::Array(results) => {
                if results.len() != self.deferred.len() {
                    return Err(Error::Protocol(format!(
                        "EXEC returned {} results for {} queued commands",
                        results.len(),
                        self.deferred.len()
                    )));
                }

                let deferred = std::mem::take(&mut self.deferred);
                for (deferred, result) in deferred.into_iter().zip(results.iter()) {
                    deferred.completion.complete(into_result(result.clone()));
                }
                self.state = TransactionState::Idle;
                debug!(txn, results = results.len(), "Transaction committed");
                Ok(Ok(RespValue::Array(results)))
            }
            other => Err(Error::Protocol(format!(
                "expected array reply to EXEC, got {:?}",
                other
            ))),
        }
    }

    /// Resolves every queued caller and returns to `Idle`.
    fn finish(&mut self, err: impl Fn() -> Error) {
        for deferred in self.deferred.drain(..) {
            deferred.completion.complete(Err(err()));
        }
        self.state = TransactionState::Idle;
    }

    /// Fails every queued caller on connection teardown.
    pub fn fail_all(&mut self, err: &Error) {
        self.finish(|| err.clone());
    }

    /// Forgets the transaction after `RESET`.
    pub fn reset(&mut self) {
        self.finish(|| Error::TransactionAborted);
    }
}

/// Maps an error reply to [`Error::Application`].
pub fn into_result(value: RespValue) -> Result<RespValue> {
    match value {
        RespValue::Error(msg) => Err(Error::Application(msg)),
        other => Ok(other),
    }
}
