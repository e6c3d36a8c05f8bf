//! Client error taxonomy.
//!
//! Errors fall in two classes. `Encoding`, `Application`, `InvalidState` and
//! `Timeout` concern a single caller and leave the connection usable.
//! `Protocol`, `ConnectionLost` and `Io` are fatal: the reply stream can no
//! longer be matched to requests, so every outstanding caller fails.

use crate::protocol::ParseError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The outgoing command could not be encoded
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Malformed or unsynchronized input, or a reply-count mismatch
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered this command with an error reply
    #[error("{0}")]
    Application(String),

    /// EXEC returned null, or the transaction was discarded
    #[error("transaction aborted")]
    TransactionAborted,

    /// The connection closed or failed before a reply arrived
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The command is not allowed in the connection's current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// No reply within the configured response timeout
    #[error("timed out waiting for reply")]
    Timeout,

    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// True if this error class leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::ConnectionLost(_) | Error::Io(_)
        )
    }

    /// The leading error code of a server error reply (`ERR`, `WRONGTYPE`,
    /// `EXECABORT`, ...), if the message starts with one.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            Error::Application(msg) => msg
                .split_whitespace()
                .next()
                .filter(|code| code.chars().all(|c| c.is_ascii_uppercase())),
            _ => None,
        }
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
