//! RESP Protocol Implementation
//!
//! The client half of the Redis Serialization Protocol.
//!
//! ## Modules
//!
//! - `types`: Defines the `RespValue` enum and reply serialization
//! - `encoder`: Encodes outgoing commands
//! - `parser`: The `Decoder` contract and the incremental state-machine parser
//! - `scan`: A stateless rescanning parser behind the same contract
//!
//! ## Example
//!
//! ```
//! use respwire::protocol::{encode, new_decoder, Command, Decoder, DecoderKind, RespValue};
//! use respwire::protocol::parser::DecoderLimits;
//!
//! let request = encode(&Command::new("GET").arg("name")).unwrap();
//! assert_eq!(&request[..], b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n");
//!
//! let mut decoder = new_decoder(DecoderKind::Incremental, DecoderLimits::default());
//! let values: Vec<_> = decoder.feed(b"$4\r\nAriz\r\n").collect();
//! assert_eq!(values, vec![Ok(RespValue::bulk_string("Ariz"))]);
//! ```

pub mod encoder;
pub mod parser;
pub mod scan;
pub mod types;

// Re-export commonly used types for convenience
pub use encoder::{encode, Command, IntoArg};
pub use parser::{Decoder, DecoderLimits, ParseError, ParseResult, RespParser, Values};
pub use scan::ScanParser;
pub use types::RespValue;

use std::fmt;
use std::str::FromStr;

/// Selects a [`Decoder`] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecoderKind {
    /// [`RespParser`]: resumable, never rescans consumed bytes.
    #[default]
    Incremental,
    /// [`ScanParser`]: reparses a partial value once enough bytes arrive.
    Rescan,
}

impl fmt::Display for DecoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecoderKind::Incremental => write!(f, "incremental"),
            DecoderKind::Rescan => write!(f, "rescan"),
        }
    }
}

impl FromStr for DecoderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "incremental" => Ok(DecoderKind::Incremental),
            "rescan" => Ok(DecoderKind::Rescan),
            other => Err(format!("unknown decoder: {}", other)),
        }
    }
}

/// Builds the selected decoder behind the common interface.
pub fn new_decoder(kind: DecoderKind, limits: DecoderLimits) -> Box<dyn Decoder> {
    match kind {
        DecoderKind::Incremental => Box::new(RespParser::with_limits(limits)),
        DecoderKind::Rescan => Box::new(ScanParser::with_limits(limits)),
    }
}
