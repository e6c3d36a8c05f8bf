//! # respwire - A Pipelined RESP Client Engine
//!
//! respwire speaks the client half of the Redis Serialization Protocol over
//! one persistent connection. Many tasks can issue commands at once; replies
//! are matched to callers purely by order, the way RESP guarantees them.
//!
//! ## Features
//!
//! - **Incremental Decoding**: Values are rebuilt from arbitrarily fragmented
//!   reads, with two interchangeable decoders behind one trait
//! - **Pipelining**: Issuing a command never waits for earlier replies
//! - **Pub/Sub**: Push messages are routed to channel and pattern listeners
//! - **Transactions**: `QUEUED` acknowledgements are absorbed and `EXEC`
//!   results are handed back to each queued caller by position
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              respwire                                   │
//! │                                                                         │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐   │
//! │  │   Client    │───>│              ConnectionCore                  │   │
//! │  │ (callers)   │    │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ │   │
//! │  └─────────────┘    │  │Pending │ │Subscr. │ │ Txn    │ │Decoder │ │   │
//! │        │            │  │ Queue  │ │ Router │ │ Coord. │ │        │ │   │
//! │        │ encode     │  └────────┘ └────────┘ └────────┘ └────────┘ │   │
//! │        ▼            └──────────────────────────────────────────────┘   │
//! │  ┌─────────────┐                          ▲                             │
//! │  │ Writer task │──> transport ──> Reader task (receive)                 │
//! │  └─────────────┘                                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use respwire::{Client, ClientConfig, Command};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> respwire::Result<()> {
//!     let client = Client::connect(ClientConfig::default()).await?;
//!     client.issue(Command::new("SET").arg("name").arg("Ariz")).await?;
//!
//!     let listener = Client::connect(ClientConfig::default()).await?;
//!     let mut news = listener.subscribe(["news"]).await?;
//!     client.issue(Command::new("PUBLISH").arg("news").arg("hello")).await?;
//!     if let Some(message) = news.next().await {
//!         println!("{}", message);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP values, command encoding and the decoders
//! - [`connection`]: The connection state machine and its transport driver
//! - [`client`]: The async API callers use
//! - [`config`]: Connection settings
//! - [`error`]: The error taxonomy
//!
//! ## Design Highlights
//!
//! ### One Ordering Discipline
//!
//! The pending queue, subscription table and transaction state live in a
//! single `ConnectionCore` behind one mutex. Encoding, enqueueing and
//! handing the frame to the writer happen under that lock, so a reply can
//! never be resolved before its request was recorded.
//!
//! ### Fatal vs Local Errors
//!
//! Server error replies and encoding mistakes only affect one caller.
//! Anything that desynchronizes the stream fails the connection and every
//! outstanding caller with it.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;

// Re-export commonly used types for convenience
pub use client::{Client, Reply, Subscription, Transaction};
pub use config::ClientConfig;
pub use connection::{ConnectionState, Message};
pub use error::{Error, Result};
pub use protocol::{Command, DecoderKind, RespValue};

/// The default server port (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of respwire
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
