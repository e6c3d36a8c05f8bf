//! Connection Engine
//!
//! Everything between the byte stream and the callers of one connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ConnectionCore                         │
//! │                                                             │
//! │  issue(cmd) ──> encode ──> PendingQueue.enqueue ──> writer  │
//! │                                                             │
//! │  receive(bytes) ──> Decoder ──> classify                    │
//! │                                   │                         │
//! │              ┌────────────────────┼───────────────────┐     │
//! │              ▼                    ▼                   ▼     │
//! │     SubscriptionRouter   TransactionCoordinator  PendingQueue│
//! │      (push messages)     (QUEUED / EXEC)        (FIFO reply)│
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! - `state`: the sans-IO state machine tying the pieces together
//! - `queue`: FIFO of outstanding requests and their completion handles
//! - `pubsub`: push classification and the subscription table
//! - `transaction`: MULTI/EXEC bookkeeping
//! - `handler`: reader and writer tasks over an async transport

pub mod handler;
pub mod pubsub;
pub mod queue;
pub mod state;
pub mod transaction;

// Re-export commonly used types
pub use handler::{lock_core, spawn, ConnectionStats, Driver, Outgoing, SharedCore};
pub use pubsub::{Message, SubscriptionKind, SubscriptionRouter};
pub use queue::{Completion, PendingQueue, PendingRequest, ReplyReceiver};
pub use state::{ConnectionCore, ConnectionState};
pub use transaction::{TransactionCoordinator, TransactionState};
