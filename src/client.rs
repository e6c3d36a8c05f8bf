//! Async client API.
//!
//! [`Client`] is a cheap, cloneable handle to one pipelined connection. Any
//! number of tasks may issue commands through it concurrently; each call
//! returns as soon as the command is queued for writing, and replies are
//! delivered in the order the commands were written.
//!
//! ## Example
//!
//! ```no_run
//! use respwire::{Client, ClientConfig, Command};
//!
//! # async fn run() -> respwire::Result<()> {
//! let client = Client::connect(ClientConfig::default()).await?;
//!
//! // Pipelined: both commands are written before either reply is awaited.
//! let set = client.send(&Command::new("SET").arg("name").arg("Ariz"))?;
//! let get = client.send(&Command::new("GET").arg("name"))?;
//! set.await?;
//! println!("{}", get.await?);
//!
//! let mut tx = client.multi()?;
//! let incr = tx.queue(&Command::new("INCR").arg("visits"))?;
//! tx.commit().await?;
//! println!("visits = {}", incr.await?);
//! # Ok(())
//! # }
//! ```

use crate::config::ClientConfig;
use crate::connection::handler::{self, lock_core, ConnectionStats, Outgoing, SharedCore};
use crate::connection::pubsub::{ListenerId, Message, SubscriptionKind};
use crate::connection::queue::ReplyReceiver;
use crate::connection::state::{ConnectionCore, ConnectionState};
use crate::error::{Error, Result};
use crate::protocol::{new_decoder, Command, IntoArg, RespValue};
use bytes::Bytes;
use futures::{FutureExt, Stream};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

struct Shared {
    core: SharedCore,
    writer: mpsc::UnboundedSender<Outgoing>,
    reader: AbortHandle,
    stats: Arc<ConnectionStats>,
    config: ClientConfig,
    peer: String,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // The writer task ends with its channel; the reader must be stopped.
        self.reader.abort();
    }
}

/// Handle to one connection.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer", &self.shared.peer)
            .field("core", &*lock_core(&self.shared.core))
            .finish()
    }
}

impl Client {
    /// Opens a TCP connection and performs the handshake.
    pub async fn connect(config: ClientConfig) -> Result<Client> {
        let addr = config.addr();
        debug!(addr = %addr, "Connecting");
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or(addr);
        Self::start(stream, peer, config).await
    }

    /// Runs the engine over an already established transport, which may be
    /// plaintext, encrypted, or in-memory.
    pub async fn with_transport<T>(transport: T, config: ClientConfig) -> Result<Client>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = config.addr();
        Self::start(transport, peer, config).await
    }

    async fn start<T>(transport: T, peer: String, config: ClientConfig) -> Result<Client>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let decoder = new_decoder(config.decoder, config.decoder_limits());
        let core = Arc::new(Mutex::new(ConnectionCore::new(decoder)));
        let stats = Arc::new(ConnectionStats::new());
        let driver = handler::spawn(transport, Arc::clone(&core), Arc::clone(&stats), peer.clone());

        let client = Client {
            shared: Arc::new(Shared {
                core,
                writer: driver.writer,
                reader: driver.reader,
                stats,
                config,
                peer,
            }),
        };

        if let Err(e) = client.handshake().await {
            warn!(peer = %client.shared.peer, error = %e, "Handshake failed");
            lock_core(&client.shared.core).fail(format!("handshake failed: {}", e));
            client.shutdown_transport();
            return Err(e);
        }

        info!(peer = %client.shared.peer, decoder = %client.shared.config.decoder, "Connected");
        Ok(client)
    }

    /// Authenticates and selects the database before accepting user commands.
    async fn handshake(&self) -> Result<()> {
        let config = &self.shared.config;
        if let Some(password) = &config.password {
            let rx = self.submit(|core| core.issue_handshake(&Command::new("AUTH").arg(password)))?;
            self.wait(Reply::new(rx)).await?;
        }
        if config.db != 0 {
            let rx = self.submit(|core| core.issue_handshake(&Command::new("SELECT").arg(config.db)))?;
            self.wait(Reply::new(rx)).await?;
        }
        lock_core(&self.shared.core).mark_ready()
    }

    /// Runs `issue` and hands the resulting frame to the writer under one
    /// lock, so frames are written in enqueue order.
    fn submit<T>(
        &self,
        issue: impl FnOnce(&mut ConnectionCore) -> Result<(Bytes, T)>,
    ) -> Result<T> {
        let mut core = lock_core(&self.shared.core);
        let (frame, handle) = issue(&mut core)?;
        if self.shared.writer.send(Outgoing::Frame(frame)).is_err() {
            // The reply handle has already been failed by the teardown.
            core.fail("writer task stopped");
        }
        Ok(handle)
    }

    /// Applies the configured response timeout.
    async fn wait(&self, reply: Reply) -> Result<RespValue> {
        match self.shared.config.response_timeout {
            Some(limit) => tokio::time::timeout(limit, reply)
                .await
                .map_err(|_| Error::Timeout)?,
            None => reply.await,
        }
    }

    /// Queues a command for writing and returns its pending reply without
    /// waiting. Call repeatedly to pipeline.
    pub fn send(&self, command: &Command) -> Result<Reply> {
        self.submit(|core| core.issue(command)).map(Reply::new)
    }

    /// Issues a command and waits for its reply.
    pub async fn issue(&self, command: Command) -> Result<RespValue> {
        let reply = self.send(&command)?;
        self.wait(reply).await
    }

    /// Subscribes to channels and returns a stream of their messages.
    pub async fn subscribe<I, A>(&self, channels: I) -> Result<Subscription>
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        let command = Command::new("SUBSCRIBE").args_from(channels);
        self.subscribe_with(command, SubscriptionKind::Channel).await
    }

    /// Subscribes to glob patterns.
    pub async fn psubscribe<I, A>(&self, patterns: I) -> Result<Subscription>
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        let command = Command::new("PSUBSCRIBE").args_from(patterns);
        self.subscribe_with(command, SubscriptionKind::Pattern).await
    }

    async fn subscribe_with(&self, command: Command, kind: SubscriptionKind) -> Result<Subscription> {
        if command.params().is_empty() {
            return Err(Error::Encoding(format!(
                "{} needs at least one name",
                command.name()
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (reply, ids) = self.submit(|core| {
            let (frame, reply, ids) = core.subscribe(&command, tx)?;
            Ok((frame, (reply, ids)))
        })?;

        // Built before waiting so a failed subscribe still detaches locally.
        let subscription = Subscription {
            client: self.clone(),
            kind,
            rx,
            listeners: command.params().iter().cloned().zip(ids).collect(),
        };
        self.wait(Reply::new(reply)).await?;
        Ok(subscription)
    }

    /// Unsubscribes from channels, or from every channel when `channels` is
    /// empty. Resolves with the final acknowledgement.
    pub async fn unsubscribe<I, A>(&self, channels: I) -> Result<RespValue>
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        self.issue(Command::new("UNSUBSCRIBE").args_from(channels))
            .await
    }

    /// Unsubscribes from patterns, or from every pattern when empty.
    pub async fn punsubscribe<I, A>(&self, patterns: I) -> Result<RespValue>
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        self.issue(Command::new("PUNSUBSCRIBE").args_from(patterns))
            .await
    }

    /// Starts a transaction by writing `MULTI`.
    ///
    /// The transaction spans the whole connection: while it is open, commands
    /// sent through any clone of this client are queued into it.
    pub fn multi(&self) -> Result<Transaction> {
        let begin = self.send(&Command::new("MULTI"))?;
        Ok(Transaction {
            client: self.clone(),
            begin: Some(begin),
            finished: false,
        })
    }

    pub fn state(&self) -> ConnectionState {
        lock_core(&self.shared.core).state().clone()
    }

    /// Number of commands written but not yet answered.
    pub fn pending(&self) -> usize {
        lock_core(&self.shared.core).pending_len()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.shared.stats
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Closes the connection. Outstanding requests fail with
    /// `ConnectionLost` and subscription streams end.
    pub fn close(&self) {
        lock_core(&self.shared.core).close();
        self.shutdown_transport();
    }

    fn shutdown_transport(&self) {
        if self.shared.writer.send(Outgoing::Shutdown).is_err() {
            debug!(peer = %self.shared.peer, "Writer already stopped");
        }
        self.shared.reader.abort();
    }
}

/// A reply that has not arrived yet.
///
/// Dropping it cancels delivery only; the command was already written and
/// its reply is still consumed in order.
#[derive(Debug)]
#[must_use = "replies do nothing unless awaited"]
pub struct Reply {
    rx: ReplyReceiver,
}

impl Reply {
    fn new(rx: ReplyReceiver) -> Self {
        Self { rx }
    }
}

impl Future for Reply {
    type Output = Result<RespValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx.poll_unpin(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(Error::ConnectionLost(
                    "connection dropped before the reply arrived".to_string(),
                ))
            })
        })
    }
}

/// An open `MULTI` block.
///
/// Every command queued through it resolves with its positional element of
/// the `EXEC` result. Dropping an unfinished transaction sends `DISCARD`.
#[derive(Debug)]
pub struct Transaction {
    client: Client,
    begin: Option<Reply>,
    finished: bool,
}

impl Transaction {
    /// Queues a command. The returned reply resolves after `commit`.
    pub fn queue(&mut self, command: &Command) -> Result<Reply> {
        self.client.send(command)
    }

    /// Sends `EXEC` and returns the array of results.
    ///
    /// A WATCH conflict yields [`Error::TransactionAborted`].
    pub async fn commit(mut self) -> Result<RespValue> {
        self.finished = true;
        let exec = self.client.send(&Command::new("EXEC"))?;
        if let Some(begin) = self.begin.take() {
            self.client.wait(begin).await?;
        }
        self.client.wait(exec).await
    }

    /// Sends `DISCARD`. Queued replies resolve with `TransactionAborted`.
    pub async fn abort(mut self) -> Result<()> {
        self.finished = true;
        let discard = self.client.send(&Command::new("DISCARD"))?;
        if let Some(begin) = self.begin.take() {
            self.client.wait(begin).await?;
        }
        self.client.wait(discard).await.map(|_| ())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.client.send(&Command::new("DISCARD")) {
            debug!(error = %e, "Could not discard dropped transaction");
        }
    }
}

/// Messages published to a set of channels or patterns.
///
/// Ends when the names are unsubscribed or the connection goes away.
/// Dropping it detaches its listeners locally without sending anything.
#[derive(Debug)]
pub struct Subscription {
    client: Client,
    kind: SubscriptionKind,
    rx: mpsc::UnboundedReceiver<Message>,
    listeners: Vec<(Bytes, ListenerId)>,
}

impl Subscription {
    /// Waits for the next message, or `None` once the stream has ended.
    pub async fn next_message(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    /// The channels or patterns this subscription listens on.
    pub fn names(&self) -> impl Iterator<Item = &Bytes> {
        self.listeners.iter().map(|(name, _)| name)
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut core = lock_core(&self.client.shared.core);
        for (name, id) in &self.listeners {
            core.unregister(self.kind, name, *id);
        }
    }
}
