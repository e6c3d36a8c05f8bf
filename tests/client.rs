//! End-to-end tests driving `Client` against a scripted in-memory server.

use bytes::Bytes;
use futures::StreamExt;
use respwire::protocol::{Decoder, RespParser};
use respwire::{Client, ClientConfig, Command, ConnectionState, Error, RespValue};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// The server end of an in-memory connection.
struct FakeServer {
    io: DuplexStream,
    parser: RespParser,
}

impl FakeServer {
    fn new(io: DuplexStream) -> Self {
        Self {
            io,
            parser: RespParser::new(),
        }
    }

    /// Reads the next command the client wrote.
    async fn command(&mut self) -> Vec<String> {
        loop {
            if let Some(value) = self.parser.next_value().unwrap() {
                return value
                    .into_array()
                    .expect("commands are arrays")
                    .iter()
                    .map(|arg| String::from_utf8_lossy(arg.as_bytes().unwrap()).into_owned())
                    .collect();
            }
            let mut buf = [0u8; 1024];
            let n = self.io.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed the connection");
            self.parser.extend(&buf[..n]);
        }
    }

    async fn expect(&mut self, args: &[&str]) {
        assert_eq!(self.command().await, args);
    }

    async fn reply(&mut self, values: &[RespValue]) {
        for value in values {
            self.io.write_all(&value.serialize()).await.unwrap();
        }
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.unwrap();
    }
}

async fn connect(config: ClientConfig) -> (Client, FakeServer) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let client = Client::with_transport(client_io, config).await.unwrap();
    (client, FakeServer::new(server_io))
}

fn bulk(s: &str) -> RespValue {
    RespValue::bulk_string(Bytes::copy_from_slice(s.as_bytes()))
}

fn ack(kind: &str, name: &str, count: i64) -> RespValue {
    RespValue::array(vec![bulk(kind), bulk(name), RespValue::integer(count)])
}

#[tokio::test]
async fn test_pipelined_replies_resolve_in_order() {
    let (client, mut server) = connect(ClientConfig::default()).await;

    let set = client.send(&Command::new("SET").arg("name").arg("Ariz")).unwrap();
    let get = client.send(&Command::new("GET").arg("name")).unwrap();
    let missing = client.send(&Command::new("GET").arg("missing")).unwrap();
    assert_eq!(client.pending(), 3);

    server.expect(&["SET", "name", "Ariz"]).await;
    server.expect(&["GET", "name"]).await;
    server.expect(&["GET", "missing"]).await;

    // Deliver the replies one byte at a time.
    let mut bytes = Vec::new();
    for value in [RespValue::ok(), bulk("Ariz"), RespValue::null()] {
        value.serialize_into(&mut bytes);
    }
    for byte in bytes {
        server.send_raw(&[byte]).await;
    }

    assert_eq!(set.await.unwrap(), RespValue::ok());
    assert_eq!(get.await.unwrap(), bulk("Ariz"));
    assert_eq!(missing.await.unwrap(), RespValue::null());
    assert_eq!(client.pending(), 0);
}

#[tokio::test]
async fn test_concurrent_callers_get_their_own_replies() {
    let (client, mut server) = connect(ClientConfig::default()).await;

    let echo = tokio::spawn(async move {
        for _ in 0..50 {
            let args = server.command().await;
            server.reply(&[bulk(&args[1])]).await;
        }
    });

    let callers: Vec<_> = (0..50)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let message = format!("msg-{}", i);
                let reply = client
                    .issue(Command::new("ECHO").arg(&message))
                    .await
                    .unwrap();
                assert_eq!(reply, bulk(&message));
            })
        })
        .collect();

    for caller in callers {
        caller.await.unwrap();
    }
    echo.await.unwrap();
}

#[tokio::test]
async fn test_server_error_reply_is_local() {
    let (client, mut server) = connect(ClientConfig::default()).await;

    let incr = client.send(&Command::new("INCR").arg("name")).unwrap();
    let ping = client.send(&Command::new("PING")).unwrap();
    server.expect(&["INCR", "name"]).await;
    server.expect(&["PING"]).await;
    server
        .reply(&[
            RespValue::error("ERR value is not an integer or out of range"),
            RespValue::simple_string("PONG"),
        ])
        .await;

    let err = incr.await.unwrap_err();
    assert_eq!(err.error_code(), Some("ERR"));
    assert!(!err.is_fatal());
    assert_eq!(ping.await.unwrap(), RespValue::simple_string("PONG"));
    assert_eq!(client.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_transaction_commit() {
    let (client, mut server) = connect(ClientConfig::default()).await;

    let caller = async {
        let mut tx = client.multi()?;
        let set = tx.queue(&Command::new("SET").arg("a").arg("1"))?;
        let incr = tx.queue(&Command::new("INCR").arg("n"))?;
        let get = tx.queue(&Command::new("GET").arg("a"))?;
        let results = tx.commit().await?;
        Ok::<_, Error>((results, set.await?, incr.await?, get.await?))
    };

    let script = async {
        server.expect(&["MULTI"]).await;
        server.expect(&["SET", "a", "1"]).await;
        server.expect(&["INCR", "n"]).await;
        server.expect(&["GET", "a"]).await;
        server.expect(&["EXEC"]).await;

        let queued = RespValue::simple_string("QUEUED");
        server
            .reply(&[
                RespValue::ok(),
                queued.clone(),
                queued.clone(),
                queued,
                RespValue::array(vec![RespValue::ok(), RespValue::integer(7), bulk("1")]),
            ])
            .await;
    };

    let (outcome, ()) = tokio::join!(caller, script);
    let (results, set, incr, get) = outcome.unwrap();
    assert_eq!(results.as_array().map(|r| r.len()), Some(3));
    assert_eq!(set, RespValue::ok());
    assert_eq!(incr, RespValue::integer(7));
    assert_eq!(get, bulk("1"));
}

#[tokio::test]
async fn test_transaction_watch_conflict() {
    let (client, mut server) = connect(ClientConfig::default()).await;

    let caller = async {
        client.issue(Command::new("WATCH").arg("balance")).await?;
        let mut tx = client.multi()?;
        let set = tx.queue(&Command::new("SET").arg("balance").arg(100))?;
        let committed = tx.commit().await;
        Ok::<_, Error>((committed, set.await))
    };

    let script = async {
        server.expect(&["WATCH", "balance"]).await;
        server.reply(&[RespValue::ok()]).await;
        server.expect(&["MULTI"]).await;
        server.expect(&["SET", "balance", "100"]).await;
        server.expect(&["EXEC"]).await;
        server
            .reply(&[
                RespValue::ok(),
                RespValue::simple_string("QUEUED"),
                RespValue::null_array(),
            ])
            .await;
    };

    let (outcome, ()) = tokio::join!(caller, script);
    let (committed, set) = outcome.unwrap();
    assert!(matches!(committed, Err(Error::TransactionAborted)));
    assert!(matches!(set, Err(Error::TransactionAborted)));
}

#[tokio::test]
async fn test_dropped_transaction_is_discarded() {
    let (client, mut server) = connect(ClientConfig::default()).await;

    let mut tx = client.multi().unwrap();
    let set = tx.queue(&Command::new("SET").arg("a").arg("1")).unwrap();
    drop(tx);
    assert!(matches!(set.await, Err(Error::TransactionAborted)));

    server.expect(&["MULTI"]).await;
    server.expect(&["SET", "a", "1"]).await;
    server.expect(&["DISCARD"]).await;
    server
        .reply(&[
            RespValue::ok(),
            RespValue::simple_string("QUEUED"),
            RespValue::ok(),
        ])
        .await;

    // The connection is back to normal.
    let ping = client.send(&Command::new("PING")).unwrap();
    server.expect(&["PING"]).await;
    server.reply(&[RespValue::simple_string("PONG")]).await;
    assert_eq!(ping.await.unwrap(), RespValue::simple_string("PONG"));
}

#[tokio::test]
async fn test_subscribe_and_receive_messages() {
    let (client, mut server) = connect(ClientConfig::default()).await;

    let script = async {
        server.expect(&["SUBSCRIBE", "news", "sport"]).await;
        server
            .reply(&[ack("subscribe", "news", 1), ack("subscribe", "sport", 2)])
            .await;
    };
    let (subscription, ()) = tokio::join!(client.subscribe(["news", "sport"]), script);
    let mut subscription = subscription.unwrap();
    assert_eq!(client.state(), ConnectionState::SubscribedOnly);

    server
        .reply(&[
            RespValue::array(vec![bulk("message"), bulk("news"), bulk("hello")]),
            RespValue::array(vec![bulk("message"), bulk("sport"), bulk("goal")]),
        ])
        .await;

    let first = subscription.next().await.unwrap();
    assert_eq!(first.channel, Bytes::from("news"));
    assert_eq!(first.payload, Bytes::from("hello"));
    let second = subscription.next_message().await.unwrap();
    assert_eq!(second.payload, Bytes::from("goal"));

    // Ordinary commands are refused while subscribed.
    let get = client.issue(Command::new("GET").arg("k")).await;
    assert!(matches!(get, Err(Error::InvalidState(_))));
}

#[tokio::test]
async fn test_unsubscribe_ends_stream() {
    let (client, mut server) = connect(ClientConfig::default()).await;

    let script = async {
        server.expect(&["SUBSCRIBE", "news"]).await;
        server.reply(&[ack("subscribe", "news", 1)]).await;
    };
    let (subscription, ()) = tokio::join!(client.subscribe(["news"]), script);
    let mut subscription = subscription.unwrap();

    let script = async {
        server.expect(&["UNSUBSCRIBE"]).await;
        server.reply(&[ack("unsubscribe", "news", 0)]).await;
    };
    let (unsubscribed, ()) = tokio::join!(client.unsubscribe(Vec::<String>::new()), script);
    assert_eq!(unsubscribed.unwrap(), ack("unsubscribe", "news", 0));

    assert_eq!(subscription.next().await, None);
    assert_eq!(client.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_pattern_subscription() {
    let (client, mut server) = connect(ClientConfig::default()).await;

    let script = async {
        server.expect(&["PSUBSCRIBE", "news.*"]).await;
        server.reply(&[ack("psubscribe", "news.*", 1)]).await;
        server
            .reply(&[RespValue::array(vec![
                bulk("pmessage"),
                bulk("news.*"),
                bulk("news.tech"),
                bulk("rust 2024"),
            ])])
            .await;
    };
    let (subscription, ()) = tokio::join!(client.psubscribe(["news.*"]), script);
    let mut subscription = subscription.unwrap();

    let message = subscription.next().await.unwrap();
    assert_eq!(message.pattern, Some(Bytes::from("news.*")));
    assert_eq!(message.channel, Bytes::from("news.tech"));
    assert_eq!(message.payload, Bytes::from("rust 2024"));
}

#[tokio::test]
async fn test_protocol_error_fails_connection() {
    let (client, mut server) = connect(ClientConfig::default()).await;

    let first = client.send(&Command::new("GET").arg("a")).unwrap();
    let second = client.send(&Command::new("GET").arg("b")).unwrap();
    server.command().await;
    server.command().await;
    server.send_raw(b"?not resp\r\n").await;

    assert!(matches!(first.await, Err(Error::ConnectionLost(_))));
    assert!(matches!(second.await, Err(Error::ConnectionLost(_))));
    assert!(matches!(client.state(), ConnectionState::Failed(_)));

    let later = client.send(&Command::new("PING"));
    assert!(matches!(later, Err(Error::ConnectionLost(_))));
}

#[tokio::test]
async fn test_server_hangup_fails_pending() {
    let (client, mut server) = connect(ClientConfig::default()).await;

    let reply = client.send(&Command::new("BLPOP").arg("queue").arg(0)).unwrap();
    server.command().await;
    drop(server);

    let err = reply.await.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(client.state(), ConnectionState::Failed(_)));
}

#[tokio::test]
async fn test_timeout_keeps_reply_order() {
    let config = ClientConfig::default().response_timeout(Duration::from_millis(50));
    let (client, mut server) = connect(config).await;

    let slow = client.issue(Command::new("GET").arg("slow")).await;
    assert!(matches!(slow, Err(Error::Timeout)));

    let fast = client.send(&Command::new("GET").arg("fast")).unwrap();
    server.expect(&["GET", "slow"]).await;
    server.expect(&["GET", "fast"]).await;
    server.reply(&[bulk("slow value"), bulk("fast value")]).await;

    // The timed-out reply is consumed, not handed to the next caller.
    assert_eq!(fast.await.unwrap(), bulk("fast value"));
}

#[tokio::test]
async fn test_close_drains_pending() {
    let (client, mut server) = connect(ClientConfig::default()).await;

    let reply = client.send(&Command::new("BLPOP").arg("queue").arg(0)).unwrap();
    server.command().await;
    client.close();

    assert!(matches!(reply.await, Err(Error::ConnectionLost(_))));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(client.send(&Command::new("PING")).is_err());
}

#[tokio::test]
async fn test_handshake_times_out() {
    // AUTH is never answered, so the handshake cannot finish.
    let (client_io, mut server_io) = tokio::io::duplex(1024);
    let config = ClientConfig::default()
        .password("secret")
        .response_timeout(Duration::from_millis(50));

    let result = Client::with_transport(client_io, config).await;
    assert!(matches!(result, Err(Error::Timeout)));

    let mut buf = vec![0u8; 64];
    let n = server_io.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"*2\r\n$4\r\nAUTH\r\n$6\r\nsecret\r\n");
}

#[tokio::test]
async fn test_handshake_auth_and_select() {
    let mock = tokio_test::io::Builder::new()
        .write(b"*2\r\n$4\r\nAUTH\r\n$6\r\nsecret\r\n")
        .read(b"+OK\r\n")
        .write(b"*2\r\n$6\r\nSELECT\r\n$1\r\n2\r\n")
        .read(b"+OK\r\n")
        .write(b"*1\r\n$4\r\nPING\r\n")
        .read(b"+PONG\r\n")
        .build();

    let config = ClientConfig::default().password("secret").db(2);
    let client = Client::with_transport(mock, config).await.unwrap();
    let pong = client.issue(Command::new("PING")).await.unwrap();
    assert_eq!(pong, RespValue::simple_string("PONG"));
}

#[tokio::test]
async fn test_handshake_rejected() {
    let mock = tokio_test::io::Builder::new()
        .write(b"*2\r\n$4\r\nAUTH\r\n$5\r\nwrong\r\n")
        .read(b"-WRONGPASS invalid username-password pair\r\n")
        .build();

    let config = ClientConfig::default().password("wrong");
    let err = Client::with_transport(mock, config).await.unwrap_err();
    assert_eq!(err.error_code(), Some("WRONGPASS"));
}
