//! respwire-cli - a small command-line client built on the respwire engine
//!
//! Runs one command and prints its reply, or streams published messages
//! with `--subscribe`.

use anyhow::{bail, Context};
use clap::Parser;
use futures::StreamExt;
use respwire::{Client, ClientConfig, Command, DecoderKind, RespValue};
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// respwire command-line client
#[derive(Parser, Debug)]
#[command(name = "respwire-cli", version = respwire::VERSION)]
#[command(about = "Send a command to a RESP server, or stream pub/sub messages")]
struct Args {
    /// Server host
    #[arg(short = 'H', long, default_value = respwire::DEFAULT_HOST)]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = respwire::DEFAULT_PORT)]
    port: u16,

    /// Password sent with AUTH
    #[arg(short = 'a', long, env = "RESPWIRE_PASSWORD")]
    password: Option<String>,

    /// Database selected after connecting
    #[arg(short = 'n', long, default_value_t = 0)]
    db: u32,

    /// Give up on a reply after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Decoder implementation: incremental or rescan
    #[arg(long, default_value_t = DecoderKind::Incremental)]
    decoder: DecoderKind,

    /// Subscribe to these channels and print messages until interrupted
    #[arg(long, num_args = 1.., conflicts_with = "command")]
    subscribe: Vec<String>,

    /// Command and arguments, e.g. `SET name Ariz`
    command: Vec<String>,
}

impl Args {
    fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.host.clone(), self.port)
            .db(self.db)
            .decoder(self.decoder);
        if let Some(password) = &self.password {
            config = config.password(password.clone());
        }
        if let Some(ms) = self.timeout_ms {
            config = config.response_timeout(Duration::from_millis(ms));
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so replies on stdout stay clean
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = args.config();
    let client = Client::connect(config.clone())
        .await
        .with_context(|| format!("failed to connect to {}", config.addr()))?;

    if !args.subscribe.is_empty() {
        return stream_messages(&client, &args.subscribe).await;
    }

    if args.command.is_empty() {
        bail!("no command given; try `respwire-cli PING`");
    }

    let command = Command::from_args(&args.command);
    debug!(command = %command, "Sending command");
    let reply = client.issue(command).await?;
    print_reply(&reply, 0);

    client.close();
    Ok(())
}

async fn stream_messages(client: &Client, channels: &[String]) -> anyhow::Result<()> {
    let mut messages = client.subscribe(channels).await?;
    info!(channels = ?channels, "Subscribed, waiting for messages");

    loop {
        tokio::select! {
            message = messages.next() => match message {
                Some(message) => println!("{}", message),
                None => {
                    info!("Subscription ended");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    client.close();
    Ok(())
}

/// Prints a reply in the familiar redis-cli layout.
fn print_reply(value: &RespValue, indent: usize) {
    let pad = " ".repeat(indent);
    match value {
        RespValue::SimpleString(s) => println!("{}{}", pad, s),
        RespValue::Error(msg) => println!("{}(error) {}", pad, msg),
        RespValue::Integer(n) => println!("{}(integer) {}", pad, n),
        RespValue::BulkString(b) => println!("{}\"{}\"", pad, String::from_utf8_lossy(b)),
        RespValue::Null | RespValue::NullArray => println!("{}(nil)", pad),
        RespValue::Array(items) if items.is_empty() => println!("{}(empty array)", pad),
        RespValue::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                println!("{}{})", pad, i + 1);
                print_reply(item, indent + 3);
            }
        }
    }
}
