//! Client configuration.

use crate::protocol::parser::{DecoderLimits, MAX_BULK_SIZE, MAX_LINE_LENGTH};
use crate::protocol::DecoderKind;
use std::time::Duration;

/// Connection settings.
///
/// # Example
///
/// ```
/// use respwire::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .port(6380)
///     .password("secret")
///     .db(2)
///     .response_timeout(Duration::from_secs(5));
/// assert_eq!(config.addr(), "127.0.0.1:6380");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Host to connect to
    pub host: String,
    /// Port to connect to
    pub port: u16,
    /// Sent with `AUTH` during the handshake
    pub password: Option<String>,
    /// Selected with `SELECT` during the handshake when non-zero
    pub db: u32,
    /// Caller-side bound on how long `issue` waits for its reply
    pub response_timeout: Option<Duration>,
    pub max_line_length: usize,
    pub max_bulk_length: usize,
    pub decoder: DecoderKind,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            password: None,
            db: 0,
            response_timeout: None,
            max_line_length: MAX_LINE_LENGTH,
            max_bulk_length: MAX_BULK_SIZE,
            decoder: DecoderKind::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn db(mut self, db: u32) -> Self {
        self.db = db;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn decoder(mut self, kind: DecoderKind) -> Self {
        self.decoder = kind;
        self
    }

    pub fn limits(mut self, limits: DecoderLimits) -> Self {
        self.max_line_length = limits.max_line_length;
        self.max_bulk_length = limits.max_bulk_length;
        self
    }

    pub fn decoder_limits(&self) -> DecoderLimits {
        DecoderLimits {
            max_line_length: self.max_line_length,
            max_bulk_length: self.max_bulk_length,
        }
    }

    /// Returns the server address as a string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
