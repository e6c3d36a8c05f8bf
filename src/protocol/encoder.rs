//! Request Encoding
//!
//! Commands always go out as a RESP array of bulk strings:
//!
//! ```text
//! *<argc>\r\n
//! $<len(arg0)>\r\n<arg0>\r\n
//! $<len(arg1)>\r\n<arg1>\r\n
//! ...
//! ```
//!
//! Every argument carries an explicit byte length, so arguments may hold
//! arbitrary bytes, including CR, LF and NUL. The inline command format is
//! never produced.

use crate::error::{Error, Result};
use crate::protocol::types::{prefix, CRLF};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// A command ready to be sent: the name followed by its arguments.
///
/// # Example
///
/// ```
/// use respwire::protocol::Command;
///
/// let cmd = Command::new("SET").arg("user:101").arg("Ariz").arg("EX").arg(60);
/// assert_eq!(cmd.name(), "SET");
/// assert_eq!(cmd.args().len(), 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Starts a command with the given name.
    pub fn new(name: impl IntoArg) -> Self {
        Self {
            args: vec![name.into_arg()],
        }
    }

    /// Builds a command from a raw argument list. The list may be empty;
    /// [`encode`] rejects it in that case.
    pub fn from_args<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        Self {
            args: args.into_iter().map(IntoArg::into_arg).collect(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl IntoArg) -> Self {
        self.args.push(arg.into_arg());
        self
    }

    /// Appends every argument from an iterator.
    pub fn args_from<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        self.args.extend(args.into_iter().map(IntoArg::into_arg));
        self
    }

    /// The upper-cased command name, or an empty string for an empty command.
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|n| String::from_utf8_lossy(n).to_ascii_uppercase())
            .unwrap_or_default()
    }

    /// All arguments, name included.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Arguments after the command name.
    pub fn params(&self) -> &[Bytes] {
        self.args.get(1..).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

/// Conversion of a value into one binary-safe command argument.
///
/// Numbers are rendered in decimal, the way the server expects them.
pub trait IntoArg {
    fn into_arg(self) -> Bytes;
}

impl IntoArg for Bytes {
    fn into_arg(self) -> Bytes {
        self
    }
}

impl IntoArg for &Bytes {
    fn into_arg(self) -> Bytes {
        self.clone()
    }
}

impl IntoArg for Vec<u8> {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for &[u8] {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl<const N: usize> IntoArg for &[u8; N] {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl IntoArg for String {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for &String {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl IntoArg for &str {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

macro_rules! impl_into_arg_display {
    ($($ty:ty),*) => {
        $(
            impl IntoArg for $ty {
                fn into_arg(self) -> Bytes {
                    Bytes::from(self.to_string())
                }
            }
        )*
    };
}

impl_into_arg_display!(i32, i64, u32, u64, usize, isize, f32, f64);

/// Encodes a command into request wire format.
///
/// Fails with [`Error::Encoding`] if the command has no arguments at all.
pub fn encode(command: &Command) -> Result<Bytes> {
    if command.is_empty() {
        return Err(Error::Encoding("command has no arguments".to_string()));
    }

    let size = encoded_len(command);
    let mut buf = BytesMut::with_capacity(size);
    encode_into(command, &mut buf);
    debug_assert_eq!(buf.len(), size);

    Ok(buf.freeze())
}

fn encode_into(command: &Command, buf: &mut BytesMut) {
    buf.put_u8(prefix::ARRAY);
    buf.put_slice(command.args.len().to_string().as_bytes());
    buf.put_slice(CRLF);
    for arg in &command.args {
        buf.put_u8(prefix::BULK_STRING);
        buf.put_slice(arg.len().to_string().as_bytes());
        buf.put_slice(CRLF);
        buf.put_slice(arg);
        buf.put_slice(CRLF);
    }
}

fn encoded_len(command: &Command) -> usize {
    let header = 1 + decimal_len(command.args.len()) + 2;
    command.args.iter().fold(header, |acc, arg| {
        acc + 1 + decimal_len(arg.len()) + 2 + arg.len() + 2
    })
}

fn decimal_len(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}
