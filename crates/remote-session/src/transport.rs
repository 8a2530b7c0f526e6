//! The seam between the session logic and whatever carries the bytes.
//!
//! Everything above this module (the polling protocol, transfers, the harvest loop)
//! is written against these traits. [`crate::ssh::SshConnector`] drives them with
//! libssh2; the `testing` feature provides an in-memory remote.

use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConnectionError, TransferError, TransportError};

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub enum Credential {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Agent,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::KeyFile { path, .. } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .finish_non_exhaustive(),
            Credential::Agent => f.write_str("Agent"),
        }
    }
}

/// Identity of a remote session: where to connect and as whom.
#[derive(Clone, Debug)]
pub struct SessionTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credential: Credential,
    pub connect_timeout: Duration,
}

impl SessionTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>, credential: Credential) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            credential,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

pub trait Connector: Send + Sync {
    fn connect(&self, target: &SessionTarget) -> Result<Box<dyn Transport>, ConnectionError>;
}

/// One authenticated connection. Used strictly sequentially.
pub trait Transport: Send {
    fn open_exec(&mut self, command: &str) -> Result<Box<dyn ExecChannel>, TransportError>;

    fn open_file_channel(&mut self) -> Result<Box<dyn FileChannel>, TransportError>;

    /// Must tolerate a connection that is already gone.
    fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// A multiplexed channel running a single remote command.
///
/// None of the calls block waiting for the remote side: `send` reports how much of
/// the input the flow-control window took, the `recv_*` calls return `0` when nothing
/// is buffered right now, and `exit_status` stays `None` until the remote process has
/// reported its status.
pub trait ExecChannel: Send {
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    fn finish_input(&mut self) -> Result<(), TransportError>;

    fn recv_stdout(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn recv_stderr(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn exit_status(&mut self) -> Result<Option<i32>, TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;
}

/// The file-transfer sub-channel bound to a transport.
pub trait FileChannel: Send {
    /// Entry names inside `path`, without `.` and `..`.
    fn list(&mut self, path: &str) -> Result<Vec<String>, TransferError>;

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>, TransferError>;

    fn create(&mut self, path: &str) -> Result<Box<dyn Write + Send>, TransferError>;

    fn remove(&mut self, path: &str) -> Result<(), TransferError>;

    fn rename(&mut self, from: &str, to: &str) -> Result<(), TransferError>;

    /// Size in bytes when the server reports one.
    fn size(&mut self, path: &str) -> Result<Option<u64>, TransferError>;
}
