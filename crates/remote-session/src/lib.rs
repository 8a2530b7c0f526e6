//! Remote command execution and file transfer over a single authenticated
//! session.

mod error;
mod exec;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod paths;
mod session;
pub mod ssh;
mod transfer;
mod transport;

pub use error::{CheckedExecError, ConnectionError, ExecError, TransferError, TransportError};
pub use exec::{CommandOutput, DEFAULT_POLL_INTERVAL};
pub use session::{with_session, RemoteSession, SessionOptions};
pub use ssh::SshConnector;
pub use transport::{
    Connector, Credential, ExecChannel, FileChannel, SessionTarget, Transport,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_SSH_PORT,
};
