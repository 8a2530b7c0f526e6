use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure to establish (or re-establish) an authenticated session.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("ssh handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: TransportError,
    },
    #[error("authentication as {user} on {addr} failed: {detail}")]
    Authentication {
        user: String,
        addr: String,
        detail: String,
    },
}

/// Failure of the underlying transport once a session exists.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("ssh error: {0}")]
    Protocol(String),
    #[error("session closed")]
    Closed,
}

/// A command could not be driven to completion. Partial output is discarded.
#[derive(Debug, Error)]
#[error("command `{command}` aborted: {source}")]
pub struct ExecError {
    pub command: String,
    #[source]
    pub source: TransportError,
}

#[derive(Debug, Error)]
pub enum CheckedExecError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("command `{command}` exited with status {code}: {stderr}")]
    NonZeroExit {
        command: String,
        code: i32,
        stderr: String,
    },
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("remote path {path} not found")]
    NotFound { path: String },
    #[error("transfer of {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: TransportError,
    },
    #[error("transfer of {path} incomplete: expected {expected} bytes, got {actual}")]
    Incomplete {
        path: String,
        expected: u64,
        actual: u64,
    },
    #[error("local file {} failed: {source}", path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransferError::NotFound { .. })
    }

    pub(crate) fn transport(path: &str, source: impl Into<TransportError>) -> Self {
        TransferError::Transport {
            path: path.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn local(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransferError::Local {
            path: path.into(),
            source,
        }
    }
}
