use std::io::{self, Write};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{CheckedExecError, ConnectionError, ExecError, TransportError};
use crate::exec::{self, CommandOutput, DEFAULT_POLL_INTERVAL};
use crate::paths::shell_quote;
use crate::transport::{Connector, ExecChannel, FileChannel, SessionTarget, Transport};

#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Delay between exit-status polls of an in-flight command.
    pub poll_interval: Duration,
    /// Print `[user@host:port]# command` to stdout before every command.
    pub echo_commands: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            echo_commands: false,
        }
    }
}

/// One authenticated connection to a remote host.
///
/// Commands and transfers run strictly one after another. The file-transfer
/// sub-channel is opened on first use and kept until the session is released;
/// release drops it before disconnecting the transport. Release happens on
/// [`RemoteSession::close`] or on drop, whichever comes first.
pub struct RemoteSession {
    target: SessionTarget,
    options: SessionOptions,
    transport: Option<Box<dyn Transport>>,
    pub(crate) files: Option<Box<dyn FileChannel>>,
}

impl RemoteSession {
    pub fn open(
        connector: &dyn Connector,
        target: &SessionTarget,
        options: SessionOptions,
    ) -> Result<Self, ConnectionError> {
        debug!(remote = %target, "opening remote session");
        let transport = connector.connect(target)?;
        Ok(Self {
            target: target.clone(),
            options,
            transport: Some(transport),
            files: None,
        })
    }

    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    /// Runs `command` to completion, feeding it `input`. A non-zero exit code is
    /// returned as part of the output, not as an error.
    pub fn execute(&mut self, command: &str, input: &[u8]) -> Result<CommandOutput, ExecError> {
        let poll_interval = self.options.poll_interval;
        self.with_channel(command, |channel| {
            exec::run_to_output(channel, input, poll_interval)
        })
    }

    pub fn execute_checked(
        &mut self,
        command: &str,
        input: &[u8],
    ) -> Result<CommandOutput, CheckedExecError> {
        let output = self.execute(command, input)?;
        if !output.success() {
            return Err(CheckedExecError::NonZeroExit {
                command: command.to_string(),
                code: output.exit_code,
                stderr: output.stderr_lossy().trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Like [`RemoteSession::execute`], but output is copied to the local stdout
    /// and stderr as it arrives instead of being collected.
    pub fn call(&mut self, command: &str, input: &[u8]) -> Result<i32, ExecError> {
        let poll_interval = self.options.poll_interval;
        self.with_channel(command, |channel| {
            exec::drive(
                channel,
                input,
                poll_interval,
                |chunk| {
                    let mut out = io::stdout().lock();
                    let _ = out.write_all(chunk);
                    let _ = out.flush();
                },
                |chunk| {
                    let mut err = io::stderr().lock();
                    let _ = err.write_all(chunk);
                    let _ = err.flush();
                },
            )
        })
    }

    /// Issues `command` without waiting for it. The channel is released right
    /// away, so anything meant to outlive it has to detach itself
    /// (`setsid cmd </dev/null >log 2>&1 &`).
    pub fn spawn(&mut self, command: &str) -> Result<(), ExecError> {
        self.announce(command);
        self.transport()
            .and_then(|transport| transport.open_exec(command))
            .and_then(|mut channel| channel.finish_input())
            .map_err(|source| ExecError {
                command: command.to_string(),
                source,
            })
    }

    pub fn exists(&mut self, path: &str) -> Result<bool, ExecError> {
        let output = self.execute(&format!("test -e {}", shell_quote(path)), b"")?;
        Ok(output.success())
    }

    /// Releases the session. Never fails: a connection that is already broken
    /// is simply dropped.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.files.take();
        if let Some(mut transport) = self.transport.take() {
            match transport.disconnect() {
                Ok(()) => debug!(remote = %self.target, "remote session closed"),
                Err(err) => debug!(
                    remote = %self.target,
                    error = %err,
                    "remote session was already broken at release"
                ),
            }
        }
    }

    fn transport(&mut self) -> Result<&mut dyn Transport, TransportError> {
        match self.transport.as_deref_mut() {
            Some(transport) => Ok(transport),
            None => Err(TransportError::Closed),
        }
    }

    pub(crate) fn file_channel(&mut self) -> Result<&mut dyn FileChannel, TransportError> {
        if self.files.is_none() {
            let channel = self.transport()?.open_file_channel()?;
            self.files = Some(channel);
        }
        match self.files.as_deref_mut() {
            Some(files) => Ok(files),
            None => Err(TransportError::Closed),
        }
    }

    fn with_channel<T, F>(&mut self, command: &str, run: F) -> Result<T, ExecError>
    where
        F: FnOnce(&mut dyn ExecChannel) -> Result<T, TransportError>,
    {
        self.announce(command);
        let outcome = self
            .transport()
            .and_then(|transport| transport.open_exec(command))
            .and_then(|mut channel| {
                let result = run(channel.as_mut());
                if let Err(err) = channel.close() {
                    debug!(command, error = %err, "failed to close command channel");
                }
                result
            });
        outcome.map_err(|source| {
            warn!(remote = %self.target, command, error = %source, "remote command aborted");
            ExecError {
                command: command.to_string(),
                source,
            }
        })
    }

    fn announce(&self, command: &str) {
        debug!(remote = %self.target, command, "exec remote command");
        if self.options.echo_commands {
            println!(
                "[{}@{}:{}]# {}",
                self.target.user, self.target.host, self.target.port, command
            );
        }
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Opens a session, hands it to `work`, and releases it on every way out of
/// `work`: success, error, or unwinding.
pub fn with_session<T, E, F>(
    connector: &dyn Connector,
    target: &SessionTarget,
    options: SessionOptions,
    work: F,
) -> Result<T, E>
where
    E: From<ConnectionError>,
    F: FnOnce(&mut RemoteSession) -> Result<T, E>,
{
    let mut session = RemoteSession::open(connector, target, options)?;
    let result = work(&mut session);
    session.close();
    result
}
