//! libssh2-backed transport.
//!
//! The session runs in blocking mode except while a command channel is being
//! polled; the channel switches it to non-blocking on open and back when it is
//! closed or dropped, so SFTP calls always see a blocking session.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use ssh2::{Channel, ErrorCode, Session, Sftp};
use tracing::debug;

use crate::error::{ConnectionError, TransferError, TransportError};
use crate::transport::{Connector, Credential, ExecChannel, FileChannel, SessionTarget, Transport};

// LIBSSH2_FX_NO_SUCH_FILE
const SFTP_NO_SUCH_FILE: i32 = 2;

impl From<ssh2::Error> for TransportError {
    fn from(err: ssh2::Error) -> Self {
        TransportError::Protocol(err.to_string())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SshConnector;

impl Connector for SshConnector {
    fn connect(&self, target: &SessionTarget) -> Result<Box<dyn Transport>, ConnectionError> {
        let addr = target.addr();
        let tcp = connect_tcp(&target.host, target.port, target.connect_timeout).map_err(
            |source| ConnectionError::Connect {
                addr: addr.clone(),
                source,
            },
        )?;
        let handshake_error = |source: ssh2::Error| ConnectionError::Handshake {
            addr: addr.clone(),
            source: source.into(),
        };
        let mut session = Session::new().map_err(handshake_error)?;
        session.set_tcp_stream(tcp);
        bounded(&mut session, target.connect_timeout, |session| {
            session.handshake().map_err(handshake_error)?;
            authenticate(session, target, &addr)
        })?;
        debug!(remote = %target, "ssh session established");
        Ok(Box::new(SshTransport { session }))
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_error = Some(err),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{host} resolved to no addresses"),
        )
    }))
}

fn authenticate(
    session: &Session,
    target: &SessionTarget,
    addr: &str,
) -> Result<(), ConnectionError> {
    let result = match &target.credential {
        Credential::Password(password) => session.userauth_password(&target.user, password),
        Credential::KeyFile { path, passphrase } => {
            session.userauth_pubkey_file(&target.user, None, path, passphrase.as_deref())
        }
        Credential::Agent => session.userauth_agent(&target.user),
    };
    let rejected = |detail: String| ConnectionError::Authentication {
        user: target.user.clone(),
        addr: addr.to_string(),
        detail,
    };
    result.map_err(|err| rejected(err.to_string()))?;
    if !session.authenticated() {
        return Err(rejected("server did not accept the credential".to_string()));
    }
    Ok(())
}

fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

/// Runs `op` with a libssh2 timeout, then clears it so later blocking calls
/// such as `wait_close` can outlast the connect timeout.
fn bounded<T>(
    session: &mut Session,
    timeout: Duration,
    op: impl FnOnce(&mut Session) -> T,
) -> T {
    session.set_timeout(timeout_millis(timeout));
    let result = op(session);
    session.set_timeout(0);
    result
}

/// Shell convention for a command killed by a signal: 128 plus the signal
/// number. Names without a portable number map to 255.
fn signal_exit_code(name: &str) -> i32 {
    let name = name.strip_prefix("SIG").unwrap_or(name);
    let number = match name {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "ILL" => 4,
        "TRAP" => 5,
        "ABRT" => 6,
        "BUS" => 7,
        "FPE" => 8,
        "KILL" => 9,
        "USR1" => 10,
        "SEGV" => 11,
        "USR2" => 12,
        "PIPE" => 13,
        "ALRM" => 14,
        "TERM" => 15,
        _ => return 255,
    };
    128 + number
}

struct SshTransport {
    session: Session,
}

impl Transport for SshTransport {
    fn open_exec(&mut self, command: &str) -> Result<Box<dyn ExecChannel>, TransportError> {
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;
        self.session.set_blocking(false);
        Ok(Box::new(SshExecChannel {
            session: self.session.clone(),
            channel,
            exit_code: None,
            closed: false,
        }))
    }

    fn open_file_channel(&mut self) -> Result<Box<dyn FileChannel>, TransportError> {
        let sftp = self.session.sftp()?;
        Ok(Box::new(SshFileChannel { sftp }))
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.session.set_blocking(true);
        self.session.disconnect(None, "closing session", None)?;
        Ok(())
    }
}

struct SshExecChannel {
    session: Session,
    channel: Channel,
    exit_code: Option<i32>,
    closed: bool,
}

impl SshExecChannel {
    fn blocking<T>(
        &mut self,
        op: impl FnOnce(&mut Channel) -> Result<T, ssh2::Error>,
    ) -> Result<T, TransportError> {
        self.session.set_blocking(true);
        let result = op(&mut self.channel);
        self.session.set_blocking(false);
        Ok(result?)
    }
}

fn would_block(result: io::Result<usize>) -> Result<usize, TransportError> {
    match result {
        Ok(n) => Ok(n),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(err) => Err(err.into()),
    }
}

impl ExecChannel for SshExecChannel {
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        would_block(self.channel.write(data))
    }

    fn finish_input(&mut self) -> Result<(), TransportError> {
        self.blocking(|channel| channel.send_eof())
    }

    fn recv_stdout(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        would_block(self.channel.read(buf))
    }

    fn recv_stderr(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        would_block(self.channel.stderr().read(buf))
    }

    fn exit_status(&mut self) -> Result<Option<i32>, TransportError> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        if !self.channel.eof() {
            return Ok(None);
        }
        // libssh2 only reports a reliable status once the remote side closed.
        // A signal-killed command has no exit-status message, so libssh2 says 0.
        let code = self.blocking(|channel| {
            channel.wait_close()?;
            match channel.exit_signal()?.exit_signal {
                Some(signal) => Ok(signal_exit_code(&signal)),
                None => channel.exit_status(),
            }
        })?;
        self.closed = true;
        self.exit_code = Some(code);
        Ok(self.exit_code)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.blocking(|channel| {
                channel.close()?;
                channel.wait_close()
            })?;
            self.closed = true;
        }
        self.session.set_blocking(true);
        Ok(())
    }
}

impl Drop for SshExecChannel {
    fn drop(&mut self) {
        self.session.set_blocking(true);
    }
}

struct SshFileChannel {
    sftp: Sftp,
}

fn sftp_error(path: &str, err: ssh2::Error) -> TransferError {
    if err.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE) {
        TransferError::NotFound {
            path: path.to_string(),
        }
    } else {
        TransferError::transport(path, err)
    }
}

impl FileChannel for SshFileChannel {
    fn list(&mut self, path: &str) -> Result<Vec<String>, TransferError> {
        let entries = self
            .sftp
            .readdir(Path::new(path))
            .map_err(|err| sftp_error(path, err))?;
        Ok(entries
            .into_iter()
            .filter_map(|(entry, _)| {
                entry
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
            })
            .filter(|name| name != "." && name != "..")
            .collect())
    }

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>, TransferError> {
        let file = self
            .sftp
            .open(Path::new(path))
            .map_err(|err| sftp_error(path, err))?;
        Ok(Box::new(file))
    }

    fn create(&mut self, path: &str) -> Result<Box<dyn Write + Send>, TransferError> {
        let file = self
            .sftp
            .create(Path::new(path))
            .map_err(|err| sftp_error(path, err))?;
        Ok(Box::new(file))
    }

    fn remove(&mut self, path: &str) -> Result<(), TransferError> {
        self.sftp
            .unlink(Path::new(path))
            .map_err(|err| sftp_error(path, err))
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), TransferError> {
        self.sftp
            .rename(Path::new(from), Path::new(to), None)
            .map_err(|err| sftp_error(from, err))
    }

    fn size(&mut self, path: &str) -> Result<Option<u64>, TransferError> {
        let stat = self
            .sftp
            .stat(Path::new(path))
            .map_err(|err| sftp_error(path, err))?;
        Ok(stat.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_map_to_shell_exit_codes() {
        assert_eq!(signal_exit_code("KILL"), 137);
        assert_eq!(signal_exit_code("TERM"), 143);
        assert_eq!(signal_exit_code("SIGSEGV"), 139);
        assert_eq!(signal_exit_code("HUP"), 129);
        assert_eq!(signal_exit_code("ZZZ"), 255);
        assert_eq!(signal_exit_code(""), 255);
    }

    #[test]
    fn connect_timeout_does_not_outlive_the_handshake() {
        let mut session = Session::new().unwrap();
        let inside = bounded(&mut session, Duration::from_secs(7), |session| {
            session.timeout()
        });
        assert_eq!(inside, 7000);
        assert_eq!(session.timeout(), 0);
    }

    #[test]
    fn timeout_is_cleared_when_the_handshake_fails() {
        let mut session = Session::new().unwrap();
        let result: Result<(), &str> =
            bounded(&mut session, Duration::from_millis(250), |_| Err("refused"));
        assert!(result.is_err());
        assert_eq!(session.timeout(), 0);
    }
}
