use std::thread;
use std::time::Duration;

use crate::error::TransportError;
use crate::transport::ExecChannel;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const RECV_CHUNK: usize = 1024;

/// Result of a command that ran to completion. A non-zero `exit_code` is still a
/// completed command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Drives one command channel to completion.
///
/// Both output streams are drained on every iteration, including while input is
/// still being pushed, so a remote process can never stall on a full pipe that
/// nobody reads. The exit status is sampled before the drain of each iteration:
/// once it is seen, the drain that follows is the final one and picks up any bytes
/// that arrived alongside the status.
pub(crate) fn drive<O, E>(
    channel: &mut dyn ExecChannel,
    input: &[u8],
    poll_interval: Duration,
    mut on_stdout: O,
    mut on_stderr: E,
) -> Result<i32, TransportError>
where
    O: FnMut(&[u8]),
    E: FnMut(&[u8]),
{
    let mut buf = [0u8; RECV_CHUNK];
    let mut pending = input;
    while !pending.is_empty() {
        let sent = channel.send(pending)?;
        pending = &pending[sent..];
        if sent == 0 {
            drain(channel, Stream::Stdout, &mut buf, &mut on_stdout)?;
            drain(channel, Stream::Stderr, &mut buf, &mut on_stderr)?;
            thread::sleep(poll_interval);
        }
    }
    channel.finish_input()?;

    loop {
        let status = channel.exit_status()?;
        drain(channel, Stream::Stdout, &mut buf, &mut on_stdout)?;
        drain(channel, Stream::Stderr, &mut buf, &mut on_stderr)?;
        if let Some(code) = status {
            return Ok(code);
        }
        thread::sleep(poll_interval);
    }
}

pub(crate) fn run_to_output(
    channel: &mut dyn ExecChannel,
    input: &[u8],
    poll_interval: Duration,
) -> Result<CommandOutput, TransportError> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let exit_code = drive(
        channel,
        input,
        poll_interval,
        |chunk| stdout.extend_from_slice(chunk),
        |chunk| stderr.extend_from_slice(chunk),
    )?;
    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
    })
}

fn drain<F: FnMut(&[u8])>(
    channel: &mut dyn ExecChannel,
    stream: Stream,
    buf: &mut [u8],
    sink: &mut F,
) -> Result<(), TransportError> {
    loop {
        let n = match stream {
            Stream::Stdout => channel.recv_stdout(buf)?,
            Stream::Stderr => channel.recv_stderr(buf)?,
        };
        if n == 0 {
            return Ok(());
        }
        sink(&buf[..n]);
    }
}
