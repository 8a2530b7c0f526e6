//! An in-memory remote host for tests.
//!
//! It keeps a flat map of files and a set of directories, answers `test -e`
//! itself, replays scripted output for other commands, and can be told to fail
//! in the ways a real link fails: refused connections, a download that dies
//! halfway, a directory that shows up late or disappears.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{ConnectionError, TransferError, TransportError};
use crate::transport::{Connector, ExecChannel, FileChannel, SessionTarget, Transport};

const DEFAULT_PIPE_CAPACITY: usize = 4096;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptedCommand {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Copy everything received on stdin to stdout, like `cat`.
    pub echo_input: bool,
}

impl ScriptedCommand {
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn echo() -> Self {
        Self {
            echo_input: true,
            ..Self::default()
        }
    }

    pub fn stdout(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdout = bytes.into();
        self
    }

    pub fn stderr(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stderr = bytes.into();
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct RemoteStats {
    pub connects: usize,
    pub refused_connects: usize,
    pub disconnects: usize,
    pub live_transports: usize,
    pub commands: Vec<String>,
}

#[derive(Default)]
struct RemoteState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    commands: HashMap<String, ScriptedCommand>,
    refuse_connects: usize,
    interrupted_reads: HashMap<String, usize>,
    late_dirs: HashMap<String, usize>,
    vanishing_dirs: HashSet<String>,
    failing_removes: HashSet<String>,
    failing_renames: HashSet<String>,
    send_window: Option<usize>,
    pipe_capacity: Option<usize>,
    stats: RemoteStats,
}

#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

fn normalize(path: &str) -> String {
    if path.len() > 1 {
        path.trim_end_matches('/').to_string()
    } else {
        path.to_string()
    }
}

fn parent_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => ".".to_string(),
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_dir(&self, path: &str) {
        self.lock().dirs.insert(normalize(path));
    }

    pub fn remove_dir(&self, path: &str) {
        let path = normalize(path);
        let mut state = self.lock();
        state.dirs.remove(&path);
        state.files.retain(|file, _| parent_of(file) != path);
    }

    pub fn add_file(&self, path: &str, contents: impl Into<Vec<u8>>) {
        let path = normalize(path);
        let mut state = self.lock();
        state.dirs.insert(parent_of(&path));
        state.files.insert(path, contents.into());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(&normalize(path)).cloned()
    }

    /// Names of the files directly inside `dir`, sorted.
    pub fn files_in(&self, dir: &str) -> Vec<String> {
        let dir = normalize(dir);
        self.lock()
            .files
            .keys()
            .filter(|path| parent_of(path) == dir)
            .map(|path| name_of(path).to_string())
            .collect()
    }

    pub fn on_command(&self, command: &str, script: ScriptedCommand) {
        self.lock().commands.insert(command.to_string(), script);
    }

    pub fn refuse_next_connects(&self, count: usize) {
        self.lock().refuse_connects = count;
    }

    /// The next read of `path` breaks the connection after `after_bytes` bytes.
    pub fn interrupt_read(&self, path: &str, after_bytes: usize) {
        self.lock()
            .interrupted_reads
            .insert(normalize(path), after_bytes);
    }

    /// `dir` answers `test -e` negatively `checks` times, then exists.
    pub fn create_dir_after_checks(&self, dir: &str, checks: usize) {
        let dir = normalize(dir);
        let mut state = self.lock();
        state.dirs.remove(&dir);
        state.late_dirs.insert(dir, checks);
    }

    /// `dir` passes `test -e` but is gone by the time it is listed.
    pub fn vanish_on_list(&self, dir: &str) {
        self.lock().vanishing_dirs.insert(normalize(dir));
    }

    /// The next remove of `path` fails without breaking the connection.
    pub fn fail_remove(&self, path: &str) {
        self.lock().failing_removes.insert(normalize(path));
    }

    /// The next rename onto `to` fails without breaking the connection.
    pub fn fail_rename(&self, to: &str) {
        self.lock().failing_renames.insert(normalize(to));
    }

    /// Caps how many input bytes a command channel accepts per send.
    pub fn set_send_window(&self, bytes: usize) {
        self.lock().send_window = Some(bytes);
    }

    pub fn set_pipe_capacity(&self, bytes: usize) {
        self.lock().pipe_capacity = Some(bytes);
    }

    pub fn stats(&self) -> RemoteStats {
        self.lock().stats.clone()
    }

    fn path_exists(&self, path: &str) -> bool {
        let path = normalize(path);
        let mut state = self.lock();
        if let Some(remaining) = state.late_dirs.get_mut(&path) {
            if *remaining > 0 {
                *remaining -= 1;
                return false;
            }
            state.late_dirs.remove(&path);
            state.dirs.insert(path.clone());
        }
        state.files.contains_key(&path) || state.dirs.contains(&path)
    }

    fn script_for(&self, command: &str) -> ScriptedCommand {
        let words = shell_words::split(command).unwrap_or_default();
        if let [test, flag, path] = words.as_slice() {
            if test == "test" && flag == "-e" {
                let code = if self.path_exists(path) { 0 } else { 1 };
                return ScriptedCommand::exit(code);
            }
        }
        self.lock()
            .commands
            .get(command)
            .cloned()
            .unwrap_or_else(|| {
                ScriptedCommand::exit(127)
                    .stderr(format!("sh: 1: {command}: not found\n").into_bytes())
            })
    }
}

impl Connector for MemoryRemote {
    fn connect(&self, target: &SessionTarget) -> Result<Box<dyn Transport>, ConnectionError> {
        let mut state = self.lock();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            state.stats.refused_connects += 1;
            return Err(ConnectionError::Connect {
                addr: target.addr(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            });
        }
        state.stats.connects += 1;
        state.stats.live_transports += 1;
        Ok(Box::new(MemoryTransport {
            remote: self.clone(),
            broken: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct MemoryTransport {
    remote: MemoryRemote,
    broken: Arc<AtomicBool>,
}

impl MemoryTransport {
    fn check(&self) -> Result<(), TransportError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn open_exec(&mut self, command: &str) -> Result<Box<dyn ExecChannel>, TransportError> {
        self.check()?;
        self.remote
            .lock()
            .stats
            .commands
            .push(command.to_string());
        let script = self.remote.script_for(command);
        let state = self.remote.lock();
        Ok(Box::new(MemoryProcess {
            unwritten_out: script.stdout.into(),
            unwritten_err: script.stderr.into(),
            pipe_out: VecDeque::new(),
            pipe_err: VecDeque::new(),
            capacity: state.pipe_capacity.unwrap_or(DEFAULT_PIPE_CAPACITY),
            window: state.send_window.unwrap_or(usize::MAX),
            echo_input: script.echo_input,
            input_done: false,
            exit_code: script.exit_code,
            broken: Arc::clone(&self.broken),
        }))
    }

    fn open_file_channel(&mut self) -> Result<Box<dyn FileChannel>, TransportError> {
        self.check()?;
        Ok(Box::new(MemoryFiles {
            remote: self.remote.clone(),
            broken: Arc::clone(&self.broken),
        }))
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.remote.lock().stats.disconnects += 1;
        self.check()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut state = self.remote.lock();
        state.stats.live_transports = state.stats.live_transports.saturating_sub(1);
    }
}

struct MemoryProcess {
    unwritten_out: VecDeque<u8>,
    unwritten_err: VecDeque<u8>,
    pipe_out: VecDeque<u8>,
    pipe_err: VecDeque<u8>,
    capacity: usize,
    window: usize,
    echo_input: bool,
    input_done: bool,
    exit_code: i32,
    broken: Arc<AtomicBool>,
}

impl MemoryProcess {
    fn check(&self) -> Result<(), TransportError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn pump(&mut self) {
        fill(&mut self.unwritten_out, &mut self.pipe_out, self.capacity);
        fill(&mut self.unwritten_err, &mut self.pipe_err, self.capacity);
    }
}

fn fill(source: &mut VecDeque<u8>, pipe: &mut VecDeque<u8>, capacity: usize) {
    let room = capacity.saturating_sub(pipe.len()).min(source.len());
    pipe.extend(source.drain(..room));
}

fn read_pipe(pipe: &mut VecDeque<u8>, buf: &mut [u8]) -> usize {
    let n = pipe.len().min(buf.len());
    for (slot, byte) in buf.iter_mut().zip(pipe.drain(..n)) {
        *slot = byte;
    }
    n
}

impl ExecChannel for MemoryProcess {
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.check()?;
        let n = data.len().min(self.window);
        if self.echo_input {
            self.unwritten_out.extend(&data[..n]);
        }
        Ok(n)
    }

    fn finish_input(&mut self) -> Result<(), TransportError> {
        self.check()?;
        self.input_done = true;
        Ok(())
    }

    fn recv_stdout(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.check()?;
        self.pump();
        Ok(read_pipe(&mut self.pipe_out, buf))
    }

    fn recv_stderr(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.check()?;
        self.pump();
        Ok(read_pipe(&mut self.pipe_err, buf))
    }

    fn exit_status(&mut self) -> Result<Option<i32>, TransportError> {
        self.check()?;
        self.pump();
        let exited =
            self.input_done && self.unwritten_out.is_empty() && self.unwritten_err.is_empty();
        Ok(exited.then_some(self.exit_code))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct MemoryFiles {
    remote: MemoryRemote,
    broken: Arc<AtomicBool>,
}

impl MemoryFiles {
    fn check(&self, path: &str) -> Result<(), TransferError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(TransferError::transport(path, TransportError::Closed));
        }
        Ok(())
    }
}

fn refused(path: &str) -> TransferError {
    TransferError::transport(path, TransportError::Protocol("permission denied".to_string()))
}

fn not_found(path: &str) -> TransferError {
    TransferError::NotFound {
        path: path.to_string(),
    }
}

impl FileChannel for MemoryFiles {
    fn list(&mut self, path: &str) -> Result<Vec<String>, TransferError> {
        self.check(path)?;
        let dir = normalize(path);
        {
            let state = self.remote.lock();
            if state.vanishing_dirs.contains(&dir) || !state.dirs.contains(&dir) {
                return Err(not_found(path));
            }
        }
        Ok(self.remote.files_in(&dir))
    }

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>, TransferError> {
        self.check(path)?;
        let key = normalize(path);
        let mut state = self.remote.lock();
        let data = state.files.get(&key).cloned().ok_or_else(|| not_found(path))?;
        let fail_after = state.interrupted_reads.remove(&key);
        Ok(Box::new(MemoryReader {
            data: io::Cursor::new(data),
            fail_after,
            broken: Arc::clone(&self.broken),
        }))
    }

    fn create(&mut self, path: &str) -> Result<Box<dyn Write + Send>, TransferError> {
        self.check(path)?;
        let key = normalize(path);
        let mut state = self.remote.lock();
        if !state.dirs.contains(&parent_of(&key)) {
            return Err(not_found(path));
        }
        state.files.insert(key.clone(), Vec::new());
        Ok(Box::new(MemoryWriter {
            remote: self.remote.clone(),
            path: key,
            broken: Arc::clone(&self.broken),
        }))
    }

    fn remove(&mut self, path: &str) -> Result<(), TransferError> {
        self.check(path)?;
        let key = normalize(path);
        let mut state = self.remote.lock();
        if state.failing_removes.remove(&key) {
            return Err(refused(path));
        }
        state
            .files
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), TransferError> {
        self.check(from)?;
        let mut state = self.remote.lock();
        if state.failing_renames.remove(&normalize(to)) {
            return Err(refused(from));
        }
        let data = state
            .files
            .remove(&normalize(from))
            .ok_or_else(|| not_found(from))?;
        state.files.insert(normalize(to), data);
        Ok(())
    }

    fn size(&mut self, path: &str) -> Result<Option<u64>, TransferError> {
        self.check(path)?;
        self.remote
            .lock()
            .files
            .get(&normalize(path))
            .map(|data| Some(data.len() as u64))
            .ok_or_else(|| not_found(path))
    }
}

struct MemoryReader {
    data: io::Cursor<Vec<u8>>,
    fail_after: Option<usize>,
    broken: Arc<AtomicBool>,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed"));
        }
        let position = self.data.position() as usize;
        if let Some(limit) = self.fail_after {
            if position >= limit {
                self.broken.store(true, Ordering::SeqCst);
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                ));
            }
            let allowed = (limit - position).min(buf.len());
            return self.data.read(&mut buf[..allowed]);
        }
        self.data.read(buf)
    }
}

struct MemoryWriter {
    remote: MemoryRemote,
    path: String,
    broken: Arc<AtomicBool>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed"));
        }
        let mut state = self.remote.lock();
        match state.files.get_mut(&self.path) {
            Some(data) => {
                data.extend_from_slice(buf);
                Ok(buf.len())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "file removed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Credential;

    fn target() -> SessionTarget {
        SessionTarget::new("vulnbox", "root", Credential::Password("secret".to_string()))
    }

    #[test]
    fn refused_connects_are_counted_then_succeed() {
        let remote = MemoryRemote::new();
        remote.refuse_next_connects(1);
        assert!(remote.connect(&target()).is_err());
        let transport = remote.connect(&target()).unwrap();
        let stats = remote.stats();
        assert_eq!(stats.refused_connects, 1);
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.live_transports, 1);
        drop(transport);
        assert_eq!(remote.stats().live_transports, 0);
    }

    #[test]
    fn late_directory_appears_after_checks() {
        let remote = MemoryRemote::new();
        remote.create_dir_after_checks("/dumps", 2);
        assert!(!remote.path_exists("/dumps"));
        assert!(!remote.path_exists("/dumps"));
        assert!(remote.path_exists("/dumps"));
        assert!(remote.path_exists("/dumps/"));
    }

    #[test]
    fn files_in_lists_direct_children_only() {
        let remote = MemoryRemote::new();
        remote.add_file("/dumps/a.pcap.gz", b"a".to_vec());
        remote.add_file("/dumps/nested/b.pcap.gz", b"b".to_vec());
        assert_eq!(remote.files_in("/dumps"), vec!["a.pcap.gz".to_string()]);
    }

    #[test]
    fn interrupted_read_breaks_the_transport() {
        let remote = MemoryRemote::new();
        remote.add_file("/dumps/a.pcap.gz", vec![7u8; 100]);
        remote.interrupt_read("/dumps/a.pcap.gz", 10);
        let mut transport = remote.connect(&target()).unwrap();
        let mut files = transport.open_file_channel().unwrap();
        let mut reader = files.open_read("/dumps/a.pcap.gz").unwrap();
        let mut buf = Vec::new();
        let err = reader.read_to_end(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(buf.len(), 10);
        assert!(files.list("/dumps").is_err());
        assert!(transport.open_exec("true").is_err());
    }

    #[test]
    fn injected_remove_and_rename_failures_fire_once() {
        let remote = MemoryRemote::new();
        remote.add_file("/dumps/a.pcap.gz", b"a".to_vec());
        remote.fail_remove("/dumps/a.pcap.gz");
        remote.fail_rename("/dumps/b.pcap.gz");
        let mut transport = remote.connect(&target()).unwrap();
        let mut files = transport.open_file_channel().unwrap();

        assert!(files.remove("/dumps/a.pcap.gz").is_err());
        assert!(files.rename("/dumps/a.pcap.gz", "/dumps/b.pcap.gz").is_err());
        assert_eq!(remote.files_in("/dumps"), vec!["a.pcap.gz".to_string()]);
        assert!(files.list("/dumps").is_ok());

        files.rename("/dumps/a.pcap.gz", "/dumps/b.pcap.gz").unwrap();
        files.remove("/dumps/b.pcap.gz").unwrap();
        assert!(remote.files_in("/dumps").is_empty());
    }
}
