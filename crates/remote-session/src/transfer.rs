use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::TransferError;
use crate::paths::{partial_local, partial_remote};
use crate::session::RemoteSession;
use crate::transport::FileChannel;

const COPY_CHUNK: usize = 64 * 1024;

/// File operations over the session's single transfer sub-channel.
///
/// `get` and `put` stage into a `.tmp` sibling and only move the data onto the
/// requested name once the byte count checks out, so a failed transfer never
/// leaves a plausible-looking file behind.
impl RemoteSession {
    pub fn list(&mut self, path: &str) -> Result<Vec<String>, TransferError> {
        self.file_channel()
            .map_err(|err| TransferError::transport(path, err))?
            .list(path)
    }

    /// Downloads `remote` to `local` and returns the number of bytes written.
    pub fn get(&mut self, remote: &str, local: &Path) -> Result<u64, TransferError> {
        debug!(remote, local = %local.display(), "downloading file");
        let partial = partial_local(local);
        let files = self
            .file_channel()
            .map_err(|err| TransferError::transport(remote, err))?;
        let outcome = download_into(files, remote, &partial).and_then(|bytes| {
            fs::rename(&partial, local)
                .map(|()| bytes)
                .map_err(|err| TransferError::local(local, err))
        });
        if outcome.is_err() {
            discard_local(&partial);
        }
        outcome
    }

    /// Uploads `local` to `remote`, replacing any existing file there.
    pub fn put(&mut self, local: &Path, remote: &str) -> Result<u64, TransferError> {
        debug!(local = %local.display(), remote, "uploading file");
        let partial = partial_remote(remote);
        let files = self
            .file_channel()
            .map_err(|err| TransferError::transport(remote, err))?;
        let replaced = upload_into(files, local, &partial).and_then(|bytes| {
            match files.remove(remote) {
                Ok(()) => Ok(bytes),
                Err(err) if err.is_not_found() => Ok(bytes),
                Err(err) => Err(err),
            }
        });
        let bytes = match replaced {
            Ok(bytes) => bytes,
            Err(err) => {
                if let Err(err) = files.remove(&partial) {
                    debug!(remote = %partial, error = %err, "could not remove partial upload");
                }
                return Err(err);
            }
        };
        // The old file is already gone, so the upload is the only copy left.
        files.rename(&partial, remote).map(|()| bytes).map_err(|err| {
            warn!(remote, partial = %partial, error = %err, "rename failed, keeping uploaded file");
            err
        })
    }

    pub fn remove(&mut self, remote: &str) -> Result<(), TransferError> {
        debug!(remote, "removing remote file");
        self.file_channel()
            .map_err(|err| TransferError::transport(remote, err))?
            .remove(remote)
    }
}

fn download_into(
    files: &mut dyn FileChannel,
    remote: &str,
    partial: &Path,
) -> Result<u64, TransferError> {
    let expected = files.size(remote)?;
    let mut reader = files.open_read(remote)?;
    let mut file = File::create(partial).map_err(|err| TransferError::local(partial, err))?;
    let copied = pump(
        &mut reader,
        &mut file,
        |err| TransferError::transport(remote, err),
        |err| TransferError::local(partial, err),
    )?;
    if let Some(expected) = expected {
        if copied != expected {
            return Err(TransferError::Incomplete {
                path: remote.to_string(),
                expected,
                actual: copied,
            });
        }
    }
    file.sync_all()
        .map_err(|err| TransferError::local(partial, err))?;
    Ok(copied)
}

fn upload_into(
    files: &mut dyn FileChannel,
    local: &Path,
    partial: &str,
) -> Result<u64, TransferError> {
    let mut source = File::open(local).map_err(|err| TransferError::local(local, err))?;
    let expected = source
        .metadata()
        .map_err(|err| TransferError::local(local, err))?
        .len();
    let mut writer = files.create(partial)?;
    let copied = pump(
        &mut source,
        &mut writer,
        |err| TransferError::local(local, err),
        |err| TransferError::transport(partial, err),
    )?;
    drop(writer);
    if copied != expected {
        return Err(TransferError::Incomplete {
            path: partial.to_string(),
            expected,
            actual: copied,
        });
    }
    Ok(copied)
}

fn pump<R, W, RE, WE>(
    reader: &mut R,
    writer: &mut W,
    read_error: RE,
    write_error: WE,
) -> Result<u64, TransferError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
    RE: Fn(io::Error) -> TransferError,
    WE: Fn(io::Error) -> TransferError,
{
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(read_error(err)),
        };
        writer.write_all(&buf[..n]).map_err(&write_error)?;
        total += n as u64;
    }
    writer.flush().map_err(&write_error)?;
    Ok(total)
}

fn discard_local(partial: &Path) {
    match fs::remove_file(partial) {
        Ok(()) => debug!(path = %partial.display(), "removed partial download"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(
            path = %partial.display(),
            error = %err,
            "failed to remove partial download"
        ),
    }
}
