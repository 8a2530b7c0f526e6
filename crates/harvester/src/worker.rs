use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use remote_session::paths::{join_remote, partial_local};
use remote_session::{
    with_session, ConnectionError, Connector, ExecError, RemoteSession, SessionOptions,
    SessionTarget,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::{extracted_name, gunzip};
use crate::ingest::Ingestor;
use crate::layout::{complete_files, LocalLayout};

/// Everything one worker needs, resolved from configuration at startup.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub target: SessionTarget,
    pub session: SessionOptions,
    pub remote_dir: String,
    pub archive_extension: String,
    pub layout: LocalLayout,
    pub interval: Duration,
    pub retry_interval: Duration,
    pub dir_poll_interval: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connecting,
    WaitingForRemoteDirectory,
    Syncing,
    Sleeping,
}

/// What one cycle moved. Names are bare file names, not paths.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub downloaded: Vec<String>,
    pub transfer_interrupted: bool,
    pub extracted: Vec<String>,
    pub forwarded: Vec<String>,
    pub rejected: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("session lost while waiting for {path}: {source}")]
    SessionLost {
        path: String,
        #[source]
        source: ExecError,
    },
    #[error("remote directory {path} disappeared after it was found")]
    DirectoryVanished { path: String },
    #[error("cancelled")]
    Cancelled,
    #[error("harvest task failed: {0}")]
    Task(#[from] JoinError),
}

/// Conditions that stop the worker for good.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("failed to prepare local storage: {0}")]
    Storage(#[source] io::Error),
    #[error("remote directory {path} disappeared after it was found")]
    DirectoryVanished { path: String },
    #[error("harvest task failed: {0}")]
    Task(#[source] JoinError),
}

pub struct HarvestWorker {
    connector: Arc<dyn Connector>,
    ingestor: Arc<dyn Ingestor>,
    config: Arc<WorkerConfig>,
    shutdown: CancellationToken,
    state: Arc<watch::Sender<WorkerState>>,
}

impl HarvestWorker {
    pub fn new(
        connector: Arc<dyn Connector>,
        ingestor: Arc<dyn Ingestor>,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Disconnected);
        Self {
            connector,
            ingestor,
            config: Arc::new(config),
            shutdown,
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Harvests until the shutdown token fires or an unrecoverable error.
    pub async fn run(&self) -> Result<(), HarvestError> {
        self.drive(false).await.map(|_| ())
    }

    /// Retries connection failures until one cycle completes. Returns `None`
    /// when shut down before that happened.
    pub async fn run_once(&self) -> Result<Option<CycleReport>, HarvestError> {
        self.drive(true).await
    }

    async fn drive(&self, once: bool) -> Result<Option<CycleReport>, HarvestError> {
        self.config.layout.prepare().map_err(HarvestError::Storage)?;
        let remote = self.config.target.to_string();
        let outcome = loop {
            if self.shutdown.is_cancelled() {
                break Ok(None);
            }
            let delay = match self.run_cycle().await {
                Ok(report) => {
                    info!(
                        event = "harvest.cycle.done",
                        downloaded = report.downloaded.len(),
                        extracted = report.extracted.len(),
                        forwarded = report.forwarded.len(),
                        rejected = report.rejected.len(),
                        interrupted = report.transfer_interrupted,
                        "harvest cycle finished"
                    );
                    if once {
                        break Ok(Some(report));
                    }
                    self.config.interval
                }
                Err(CycleError::Connection(err)) => {
                    error!(
                        event = "harvest.connect.failed",
                        remote = %remote,
                        error = %err,
                        "error connecting to remote host, retrying"
                    );
                    self.config.retry_interval
                }
                Err(CycleError::SessionLost { path, source }) => {
                    warn!(
                        event = "harvest.session.lost",
                        remote = %remote,
                        path = %path,
                        error = %source,
                        "session lost before sync, retrying"
                    );
                    self.config.retry_interval
                }
                Err(CycleError::Cancelled) => break Ok(None),
                Err(CycleError::DirectoryVanished { path }) => {
                    break Err(HarvestError::DirectoryVanished { path })
                }
                Err(CycleError::Task(err)) => break Err(HarvestError::Task(err)),
            };
            self.enter(WorkerState::Sleeping);
            debug!(delay = ?delay, "sleeping before next cycle");
            if wait_or_shutdown(&self.shutdown, delay).await {
                break Ok(None);
            }
        };
        self.enter(WorkerState::Disconnected);
        if self.shutdown.is_cancelled() {
            info!(event = "harvest.stopped", "harvest worker stopped");
        }
        outcome
    }

    /// One pass: pull what the remote holds, then drain local staging.
    /// Connection-level failures skip the local part.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let connector = Arc::clone(&self.connector);
        let config = Arc::clone(&self.config);
        let shutdown = self.shutdown.clone();
        let state = Arc::clone(&self.state);
        let (downloaded, transfer_interrupted) = tokio::task::spawn_blocking(move || {
            pull_archives(connector.as_ref(), &config, &shutdown, &state)
        })
        .await??;

        let config = Arc::clone(&self.config);
        let extracted = tokio::task::spawn_blocking(move || extract_archives(&config)).await?;
        let (forwarded, rejected) = self.forward_captures().await;

        Ok(CycleReport {
            downloaded,
            transfer_interrupted,
            extracted,
            forwarded,
            rejected,
        })
    }

    async fn forward_captures(&self) -> (Vec<String>, Vec<String>) {
        let layout = &self.config.layout;
        let mut forwarded = Vec::new();
        let mut rejected = Vec::new();
        let names = match complete_files(&layout.extracted) {
            Ok(names) => names,
            Err(err) => {
                error!(
                    path = %layout.extracted.display(),
                    error = %err,
                    "failed to list extracted captures"
                );
                return (forwarded, rejected);
            }
        };
        for name in names {
            let working = layout.extracted.join(&name);
            if let Err(err) = self.ingestor.forward(&working).await {
                error!(
                    event = "harvest.forward.failed",
                    file = %name,
                    error = %err,
                    "capture not accepted, keeping it for the next cycle"
                );
                rejected.push(name);
                continue;
            }
            let backup = layout.backup.join(&name);
            match back_up(&working, &backup).await {
                Ok(()) => {
                    info!(event = "harvest.forward.done", file = %name, "capture forwarded");
                    forwarded.push(name);
                }
                Err(err) => error!(
                    event = "harvest.backup.failed",
                    file = %name,
                    error = %err,
                    "capture forwarded but backup failed, it will be forwarded again"
                ),
            }
        }
        (forwarded, rejected)
    }

    fn enter(&self, next: WorkerState) {
        enter(&self.state, next);
    }
}

fn enter(state: &watch::Sender<WorkerState>, next: WorkerState) {
    let previous = state.send_replace(next);
    if previous != next {
        debug!(from = ?previous, to = ?next, "worker state changed");
    }
}

async fn wait_or_shutdown(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

fn pull_archives(
    connector: &dyn Connector,
    config: &WorkerConfig,
    shutdown: &CancellationToken,
    state: &watch::Sender<WorkerState>,
) -> Result<(Vec<String>, bool), CycleError> {
    if shutdown.is_cancelled() {
        return Err(CycleError::Cancelled);
    }
    enter(state, WorkerState::Connecting);
    with_session(connector, &config.target, config.session.clone(), |session| {
        enter(state, WorkerState::WaitingForRemoteDirectory);
        wait_for_directory(session, config, shutdown)?;
        enter(state, WorkerState::Syncing);
        download_archives(session, config)
    })
}

fn wait_for_directory(
    session: &mut RemoteSession,
    config: &WorkerConfig,
    shutdown: &CancellationToken,
) -> Result<(), CycleError> {
    let dir = &config.remote_dir;
    let mut announced = false;
    loop {
        if shutdown.is_cancelled() {
            return Err(CycleError::Cancelled);
        }
        match session.exists(dir) {
            Ok(true) => return Ok(()),
            Ok(false) if !announced => {
                warn!(path = %dir, "missing remote dumps directory, waiting for its creation");
                announced = true;
            }
            Ok(false) => debug!(path = %dir, "remote dumps directory still missing"),
            Err(source) => {
                return Err(CycleError::SessionLost {
                    path: dir.clone(),
                    source,
                })
            }
        }
        thread::sleep(config.dir_poll_interval);
    }
}

/// Downloads every archive in the remote directory, removing each remote copy
/// only after its local copy is complete. The first failure ends the pass; the
/// returned flag reports it.
fn download_archives(
    session: &mut RemoteSession,
    config: &WorkerConfig,
) -> Result<(Vec<String>, bool), CycleError> {
    let dir = &config.remote_dir;
    let mut downloaded = Vec::new();
    let names = match session.list(dir) {
        Ok(names) => names,
        Err(err) if err.is_not_found() => {
            return Err(CycleError::DirectoryVanished { path: dir.clone() })
        }
        Err(err) => {
            warn!(
                event = "harvest.sync.interrupted",
                path = %dir,
                error = %err,
                "failed to list remote dumps"
            );
            return Ok((downloaded, true));
        }
    };
    let mut archives = Vec::new();
    for name in names {
        if extracted_name(&name, &config.archive_extension).is_some() {
            archives.push(name);
        } else if name.ends_with(&config.archive_extension) {
            warn!(
                event = "harvest.sync.skipped",
                file = %name,
                "archive name cannot be staged locally, leaving it on the remote"
            );
        }
    }
    archives.sort();
    for name in archives {
        let remote = join_remote(dir, &name);
        let local = config.layout.compressed.join(&name);
        match session.get(&remote, &local) {
            Ok(bytes) => debug!(file = %name, bytes, "archive downloaded"),
            Err(err) => {
                warn!(
                    event = "harvest.sync.interrupted",
                    file = %name,
                    error = %err,
                    "download failed, continuing with what was already fetched"
                );
                return Ok((downloaded, true));
            }
        }
        // The local copy is complete, so it is kept even if the remote one
        // cannot be removed; a duplicate is preferable to a lost capture.
        if let Err(err) = session.remove(&remote) {
            warn!(
                event = "harvest.sync.interrupted",
                file = %name,
                error = %err,
                "failed to remove remote archive after download"
            );
            return Ok((downloaded, true));
        }
        info!(event = "harvest.download.done", file = %name, "archive harvested");
        downloaded.push(name);
    }
    Ok((downloaded, false))
}

fn extract_archives(config: &WorkerConfig) -> Vec<String> {
    let layout = &config.layout;
    let mut extracted = Vec::new();
    let names = match complete_files(&layout.compressed) {
        Ok(names) => names,
        Err(err) => {
            error!(
                path = %layout.compressed.display(),
                error = %err,
                "failed to list compressed archives"
            );
            return extracted;
        }
    };
    for name in names {
        let Some(stem) = extracted_name(&name, &config.archive_extension) else {
            debug!(file = %name, "ignoring unexpected file in compressed staging");
            continue;
        };
        let source = layout.compressed.join(&name);
        let dest = layout.extracted.join(stem);
        let result = gunzip(&source, &dest).and_then(|bytes| {
            std::fs::remove_file(&source)?;
            Ok(bytes)
        });
        match result {
            Ok(bytes) => {
                debug!(file = %name, bytes, "archive extracted");
                extracted.push(stem.to_string());
            }
            Err(err) => error!(
                event = "harvest.extract.failed",
                file = %name,
                error = %err,
                "failed to extract archive, leaving it for the next cycle"
            ),
        }
    }
    extracted
}

/// Copies `working` into backup storage and only then deletes it.
async fn back_up(working: &Path, backup: &Path) -> io::Result<()> {
    let partial = partial_local(backup);
    if let Err(err) = tokio::fs::copy(working, &partial).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(err);
    }
    tokio::fs::rename(&partial, backup).await?;
    tokio::fs::remove_file(working).await
}
