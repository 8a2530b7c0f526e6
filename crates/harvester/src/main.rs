mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use harvester::logging::init_tracing;
use harvester::{HarvestWorker, HarvesterConfig, HealthCheck, HttpIngestor};
use remote_session::{with_session, SshConnector};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::{Args, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log_guard = init_tracing(args.log_dir.as_deref())?;
    let config = HarvesterConfig::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;

    let code = match args.command {
        Command::Run { once } => run(config, once).await?,
        Command::Check => check(config).await?,
        Command::Exec { command } => exec(config, command.join(" ")).await?,
    };
    if code != 0 {
        drop(log_guard);
        std::process::exit(code);
    }
    Ok(())
}

async fn run(config: HarvesterConfig, once: bool) -> anyhow::Result<i32> {
    let worker_config = config
        .worker_config()
        .context("failed to resolve storage directories")?;
    let ingestor =
        HttpIngestor::new(&config.ingest).context("failed to build ingestion client")?;
    info!(
        remote = %worker_config.target,
        dumps_dir = %worker_config.remote_dir,
        data_dir = %config.storage.data_dir.display(),
        ingest_url = %config.ingest.url,
        "harvester starting"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(shutdown.clone()));
    let worker = HarvestWorker::new(
        Arc::new(SshConnector),
        Arc::new(ingestor),
        worker_config,
        shutdown,
    );
    let outcome = if once {
        worker.run_once().await.map(|_| ())
    } else {
        worker.run().await
    };
    if let Err(err) = outcome {
        error!(error = %err, "harvester stopped on an unrecoverable error");
        return Err(err.into());
    }
    Ok(0)
}

async fn check(config: HarvesterConfig) -> anyhow::Result<i32> {
    let health =
        HealthCheck::from_config(&config).context("failed to resolve storage directories")?;
    let target = config.session_target();
    let options = config.session_options();
    let report =
        tokio::task::spawn_blocking(move || health.run(&SshConnector, &target, options)).await?;
    println!("{report}");
    Ok(if report.is_healthy() { 0 } else { 1 })
}

async fn exec(config: HarvesterConfig, command: String) -> anyhow::Result<i32> {
    let target = config.session_target();
    let mut options = config.session_options();
    options.echo_commands = true;
    let code = tokio::task::spawn_blocking(move || {
        with_session(&SshConnector, &target, options, |session| {
            Ok::<_, anyhow::Error>(session.call(&command, b"")?)
        })
    })
    .await??;
    Ok(code)
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM, only ctrl-c stops the harvester");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
    shutdown.cancel();
}
