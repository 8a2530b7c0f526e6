use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "pcap-harvester",
    version,
    about = "Pulls packet captures from a remote host and forwards them for analysis"
)]
pub(crate) struct Args {
    #[arg(long, default_value = "config.toml")]
    pub(crate) config: PathBuf,
    /// Also write JSON logs, rotated daily, into this directory.
    #[arg(long)]
    pub(crate) log_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Harvest until interrupted.
    Run {
        /// Stop after the first completed cycle.
        #[arg(long, default_value_t = false)]
        once: bool,
    },
    /// Check that every stage of the pipeline is moving.
    Check,
    /// Run a command on the remote host and exit with its status.
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}
