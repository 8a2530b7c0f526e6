//! Harvests compressed packet captures from a remote host, extracts them, and
//! hands them to an ingestion service, keeping a local backup of every
//! accepted capture.

pub mod archive;
pub mod config;
pub mod health;
pub mod ingest;
pub mod layout;
pub mod logging;
pub mod worker;

pub use config::HarvesterConfig;
pub use health::{HealthCheck, HealthReport};
pub use ingest::{HttpIngestor, IngestError, Ingestor};
pub use layout::LocalLayout;
pub use worker::{CycleError, CycleReport, HarvestError, HarvestWorker, WorkerConfig, WorkerState};
