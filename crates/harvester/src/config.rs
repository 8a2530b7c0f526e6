use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use remote_session::paths::{is_partial, PARTIAL_SUFFIX};
use remote_session::{
    Credential, SessionOptions, SessionTarget, DEFAULT_CONNECT_TIMEOUT, DEFAULT_POLL_INTERVAL,
    DEFAULT_SSH_PORT,
};
use serde::{Deserialize, Deserializer};

use crate::layout::LocalLayout;
use crate::worker::WorkerConfig;

const DEFAULT_USER: &str = "root";
const DEFAULT_ARCHIVE_EXTENSION: &str = ".gz";
const DEFAULT_CAPTURE_EXTENSION: &str = ".pcap";
const DEFAULT_PROCESS_NAME: &str = "tcpdump";
const DEFAULT_DATA_DIR: &str = "/data";
const DEFAULT_INGEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_DIR_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Everything the harvester needs, loaded once at startup and passed down.
///
/// Unknown top-level tables are ignored so the file can be shared with the
/// other services of a deployment; unknown keys inside a known table are not.
#[derive(Debug, Deserialize)]
pub struct HarvesterConfig {
    pub remote: RemoteConfig,
    pub capture: CaptureConfig,
    pub ingest: IngestConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub worker: WorkerTimings,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    pub password: Option<String>,
    pub key_file: Option<PathBuf>,
    pub passphrase: Option<String>,
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub connect_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    pub dumps_dir: String,
    #[serde(default = "default_archive_extension")]
    pub archive_extension: String,
    #[serde(default = "default_capture_extension")]
    pub capture_extension: String,
    #[serde(default = "default_process_name")]
    pub process_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(
        default = "default_ingest_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerTimings {
    #[serde(default = "default_interval", deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    #[serde(
        default = "default_retry_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub retry_interval: Duration,
    #[serde(
        default = "default_dir_poll_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub dir_poll_interval: Duration,
    #[serde(
        default = "default_command_poll_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub command_poll_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for WorkerTimings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            dir_poll_interval: DEFAULT_DIR_POLL_INTERVAL,
            command_poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_user() -> String {
    DEFAULT_USER.to_string()
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_archive_extension() -> String {
    DEFAULT_ARCHIVE_EXTENSION.to_string()
}

fn default_capture_extension() -> String {
    DEFAULT_CAPTURE_EXTENSION.to_string()
}

fn default_process_name() -> String {
    DEFAULT_PROCESS_NAME.to_string()
}

fn default_ingest_timeout() -> Duration {
    DEFAULT_INGEST_TIMEOUT
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_retry_interval() -> Duration {
    DEFAULT_RETRY_INTERVAL
}

fn default_dir_poll_interval() -> Duration {
    DEFAULT_DIR_POLL_INTERVAL
}

fn default_command_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

impl HarvesterConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: HarvesterConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.remote.host.trim().is_empty() {
            anyhow::bail!("remote.host must not be empty");
        }
        if self.remote.user.trim().is_empty() {
            anyhow::bail!("remote.user must not be empty");
        }
        if self.remote.password.is_some() && self.remote.key_file.is_some() {
            anyhow::bail!("remote.password and remote.key_file are mutually exclusive");
        }
        if self.remote.passphrase.is_some() && self.remote.key_file.is_none() {
            anyhow::bail!("remote.passphrase requires remote.key_file");
        }
        if self.capture.dumps_dir.trim().is_empty() {
            anyhow::bail!("capture.dumps_dir must not be empty");
        }
        for (key, extension) in [
            ("capture.archive_extension", &self.capture.archive_extension),
            ("capture.capture_extension", &self.capture.capture_extension),
        ] {
            if !extension.starts_with('.') || extension.len() < 2 {
                anyhow::bail!("{key} must look like \".ext\", got {extension:?}");
            }
            if is_partial(extension) {
                anyhow::bail!("{key} must not end in the partial-file suffix {PARTIAL_SUFFIX:?}");
            }
        }
        if self.ingest.url.trim().is_empty() {
            anyhow::bail!("ingest.url must not be empty");
        }
        for (key, value) in [
            ("remote.connect_timeout", self.remote.connect_timeout),
            ("ingest.timeout", self.ingest.timeout),
            ("worker.interval", self.worker.interval),
            ("worker.retry_interval", self.worker.retry_interval),
            ("worker.dir_poll_interval", self.worker.dir_poll_interval),
            ("worker.command_poll_interval", self.worker.command_poll_interval),
        ] {
            if value.is_zero() {
                anyhow::bail!("{key} must be greater than zero");
            }
        }
        Ok(())
    }

    pub fn credential(&self) -> Credential {
        if let Some(password) = &self.remote.password {
            return Credential::Password(password.clone());
        }
        if let Some(path) = &self.remote.key_file {
            return Credential::KeyFile {
                path: path.clone(),
                passphrase: self.remote.passphrase.clone(),
            };
        }
        Credential::Agent
    }

    pub fn session_target(&self) -> SessionTarget {
        SessionTarget::new(&self.remote.host, &self.remote.user, self.credential())
            .with_port(self.remote.port)
            .with_connect_timeout(self.remote.connect_timeout)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            poll_interval: self.worker.command_poll_interval,
            echo_commands: false,
        }
    }

    pub fn layout(&self) -> std::io::Result<LocalLayout> {
        LocalLayout::under(&self.storage.data_dir)
    }

    pub fn worker_config(&self) -> std::io::Result<WorkerConfig> {
        Ok(WorkerConfig {
            target: self.session_target(),
            session: self.session_options(),
            remote_dir: self.capture.dumps_dir.clone(),
            archive_extension: self.capture.archive_extension.clone(),
            layout: self.layout()?,
            interval: self.worker.interval,
            retry_interval: self.worker.retry_interval,
            dir_poll_interval: self.worker.dir_poll_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[remote]
host = "10.60.2.1"
password = "hunter2"

[capture]
dumps_dir = "/dumps"

[ingest]
url = "http://caronte:3333/api/pcap/file"
"#;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: HarvesterConfig = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.remote.port, 22);
        assert_eq!(config.remote.user, "root");
        assert_eq!(config.remote.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.capture.archive_extension, ".gz");
        assert_eq!(config.capture.process_name, "tcpdump");
        assert_eq!(config.storage.data_dir, PathBuf::from("/data"));
        assert_eq!(config.worker.interval, Duration::from_secs(30));
        assert_eq!(config.worker.command_poll_interval, Duration::from_millis(100));
        assert!(matches!(config.credential(), Credential::Password(_)));
    }

    #[test]
    fn durations_use_humantime() {
        let input = format!("{MINIMAL}\n[worker]\ninterval = \"2m\"\nretry_interval = \"250ms\"\n");
        let config: HarvesterConfig = toml::from_str(&input).unwrap();
        assert_eq!(config.worker.interval, Duration::from_secs(120));
        assert_eq!(config.worker.retry_interval, Duration::from_millis(250));
        assert_eq!(config.worker.dir_poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn unrelated_sections_are_ignored() {
        let input = format!("{MINIMAL}\n[farm]\npassword = \"x\"\n[teams]\nmin_team = 1\n");
        let config: HarvesterConfig = toml::from_str(&input).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_key_inside_section_is_rejected() {
        let input = MINIMAL.replace("dumps_dir", "dump_folder");
        let parsed: Result<HarvesterConfig, _> = toml::from_str(&input);
        assert!(parsed.is_err());
    }

    #[test]
    fn password_and_key_file_conflict() {
        let input = MINIMAL.replace(
            "password = \"hunter2\"",
            "password = \"hunter2\"\nkey_file = \"/root/.ssh/id_ed25519\"",
        );
        let config: HarvesterConfig = toml::from_str(&input).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_credential_means_agent() {
        let input = MINIMAL.replace("password = \"hunter2\"", "");
        let config: HarvesterConfig = toml::from_str(&input).unwrap();
        config.validate().unwrap();
        assert!(matches!(config.credential(), Credential::Agent));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let input = format!("{MINIMAL}\n[worker]\ninterval = \"0s\"\n");
        let config: HarvesterConfig = toml::from_str(&input).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn extension_must_start_with_dot() {
        let input = MINIMAL.replace(
            "dumps_dir = \"/dumps\"",
            "dumps_dir = \"/dumps\"\narchive_extension = \"gz\"",
        );
        let config: HarvesterConfig = toml::from_str(&input).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_suffix_is_not_a_capture_extension() {
        let input = MINIMAL.replace(
            "dumps_dir = \"/dumps\"",
            "dumps_dir = \"/dumps\"\ncapture_extension = \".tmp\"",
        );
        let config: HarvesterConfig = toml::from_str(&input).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("capture.capture_extension"));
    }

    #[test]
    fn session_target_carries_port_and_timeout() {
        let input = MINIMAL.replace(
            "host = \"10.60.2.1\"",
            "host = \"10.60.2.1\"\nport = 2222\nconnect_timeout = \"3s\"",
        );
        let config: HarvesterConfig = toml::from_str(&input).unwrap();
        let target = config.session_target();
        assert_eq!(target.addr(), "10.60.2.1:2222");
        assert_eq!(target.connect_timeout, Duration::from_secs(3));
        assert_eq!(target.to_string(), "root@10.60.2.1:2222");
    }
}
