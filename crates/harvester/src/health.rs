use std::fmt;
use std::path::Path;

use remote_session::paths::shell_quote;
use remote_session::{Connector, RemoteSession, SessionOptions, SessionTarget};

use crate::config::HarvesterConfig;
use crate::layout::{complete_files, LocalLayout};

// A steady-state pipeline drains each cycle, so anything above these means a
// stage is stuck.
const MAX_REMOTE_BACKLOG: usize = 2;
const MAX_STAGED: usize = 1;
const MIN_BACKUPS: usize = 1;

#[derive(Debug, Default)]
pub struct HealthReport {
    pub problems: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.problems.is_empty()
    }

    fn fail(&mut self, problem: impl Into<String>) {
        self.problems.push(problem.into());
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_healthy() {
            return write!(f, "ok");
        }
        for (index, problem) in self.problems.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "FAIL {problem}")?;
        }
        Ok(())
    }
}

/// Verifies that every stage of the pipeline is moving.
#[derive(Clone, Debug)]
pub struct HealthCheck {
    pub remote_dir: String,
    pub process_name: String,
    pub archive_extension: String,
    pub capture_extension: String,
    pub layout: LocalLayout,
}

impl HealthCheck {
    pub fn from_config(config: &HarvesterConfig) -> std::io::Result<Self> {
        Ok(Self {
            remote_dir: config.capture.dumps_dir.clone(),
            process_name: config.capture.process_name.clone(),
            archive_extension: config.capture.archive_extension.clone(),
            capture_extension: config.capture.capture_extension.clone(),
            layout: config.layout()?,
        })
    }

    /// Runs every check. A host that cannot be reached is reported, not
    /// returned as an error.
    pub fn run(
        &self,
        connector: &dyn Connector,
        target: &SessionTarget,
        options: SessionOptions,
    ) -> HealthReport {
        let mut report = HealthReport::default();
        match RemoteSession::open(connector, target, options) {
            Ok(mut session) => {
                self.check_remote(&mut session, &mut report);
                session.close();
            }
            Err(err) => report.fail(format!("cannot reach {target}: {err}")),
        }
        self.check_local(&mut report);
        report
    }

    pub fn check_remote(&self, session: &mut RemoteSession, report: &mut HealthReport) {
        let pgrep = format!("pgrep {}", shell_quote(&self.process_name));
        if let Err(err) = session.execute_checked(&pgrep, b"") {
            report.fail(format!("{} is not running: {err}", self.process_name));
        }
        match session.list(&self.remote_dir) {
            Ok(entries) if entries.len() > MAX_REMOTE_BACKLOG => report.fail(format!(
                "{} holds {} entries, expected at most {MAX_REMOTE_BACKLOG}",
                self.remote_dir,
                entries.len()
            )),
            Ok(_) => {}
            Err(err) => report.fail(format!("cannot list {}: {err}", self.remote_dir)),
        }
    }

    pub fn check_local(&self, report: &mut HealthReport) {
        let layout = &self.layout;
        if let Some(files) = staged(&layout.compressed, report) {
            if files.len() > MAX_STAGED {
                report.fail(too_many(&layout.compressed, files.len()));
            }
            expect_extension(&layout.compressed, &files, &self.archive_extension, report);
        }
        if let Some(files) = staged(&layout.extracted, report) {
            if files.len() > MAX_STAGED {
                report.fail(too_many(&layout.extracted, files.len()));
            }
            expect_extension(&layout.extracted, &files, &self.capture_extension, report);
        }
        if let Some(files) = staged(&layout.backup, report) {
            if files.len() < MIN_BACKUPS {
                report.fail(format!(
                    "{} is empty, nothing has been forwarded yet",
                    layout.backup.display()
                ));
            }
            expect_extension(&layout.backup, &files, &self.capture_extension, report);
        }
    }
}

fn staged(dir: &Path, report: &mut HealthReport) -> Option<Vec<String>> {
    match complete_files(dir) {
        Ok(files) => Some(files),
        Err(err) => {
            report.fail(format!("cannot read {}: {err}", dir.display()));
            None
        }
    }
}

fn too_many(dir: &Path, count: usize) -> String {
    format!(
        "{} holds {count} files, expected at most {MAX_STAGED}",
        dir.display()
    )
}

fn expect_extension(dir: &Path, files: &[String], extension: &str, report: &mut HealthReport) {
    for name in files.iter().filter(|name| !name.ends_with(extension)) {
        report.fail(format!(
            "unexpected file {name} in {}, expected {extension}",
            dir.display()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_session::memory::{MemoryRemote, ScriptedCommand};
    use remote_session::Credential;
    use std::fs;
    use std::time::Duration;

    fn check(root: &Path) -> HealthCheck {
        let layout = LocalLayout::under(root).unwrap();
        layout.prepare().unwrap();
        HealthCheck {
            remote_dir: "/dumps".to_string(),
            process_name: "tcpdump".to_string(),
            archive_extension: ".gz".to_string(),
            capture_extension: ".pcap".to_string(),
            layout,
        }
    }

    fn target() -> SessionTarget {
        SessionTarget::new("vulnbox", "root", Credential::Password("pw".to_string()))
    }

    fn options() -> SessionOptions {
        SessionOptions {
            poll_interval: Duration::ZERO,
            echo_commands: false,
        }
    }

    #[test]
    fn healthy_pipeline_reports_ok() {
        let root = tempfile::tempdir().unwrap();
        let check = check(root.path());
        fs::write(check.layout.backup.join("a.pcap"), b"x").unwrap();
        let remote = MemoryRemote::new();
        remote.on_command("pgrep tcpdump", ScriptedCommand::exit(0).stdout("42\n"));
        remote.add_file("/dumps/c.pcap.gz", b"x".to_vec());

        let report = check.run(&remote, &target(), options());
        assert!(report.is_healthy(), "{report}");
        assert_eq!(report.to_string(), "ok");
    }

    #[test]
    fn stuck_stages_are_reported() {
        let root = tempfile::tempdir().unwrap();
        let check = check(root.path());
        fs::write(check.layout.compressed.join("a.pcap.gz"), b"x").unwrap();
        fs::write(check.layout.compressed.join("b.pcap.gz"), b"x").unwrap();
        fs::write(check.layout.extracted.join("notes.txt"), b"x").unwrap();
        let remote = MemoryRemote::new();
        remote.on_command("pgrep tcpdump", ScriptedCommand::exit(1));
        for name in ["a", "b", "c"] {
            remote.add_file(&format!("/dumps/{name}.pcap.gz"), b"x".to_vec());
        }

        let report = check.run(&remote, &target(), options());
        let problems = report.problems.join("\n");
        assert!(problems.contains("tcpdump is not running"));
        assert!(problems.contains("/dumps holds 3 entries"));
        assert!(problems.contains("holds 2 files"));
        assert!(problems.contains("unexpected file notes.txt"));
        assert!(problems.contains("nothing has been forwarded yet"));
        assert_eq!(report.problems.len(), 5);
    }

    #[test]
    fn unreachable_host_is_a_finding() {
        let root = tempfile::tempdir().unwrap();
        let check = check(root.path());
        fs::write(check.layout.backup.join("a.pcap"), b"x").unwrap();
        let remote = MemoryRemote::new();
        remote.refuse_next_connects(1);

        let report = check.run(&remote, &target(), options());
        assert_eq!(report.problems.len(), 1);
        assert!(report.problems[0].starts_with("cannot reach root@vulnbox:22"));
    }
}
