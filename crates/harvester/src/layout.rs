use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use remote_session::paths::is_partial;
use tracing::{debug, info};

pub const COMPRESSED_DIR: &str = "compressed";
pub const EXTRACTED_DIR: &str = "uncompressed";
pub const BACKUP_DIR: &str = "backup";

/// The three local staging directories a capture passes through:
/// downloaded archives, extracted captures awaiting forwarding, and the
/// backup of everything that was accepted.
#[derive(Clone, Debug)]
pub struct LocalLayout {
    pub compressed: PathBuf,
    pub extracted: PathBuf,
    pub backup: PathBuf,
}

impl LocalLayout {
    /// Resolves the layout under `data_dir`. Paths are made absolute because
    /// the ingestion service receives them verbatim.
    pub fn under(data_dir: &Path) -> io::Result<Self> {
        let root = if data_dir.is_absolute() {
            data_dir.to_path_buf()
        } else {
            std::env::current_dir()?.join(data_dir)
        };
        Ok(Self {
            compressed: root.join(COMPRESSED_DIR),
            extracted: root.join(EXTRACTED_DIR),
            backup: root.join(BACKUP_DIR),
        })
    }

    pub fn dirs(&self) -> [&Path; 3] {
        [&self.compressed, &self.extracted, &self.backup]
    }

    /// Creates the directories and drops partial files left by an interrupted
    /// run. Returns how many partials were removed.
    pub fn prepare(&self) -> io::Result<usize> {
        let mut removed = 0;
        for dir in self.dirs() {
            fs::create_dir_all(dir)?;
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let name = entry.file_name();
                if !is_partial(&name.to_string_lossy()) || !entry.file_type()?.is_file() {
                    continue;
                }
                fs::remove_file(entry.path())?;
                debug!(path = %entry.path().display(), "removed stale partial file");
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "cleaned up partial files from a previous run");
        }
        Ok(removed)
    }
}

/// Sorted names of the complete regular files in `dir`.
pub fn complete_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_partial(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_creates_dirs_and_drops_partials() {
        let root = tempfile::tempdir().unwrap();
        let layout = LocalLayout::under(root.path()).unwrap();
        assert_eq!(layout.prepare().unwrap(), 0);
        for dir in layout.dirs() {
            assert!(dir.is_dir());
        }

        fs::write(layout.compressed.join("a.pcap.gz.tmp"), b"half").unwrap();
        fs::write(layout.extracted.join("a.pcap.tmp"), b"half").unwrap();
        fs::write(layout.extracted.join("b.pcap"), b"whole").unwrap();
        assert_eq!(layout.prepare().unwrap(), 2);
        assert_eq!(complete_files(&layout.compressed).unwrap(), Vec::<String>::new());
        assert_eq!(complete_files(&layout.extracted).unwrap(), vec!["b.pcap"]);
    }

    #[test]
    fn relative_data_dir_becomes_absolute() {
        let layout = LocalLayout::under(Path::new("data")).unwrap();
        assert!(layout.compressed.is_absolute());
        assert!(layout.backup.ends_with("data/backup"));
    }

    #[test]
    fn complete_files_are_sorted_and_skip_dirs() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("b"), b"").unwrap();
        fs::write(root.path().join("a"), b"").unwrap();
        fs::write(root.path().join("c.tmp"), b"").unwrap();
        fs::create_dir(root.path().join("nested")).unwrap();
        assert_eq!(complete_files(root.path()).unwrap(), vec!["a", "b"]);
    }
}
