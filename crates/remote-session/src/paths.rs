use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Suffix of files that are still being written. A file carrying it is never
/// treated as complete.
pub const PARTIAL_SUFFIX: &str = ".tmp";

pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

pub fn partial_remote(path: &str) -> String {
    format!("{path}{PARTIAL_SUFFIX}")
}

pub fn partial_local(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

pub fn is_partial(name: &str) -> bool {
    name.ends_with(PARTIAL_SUFFIX)
}

pub fn shell_quote(value: &str) -> String {
    shell_words::quote(value).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_remote_handles_trailing_slash() {
        assert_eq!(join_remote("/dumps", "a.gz"), "/dumps/a.gz");
        assert_eq!(join_remote("/dumps/", "a.gz"), "/dumps/a.gz");
    }

    #[test]
    fn partial_paths_append_suffix() {
        assert_eq!(partial_remote("/dumps/a.gz"), "/dumps/a.gz.tmp");
        assert_eq!(
            partial_local(Path::new("/data/compressed/a.pcap.gz")),
            PathBuf::from("/data/compressed/a.pcap.gz.tmp")
        );
        assert!(is_partial("a.pcap.gz.tmp"));
        assert!(!is_partial("a.pcap.gz"));
    }

    #[test]
    fn shell_quote_survives_spaces_and_quotes() {
        assert_eq!(shell_quote("plain"), "plain");
        let quoted = shell_quote("dir with 'quote'");
        assert_eq!(
            shell_words::split(&quoted).unwrap(),
            vec!["dir with 'quote'".to_string()]
        );
    }
}
