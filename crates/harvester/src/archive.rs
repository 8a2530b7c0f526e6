use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use remote_session::paths::{is_partial, partial_local};

/// Name of the capture inside `archive`, or `None` when `archive` does not
/// carry `extension` or would leave an empty name once it is stripped.
/// Names ending in the partial suffix are refused too: staging treats those
/// as interrupted writes and would never forward them.
pub fn extracted_name<'a>(archive: &'a str, extension: &str) -> Option<&'a str> {
    archive
        .strip_suffix(extension)
        .filter(|stem| !stem.is_empty() && !is_partial(stem))
}

/// Decompresses the gzip `source` into `dest`, returning the extracted size.
/// `dest` only appears once the whole stream decoded cleanly.
pub fn gunzip(source: &Path, dest: &Path) -> io::Result<u64> {
    let partial = partial_local(dest);
    let result = decode_into(source, &partial).and_then(|bytes| {
        fs::rename(&partial, dest)?;
        Ok(bytes)
    });
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

fn decode_into(source: &Path, partial: &Path) -> io::Result<u64> {
    let mut decoder = MultiGzDecoder::new(BufReader::new(File::open(source)?));
    let mut writer = BufWriter::new(File::create(partial)?);
    let bytes = io::copy(&mut decoder, &mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn extracted_name_strips_extension() {
        assert_eq!(extracted_name("a.pcap.gz", ".gz"), Some("a.pcap"));
        assert_eq!(extracted_name("notes.txt", ".gz"), None);
        assert_eq!(extracted_name(".gz", ".gz"), None);
    }

    #[test]
    fn partial_looking_capture_names_are_refused() {
        assert_eq!(extracted_name("night.tmp.gz", ".gz"), None);
        assert_eq!(extracted_name("night.tmp.pcap.gz", ".gz"), Some("night.tmp.pcap"));
    }

    #[test]
    fn gunzip_writes_capture() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.pcap.gz");
        let dest = dir.path().join("a.pcap");
        let capture: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&source, gzip(&capture)).unwrap();

        assert_eq!(gunzip(&source, &dest).unwrap(), capture.len() as u64);
        assert_eq!(fs::read(&dest).unwrap(), capture);
        assert!(!partial_local(&dest).exists());
    }

    #[test]
    fn concatenated_members_are_all_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("rotated.pcap.gz");
        let dest = dir.path().join("rotated.pcap");
        let mut stream = gzip(b"first ");
        stream.extend(gzip(b"second"));
        fs::write(&source, stream).unwrap();

        gunzip(&source, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"first second");
    }

    #[test]
    fn corrupt_archive_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("bad.pcap.gz");
        let dest = dir.path().join("bad.pcap");
        fs::write(&source, b"definitely not gzip").unwrap();

        assert!(gunzip(&source, &dest).is_err());
        assert!(!dest.exists());
        assert!(!partial_local(&dest).exists());
        assert!(source.exists());
    }
}
