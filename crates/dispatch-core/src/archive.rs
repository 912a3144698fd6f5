//! Zip bundle validation and CSV member extraction

use crate::error::{PipelineError, Result};
use std::io::{Cursor, Read};
use tracing::debug;
use zip::ZipArchive;

/// Upper bound on the buffer reserved from a member's declared size
const MAX_PREALLOC_BYTES: usize = 8 * 1024 * 1024;

/// A CSV file found inside a bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    /// Base name, without any directory prefix
    pub name: String,
    pub contents: Vec<u8>,
}

/// Check that `data` is a readable zip with at least one member and that every member
/// decompresses with a matching CRC. Returns the member count.
pub fn validate_zip(label: &str, data: &[u8]) -> Result<usize> {
    if data.is_empty() {
        return Err(PipelineError::invalid_archive(label, "empty file"));
    }

    let mut archive = ZipArchive::new(Cursor::new(data))
        .map_err(|e| PipelineError::invalid_archive(label, e.to_string()))?;

    if archive.len() == 0 {
        return Err(PipelineError::invalid_archive(label, "no members"));
    }

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| PipelineError::invalid_archive(label, e.to_string()))?;
        std::io::copy(&mut entry, &mut std::io::sink())
            .map_err(|e| PipelineError::invalid_archive(label, format!("member {}: {}", i, e)))?;
    }

    Ok(archive.len())
}

/// Initial buffer size for a member. The declared size comes from the archive header and is
/// not trusted beyond `MAX_PREALLOC_BYTES`.
fn initial_capacity(declared: u64) -> usize {
    usize::try_from(declared).map_or(MAX_PREALLOC_BYTES, |n| n.min(MAX_PREALLOC_BYTES))
}

/// Every `.csv` member, sorted by base name
pub fn extract_csv_members(label: &str, data: &[u8]) -> Result<Vec<ArchiveMember>> {
    let mut archive = ZipArchive::new(Cursor::new(data))
        .map_err(|e| PipelineError::invalid_archive(label, e.to_string()))?;
    let mut members = Vec::new();

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }

        let name = file
            .name()
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .to_string();
        if !name.to_ascii_lowercase().ends_with(".csv") {
            continue;
        }

        let mut contents = Vec::with_capacity(initial_capacity(file.size()));
        file.read_to_end(&mut contents)?;
        debug!(archive = label, member = %name, bytes = contents.len(), "Extracted CSV member");
        members.push(ArchiveMember { name, contents });
    }

    members.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_extracts_csv_members_in_name_order() {
        let data = build_zip(&[
            ("reports/b.CSV", b"second"),
            ("readme.txt", b"ignored"),
            ("a.csv", b"first"),
        ]);

        assert_eq!(validate_zip("bundle.zip", &data).unwrap(), 3);

        let members = extract_csv_members("bundle.zip", &data).unwrap();
        let names: Vec<_> = members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["a.csv", "b.CSV"]);
        assert_eq!(members[1].contents, b"second");
    }

    #[test]
    fn test_rejects_corrupt_and_empty_archives() {
        assert!(matches!(
            validate_zip("empty.zip", b""),
            Err(PipelineError::InvalidArchive { .. })
        ));
        assert!(validate_zip("junk.zip", b"PK\x03\x04 not really a zip").is_err());
        assert!(extract_csv_members("junk.zip", b"garbage").is_err());

        let mut truncated = build_zip(&[("a.csv", b"I,DISPATCH,PRICE,5,RRP")]);
        truncated.truncate(truncated.len() / 2);
        assert!(validate_zip("truncated.zip", &truncated).is_err());
    }

    #[test]
    fn test_declared_size_does_not_drive_allocation() {
        assert_eq!(initial_capacity(0), 0);
        assert_eq!(initial_capacity(4096), 4096);
        assert_eq!(initial_capacity(u64::MAX), MAX_PREALLOC_BYTES);

        // Members larger than the reservation still come out whole
        let body = vec![b'x'; MAX_PREALLOC_BYTES + 10];
        let data = build_zip(&[("big.csv", &body)]);
        let members = extract_csv_members("big.zip", &data).unwrap();
        assert_eq!(members[0].contents.len(), body.len());
    }

    #[test]
    fn test_zip_without_csv_yields_nothing() {
        let data = build_zip(&[("notes.txt", b"hello")]);
        assert!(extract_csv_members("notes.zip", &data).unwrap().is_empty());
    }
}
