//! SHA-256 content hashing
//!
//! Raw files are content-addressed: the hex digest is the deduplication key of the
//! content registry, and artifacts carry the same digest for auditing.

use crate::error::{DispatchError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const BUFFER_SIZE: usize = 1024 * 1024;

/// Hex-encoded SHA-256 digest together with the number of bytes hashed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    pub hex: String,
    pub size_bytes: u64,
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", self.hex)
    }
}

/// Hash an in-memory payload
pub fn sha256_bytes(data: &[u8]) -> ContentDigest {
    ContentDigest {
        hex: hex::encode(Sha256::digest(data)),
        size_bytes: data.len() as u64,
    }
}

/// Hash any readable source in fixed-size chunks
pub fn sha256_reader<R: Read>(reader: &mut R) -> Result<ContentDigest> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut size_bytes = 0u64;

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size_bytes += read as u64;
    }

    Ok(ContentDigest {
        hex: hex::encode(hasher.finalize()),
        size_bytes,
    })
}

/// Hash a single file
pub fn sha256_file(path: impl AsRef<Path>) -> Result<ContentDigest> {
    let mut file = std::fs::File::open(path)?;
    sha256_reader(&mut file)
}

/// Deterministic hash of a directory tree.
///
/// Files are visited in sorted relative-path order; each contributes its relative path
/// (forward slashes), its own digest and its size, NUL separated. An empty directory
/// hashes the marker `EMPTY_DIR`.
pub fn sha256_dir(path: impl AsRef<Path>) -> Result<ContentDigest> {
    let base = path.as_ref();
    let mut files = Vec::new();
    collect_files(base, &mut files)?;

    let mut entries = files
        .into_iter()
        .map(|file| {
            let relative = file
                .strip_prefix(base)
                .map_err(|e| DispatchError::parse(e.to_string()))?
                .to_string_lossy()
                .replace('\\', "/");
            Ok((relative, file))
        })
        .collect::<Result<Vec<_>>>()?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    let mut total = 0u64;

    for (relative, file) in &entries {
        let digest = sha256_file(file)?;
        total += digest.size_bytes;

        hasher.update(relative.as_bytes());
        hasher.update(b"\x00");
        hasher.update(digest.hex.as_bytes());
        hasher.update(b"\x00");
        hasher.update(digest.size_bytes.to_string().as_bytes());
        hasher.update(b"\x00");
    }

    if entries.is_empty() {
        hasher.update(b"EMPTY_DIR");
    }

    Ok(ContentDigest {
        hex: hex::encode(hasher.finalize()),
        size_bytes: total,
    })
}

/// Hash a file or a directory, whichever the path points at
pub fn sha256_path(path: impl AsRef<Path>) -> Result<ContentDigest> {
    let path = path.as_ref();
    if path.is_dir() {
        sha256_dir(path)
    } else {
        sha256_file(path)
    }
}

/// Verify a file against an expected hex digest (case-insensitive)
pub fn verify_sha256(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if actual.hex.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(DispatchError::ChecksumMismatch {
            expected: expected.to_string(),
            actual: actual.hex,
        })
    }
}

fn collect_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256_bytes() {
        let digest = sha256_bytes(b"hello world");
        assert_eq!(digest.hex, HELLO_WORLD);
        assert_eq!(digest.size_bytes, 11);
    }

    #[test]
    fn test_reader_matches_bytes() {
        let mut cursor = Cursor::new(b"hello world".to_vec());
        let digest = sha256_reader(&mut cursor).unwrap();
        assert_eq!(digest, sha256_bytes(b"hello world"));
    }

    #[test]
    fn test_identical_content_different_paths() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.zip");
        let b = dir.path().join("nested_copy.zip");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();

        assert_eq!(sha256_file(&a).unwrap(), sha256_file(&b).unwrap());
    }

    #[test]
    fn test_dir_hash_is_order_independent_and_content_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("region_id=NSW1")).unwrap();
        std::fs::write(dir.path().join("region_id=NSW1/part-0.parquet"), b"one").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"two").unwrap();

        let first = sha256_dir(dir.path()).unwrap();
        let second = sha256_path(dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.size_bytes, 6);

        std::fs::write(dir.path().join("b.txt"), b"changed").unwrap();
        assert_ne!(sha256_dir(dir.path()).unwrap().hex, first.hex);
    }

    #[test]
    fn test_empty_dir_has_stable_hash() {
        let one = tempfile::tempdir().unwrap();
        let two = tempfile::tempdir().unwrap();
        assert_eq!(sha256_dir(one.path()).unwrap(), sha256_dir(two.path()).unwrap());
    }

    #[test]
    fn test_verify_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.csv");
        std::fs::write(&path, b"hello world").unwrap();

        assert!(verify_sha256(&path, &HELLO_WORLD.to_uppercase()).is_ok());
        assert!(matches!(
            verify_sha256(&path, "deadbeef"),
            Err(DispatchError::ChecksumMismatch { .. })
        ));
    }
}
