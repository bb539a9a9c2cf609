//! Filesystem helpers shared by the store and the report stage.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::path::Path;

/// Serializes `value` as pretty JSON and replaces `path` atomically.
///
/// The document is written to a sibling temp file and renamed over the target,
/// so readers never observe a half-written manifest.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let body = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);
    fs::write(tmp, body)?;
    fs::rename(tmp, path)
}

/// Returns the hex SHA-256 digest of a file.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Summary of an artifact found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactStat {
    /// Total size in bytes.
    pub size_bytes: u64,
    /// Digest for files, `None` for directories.
    pub sha256: Option<String>,
}

/// Inspects an artifact location.
///
/// Returns `Ok(None)` when the path is missing, an empty file, or a directory
/// with no entries.
pub fn inspect_artifact(path: &Path) -> io::Result<Option<ArtifactStat>> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    if metadata.is_dir() {
        let size = dir_size(path)?;
        let has_entries = fs::read_dir(path)?.next().is_some();
        return Ok(has_entries.then_some(ArtifactStat {
            size_bytes: size,
            sha256: None,
        }));
    }

    if metadata.len() == 0 {
        return Ok(None);
    }

    Ok(Some(ArtifactStat {
        size_bytes: metadata.len(),
        sha256: Some(sha256_file(path)?),
    }))
}

fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        total += if metadata.is_dir() {
            dir_size(&entry.path())?
        } else {
            metadata.len()
        };
    }
    Ok(total)
}

/// Copies a file or a directory tree to `dest`.
pub fn copy_recursive(src: &Path, dest: &Path) -> io::Result<()> {
    if fs::metadata(src)?.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dest).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inspect_missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(inspect_artifact(&dir.path().join("nope")).unwrap(), None);

        let empty = dir.path().join("empty.txt");
        fs::write(&empty, b"").unwrap();
        assert_eq!(inspect_artifact(&empty).unwrap(), None);

        let empty_dir = dir.path().join("replicates");
        fs::create_dir(&empty_dir).unwrap();
        assert_eq!(inspect_artifact(&empty_dir).unwrap(), None);
    }

    #[test]
    fn test_inspect_file_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tree.newick");
        fs::write(&file, b"(a,b);").unwrap();

        let stat = inspect_artifact(&file).unwrap().unwrap();
        assert_eq!(stat.size_bytes, 6);
        assert_eq!(stat.sha256.unwrap().len(), 64);

        let reps = dir.path().join("replicates");
        fs::create_dir(&reps).unwrap();
        fs::write(reps.join("bs1.newick"), b"(a,b);").unwrap();
        let stat = inspect_artifact(&reps).unwrap().unwrap();
        assert_eq!(stat.size_bytes, 6);
        assert!(stat.sha256.is_none());
    }

    #[test]
    fn test_write_json_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calc.json");
        write_json_atomic(&path, &serde_json::json!({"status": "in_progress"})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"status": "complete"})).unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["status"], "complete");
        assert!(!dir.path().join("calc.json.tmp").exists());
    }

    #[test]
    fn test_copy_recursive_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested/a.txt"), b"a").unwrap();

        let dest = dir.path().join("dest");
        copy_recursive(&src, &dest).unwrap();
        assert_eq!(fs::read(dest.join("nested/a.txt")).unwrap(), b"a");
    }
}
