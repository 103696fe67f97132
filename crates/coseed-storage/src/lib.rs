//! Output directory handling for coseed: atomic file writes + content hashing.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "coseed-storage";

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file_name: String,
    pub absolute_path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

/// A directory owned by a single run. Files are replaced wholesale, never appended.
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: PathBuf,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn ensure_root(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating output directory {}", self.root.display()))
    }

    /// Write `bytes` to `root/file_name` via a temp file and rename, replacing
    /// any previous file of the same name.
    pub fn write_file(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<StoredFile> {
        self.ensure_root()?;

        let absolute_path = self.root.join(file_name);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| format!("opening temp output file {}", temp_path.display()))?;
        let written = file
            .write_all(bytes)
            .and_then(|_| file.flush())
            .with_context(|| format!("writing temp output file {}", temp_path.display()));
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, &absolute_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp output {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        debug!(path = %absolute_path.display(), bytes = bytes.len(), "wrote output file");
        Ok(StoredFile {
            file_name: file_name.to_string(),
            absolute_path,
            content_hash: Self::sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        let hash = OutputStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn write_creates_missing_directories() {
        let dir = tempdir().expect("tempdir");
        let store = OutputStore::new(dir.path().join("nested").join("sql"));

        let stored = store
            .write_file("insert_companies_batch_001.sql", b"SELECT 1;\n")
            .expect("write");

        assert!(stored.absolute_path.exists());
        assert_eq!(stored.byte_size, 10);
        assert_eq!(stored.content_hash, OutputStore::sha256_hex(b"SELECT 1;\n"));
        assert_eq!(
            fs::read_to_string(&stored.absolute_path).expect("read back"),
            "SELECT 1;\n"
        );
    }

    #[test]
    fn rewrite_replaces_content_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = OutputStore::new(dir.path());

        store.write_file("a.sql", b"first").expect("first write");
        let second = store.write_file("a.sql", b"second").expect("second write");

        assert_eq!(fs::read(&second.absolute_path).expect("read"), b"second");
        let names: Vec<_> = fs::read_dir(dir.path())
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.sql".to_string()]);
    }

    #[test]
    fn root_that_is_a_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a dir").expect("write blocker");

        let store = OutputStore::new(&blocker);
        let err = store.write_file("a.sql", b"x").expect_err("should fail");
        assert!(format!("{err:#}").contains("creating output directory"));
    }
}
