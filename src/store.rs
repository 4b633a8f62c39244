// src/store.rs
//
// =============================================================================
// COWFS: CONTENT-ADDRESSED OBJECT STORE
// =============================================================================
//
// Immutable blobs named by SHA-256, sharded git-style (objects/ab/cdef...).
//
// Guarantees:
// 1. Atomic visibility: temp file + fsync + rename, never a partial blob.
// 2. Dedup: identical content resolves to one path; puts are idempotent.
// 3. Crash safety: a failed put leaves at most a temp file behind.

use crate::error::{EngineError, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// SHA-256 of zero bytes. Seeded on open so empty files need no data path.
pub const EMPTY_HASH: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Hex digest of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Opens the store root, creating it if missing, and seeds the
    /// well-known empty blob.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let store = Self { root };
        store.put(b"")?;
        Ok(store)
    }

    /// Filesystem location for a hash: `objects/ab/cdef...`.
    /// The two-char shard caps directory fan-out.
    pub fn object_path(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[..2]).join(&hash[2..])
    }

    pub fn exists(&self, hash: &str) -> bool {
        self.object_path(hash).exists()
    }

    /// Stores a blob, returning (hash, size).
    ///
    /// If the target path already exists the content is identical by
    /// construction and the write is skipped entirely.
    pub fn put(&self, data: &[u8]) -> Result<(String, u64)> {
        let hash = sha256_bytes(data);
        let final_path = self.object_path(&hash);

        if final_path.exists() {
            return Ok((hash, data.len() as u64));
        }

        let shard_dir = self.root.join(&hash[..2]);
        fs::create_dir_all(&shard_dir)?;

        // Temp file lives in the shard directory so the rename stays on
        // one filesystem and is atomic.
        let tmp_path = shard_dir.join(format!("{}.tmp", &hash[2..]));
        if let Err(e) = write_blob(&tmp_path, &final_path, data) {
            fs::remove_file(&tmp_path).ok();
            return Err(e);
        }

        Ok((hash, data.len() as u64))
    }

    /// Reads a blob back. A missing blob is a hard error: every committed
    /// version must have its payload on disk.
    pub fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.object_path(hash);
        fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::MissingBlob(hash.to_string()),
            _ => EngineError::Io(e),
        })
    }

    /// Removes a blob, returning bytes freed. A blob already gone frees 0;
    /// the caller decides whether that is worth surfacing.
    pub fn delete(&self, hash: &str) -> Result<u64> {
        let path = self.object_path(hash);
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        fs::remove_file(&path)?;

        // rmdir only succeeds once the shard is empty; siblings keep it alive.
        if let Some(parent) = path.parent() {
            fs::remove_dir(parent).ok();
        }
        Ok(size)
    }
}

fn write_blob(tmp: &Path, dst: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(tmp, dst)?;
    Ok(())
}
