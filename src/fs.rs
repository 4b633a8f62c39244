// src/fs.rs
//
// =============================================================================
// COWFS: FS ADAPTER
// =============================================================================
//
// Presents the engine as a kernel-style filesystem surface.
//
// Model:
// - Cooperative async: operations run on the caller's event loop; every
//   engine call (SQLite, blob I/O, hashing) is offloaded to the blocking
//   worker pool.
// - Per-inode write buffer: whole-file byte buffer created lazily on first
//   write or truncate, seeded from the current version's blob.
// - Per-inode lock: a tokio Mutex guards buffer mutations and flush, so two
//   writers on the same inode never interleave.
// - Handle table: monotonically increasing ids for open files and dirs.
// - Hash/size cache: inode -> (current hash, size), invalidated on flush,
//   unlink, and the destination side of rename.
//
// Errors map to the nearest POSIX errno.

use crate::engine::{Engine, StatsReport};
use crate::error::{EngineError, Result};
use crate::metadata::FileRow;
use crate::store::EMPTY_HASH;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as TokioMutex;

pub type FsResult<T> = std::result::Result<T, FsError>;

/// A POSIX errno carried across the adapter boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsError {
    pub errno: i32,
}

impl FsError {
    pub const fn new(errno: i32) -> Self {
        Self { errno }
    }
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "errno {}", self.errno)
    }
}

impl std::error::Error for FsError {}

impl From<EngineError> for FsError {
    fn from(e: EngineError) -> Self {
        Self::new(errno_of(&e))
    }
}

pub fn errno_of(e: &EngineError) -> i32 {
    match e {
        EngineError::NotFound(_) => libc::ENOENT,
        EngineError::AlreadyExists(_) => libc::EEXIST,
        EngineError::NotEmpty(_) => libc::ENOTEMPTY,
        EngineError::IsDir(_) => libc::EISDIR,
        EngineError::NotDir(_) => libc::ENOTDIR,
        EngineError::OutOfRange { .. } | EngineError::AmbiguousSelector(_) => libc::EINVAL,
        EngineError::StillReferenced(_) => libc::EBUSY,
        EngineError::MissingBlob(_)
        | EngineError::TransactionFailed(_)
        | EngineError::CorruptStore(_)
        | EngineError::Io(_) => libc::EIO,
    }
}

/// What the kernel sees for a directory entry or stat call.
#[derive(Debug, Clone, Serialize)]
pub struct FsEntry {
    pub inode: i64,
    pub name: String,
    pub is_dir: bool,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
}

struct FileHandle {
    inode: i64,
    #[allow(dead_code)]
    flags: i32,
    dirty: bool,
}

/// Lazily materialized whole-file buffer. `None` means reads go straight
/// to the blob store.
struct InodeBuffer {
    data: Option<Vec<u8>>,
}

// =============================================================================
// ADAPTER
// =============================================================================

pub struct FsAdapter {
    engine: Arc<Engine>,
    handles: StdMutex<HashMap<u64, FileHandle>>,
    dir_handles: StdMutex<HashMap<u64, i64>>,
    next_fh: AtomicU64,
    buffers: StdMutex<HashMap<i64, Arc<TokioMutex<InodeBuffer>>>>,
    cache: StdMutex<HashMap<i64, (String, u64)>>,
}

impl FsAdapter {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            handles: StdMutex::new(HashMap::new()),
            dir_handles: StdMutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            buffers: StdMutex::new(HashMap::new()),
            cache: StdMutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Runs an engine call on the blocking worker pool.
    async fn offload<T, F>(&self, op: F) -> FsResult<T>
    where
        F: FnOnce(&Engine) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = self.engine.clone();
        match tokio::task::spawn_blocking(move || op(&engine)).await {
            Ok(result) => result.map_err(FsError::from),
            Err(e) => {
                log::error!("worker task failed: {e}");
                Err(FsError::new(libc::EIO))
            }
        }
    }

    fn alloc_fh(&self, inode: i64, flags: i32, dirty: bool) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles
            .lock()
            .unwrap()
            .insert(fh, FileHandle { inode, flags, dirty });
        fh
    }

    fn handle_inode(&self, fh: u64) -> FsResult<i64> {
        self.handles
            .lock()
            .unwrap()
            .get(&fh)
            .map(|h| h.inode)
            .ok_or(FsError::new(libc::EBADF))
    }

    fn mark_dirty(&self, fh: u64) {
        if let Some(handle) = self.handles.lock().unwrap().get_mut(&fh) {
            handle.dirty = true;
        }
    }

    fn buffer_slot(&self, inode: i64) -> Arc<TokioMutex<InodeBuffer>> {
        self.buffers
            .lock()
            .unwrap()
            .entry(inode)
            .or_insert_with(|| Arc::new(TokioMutex::new(InodeBuffer { data: None })))
            .clone()
    }

    fn existing_slot(&self, inode: i64) -> Option<Arc<TokioMutex<InodeBuffer>>> {
        self.buffers.lock().unwrap().get(&inode).cloned()
    }

    fn invalidate(&self, inode: i64) {
        self.cache.lock().unwrap().remove(&inode);
    }

    /// Current (hash, size) for an inode, short-circuiting the metadata hop
    /// once cached. A file with no versions resolves to the empty blob.
    async fn current_hash_size(&self, inode: i64) -> FsResult<(String, u64)> {
        if let Some(cached) = self.cache.lock().unwrap().get(&inode).cloned() {
            return Ok(cached);
        }
        let version = self.offload(move |e| e.current_version(inode)).await?;
        match version {
            Some(v) => {
                let entry = (v.object_hash, v.size_bytes as u64);
                self.cache.lock().unwrap().insert(inode, entry.clone());
                Ok(entry)
            }
            None => Ok((EMPTY_HASH.to_string(), 0)),
        }
    }

    /// Seeds the buffer from the current blob if not yet materialized.
    /// Called with the inode lock held.
    async fn ensure_loaded(&self, inode: i64, buffer: &mut InodeBuffer) -> FsResult<()> {
        if buffer.data.is_some() {
            return Ok(());
        }
        let (hash, _) = self.current_hash_size(inode).await?;
        let bytes = self.offload(move |e| e.blob(&hash)).await?;
        buffer.data = Some(bytes);
        Ok(())
    }

    async fn entry_size(&self, row: &FileRow) -> FsResult<u64> {
        if row.is_dir {
            return Ok(4096);
        }
        if let Some(slot) = self.existing_slot(row.id) {
            if let Some(data) = slot.lock().await.data.as_ref() {
                return Ok(data.len() as u64);
            }
        }
        if row.current_version_id.is_none() {
            return Ok(0);
        }
        let (_, size) = self.current_hash_size(row.id).await?;
        Ok(size)
    }

    async fn make_entry(&self, row: &FileRow) -> FsResult<FsEntry> {
        let size = self.entry_size(row).await?;
        Ok(FsEntry {
            inode: row.id,
            name: row.name.clone(),
            is_dir: row.is_dir,
            mode: row.mode,
            uid: row.uid,
            gid: row.gid,
            nlink: if row.is_dir { 2 } else { 1 },
            size,
        })
    }

    /// Flushes the inode's buffer through the engine write pipeline, then
    /// drops the buffer and invalidates the cache.
    async fn flush_inode(&self, inode: i64) -> FsResult<()> {
        let Some(slot) = self.existing_slot(inode) else {
            return Ok(());
        };
        let data = slot.lock().await.data.take();
        let Some(bytes) = data else {
            return Ok(());
        };
        let size = bytes.len();
        self.offload(move |e| e.write(inode, &bytes).map(|_| ()))
            .await?;
        self.invalidate(inode);
        log::debug!("flush inode={} size={}", inode, size);
        Ok(())
    }

    async fn flush_if_dirty(&self, fh: u64) -> FsResult<()> {
        let (inode, dirty) = {
            let handles = self.handles.lock().unwrap();
            let handle = handles.get(&fh).ok_or(FsError::new(libc::EBADF))?;
            (handle.inode, handle.dirty)
        };
        if dirty {
            self.flush_inode(inode).await?;
            if let Some(handle) = self.handles.lock().unwrap().get_mut(&fh) {
                handle.dirty = false;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Namespace operations
    // -------------------------------------------------------------------------

    pub async fn lookup(&self, parent: i64, name: &str) -> FsResult<FsEntry> {
        let owned = name.to_string();
        let row = self
            .offload(move |e| e.lookup(parent, &owned))
            .await?
            .ok_or(FsError::new(libc::ENOENT))?;
        self.make_entry(&row).await
    }

    pub async fn getattr(&self, inode: i64) -> FsResult<FsEntry> {
        let row = self
            .offload(move |e| e.file(inode))
            .await?
            .ok_or(FsError::new(libc::ENOENT))?;
        self.make_entry(&row).await
    }

    pub async fn setattr(
        &self,
        inode: i64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
    ) -> FsResult<FsEntry> {
        if mode.is_some() || uid.is_some() || gid.is_some() {
            self.offload(move |e| e.update_attrs(inode, mode, uid, gid))
                .await?;
        }
        if let Some(new_size) = size {
            self.truncate(inode, new_size).await?;
        }
        self.getattr(inode).await
    }

    /// Shrinks or zero-extends the buffer and marks every handle on the
    /// inode dirty so the change flushes on close.
    pub async fn truncate(&self, inode: i64, new_size: u64) -> FsResult<()> {
        let slot = self.buffer_slot(inode);
        {
            let mut guard = slot.lock().await;
            self.ensure_loaded(inode, &mut guard).await?;
            if let Some(data) = guard.data.as_mut() {
                data.resize(new_size as usize, 0);
            }
        }
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.values_mut() {
            if handle.inode == inode {
                handle.dirty = true;
            }
        }
        Ok(())
    }

    pub async fn mkdir(
        &self,
        parent: i64,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> FsResult<FsEntry> {
        let owned = name.to_string();
        let inode = self
            .offload(move |e| e.create(parent, &owned, mode, uid, gid, true))
            .await?;
        self.getattr(inode).await
    }

    pub async fn unlink(&self, parent: i64, name: &str) -> FsResult<()> {
        let owned = name.to_string();
        let row = self
            .offload(move |e| e.lookup(parent, &owned))
            .await?
            .ok_or(FsError::new(libc::ENOENT))?;
        if row.is_dir {
            return Err(FsError::new(libc::EISDIR));
        }
        let inode = row.id;
        self.offload(move |e| e.soft_delete(inode)).await?;
        self.invalidate(inode);
        Ok(())
    }

    pub async fn rmdir(&self, parent: i64, name: &str) -> FsResult<()> {
        let owned = name.to_string();
        let row = self
            .offload(move |e| e.lookup(parent, &owned))
            .await?
            .ok_or(FsError::new(libc::ENOENT))?;
        if !row.is_dir {
            return Err(FsError::new(libc::ENOTDIR));
        }
        let inode = row.id;
        self.offload(move |e| e.soft_delete(inode)).await
    }

    pub async fn rename(
        &self,
        old_parent: i64,
        old_name: &str,
        new_parent: i64,
        new_name: &str,
    ) -> FsResult<()> {
        let src_name = old_name.to_string();
        let src = self
            .offload(move |e| e.lookup(old_parent, &src_name))
            .await?
            .ok_or(FsError::new(libc::ENOENT))?;
        let dst_name = new_name.to_string();
        let dst = self
            .offload(move |e| e.lookup(new_parent, &dst_name))
            .await?;

        let src_inode = src.id;
        let owned = new_name.to_string();
        self.offload(move |e| e.rename(src_inode, new_parent, &owned))
            .await?;

        self.invalidate(src_inode);
        if let Some(dst) = dst {
            self.invalidate(dst.id);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // File I/O
    // -------------------------------------------------------------------------

    pub async fn open(&self, inode: i64, flags: i32) -> FsResult<u64> {
        let row = self
            .offload(move |e| e.file(inode))
            .await?
            .ok_or(FsError::new(libc::ENOENT))?;
        if row.is_dir {
            return Err(FsError::new(libc::EISDIR));
        }
        Ok(self.alloc_fh(inode, flags, false))
    }

    /// Creates a regular file with an initial zero-length version, an empty
    /// write buffer and a dirty handle, so even a touch-and-close flushes.
    pub async fn create(
        &self,
        parent: i64,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        flags: i32,
    ) -> FsResult<(u64, FsEntry)> {
        let owned = name.to_string();
        let inode = self
            .offload(move |e| e.create(parent, &owned, mode, uid, gid, false))
            .await?;
        self.offload(move |e| e.write(inode, &[]).map(|_| ()))
            .await?;

        let slot = self.buffer_slot(inode);
        slot.lock().await.data = Some(Vec::new());

        let fh = self.alloc_fh(inode, flags, true);
        let entry = self.getattr(inode).await?;
        Ok((fh, entry))
    }

    pub async fn read(&self, fh: u64, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        let inode = self.handle_inode(fh)?;

        if let Some(slot) = self.existing_slot(inode) {
            let guard = slot.lock().await;
            if let Some(data) = guard.data.as_ref() {
                return Ok(slice_at(data, offset, len));
            }
        }

        let (hash, _) = self.current_hash_size(inode).await?;
        let data = self.offload(move |e| e.blob(&hash)).await?;
        Ok(slice_at(&data, offset, len))
    }

    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        let inode = self.handle_inode(fh)?;
        let slot = self.buffer_slot(inode);
        {
            let mut guard = slot.lock().await;
            self.ensure_loaded(inode, &mut guard).await?;
            if let Some(buffer) = guard.data.as_mut() {
                let start = offset as usize;
                let end = start + data.len();
                if end > buffer.len() {
                    buffer.resize(end, 0);
                }
                buffer[start..end].copy_from_slice(data);
            }
        }
        self.mark_dirty(fh);
        Ok(data.len())
    }

    pub async fn flush(&self, fh: u64) -> FsResult<()> {
        self.flush_if_dirty(fh).await
    }

    pub async fn fsync(&self, fh: u64) -> FsResult<()> {
        self.flush_if_dirty(fh).await
    }

    /// Flushes pending writes, closes the handle, and drops the inode's
    /// buffer when this was the last open handle.
    pub async fn release(&self, fh: u64) -> FsResult<()> {
        self.flush_if_dirty(fh).await?;

        let inode = {
            let mut handles = self.handles.lock().unwrap();
            let handle = handles.remove(&fh).ok_or(FsError::new(libc::EBADF))?;
            handle.inode
        };
        let still_open = self
            .handles
            .lock()
            .unwrap()
            .values()
            .any(|h| h.inode == inode);
        if !still_open {
            self.buffers.lock().unwrap().remove(&inode);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Directories
    // -------------------------------------------------------------------------

    pub async fn opendir(&self, inode: i64) -> FsResult<u64> {
        let row = self
            .offload(move |e| e.file(inode))
            .await?
            .ok_or(FsError::new(libc::ENOENT))?;
        if !row.is_dir {
            return Err(FsError::new(libc::ENOTDIR));
        }
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.dir_handles.lock().unwrap().insert(fh, inode);
        Ok(fh)
    }

    pub async fn releasedir(&self, fh: u64) -> FsResult<()> {
        self.dir_handles.lock().unwrap().remove(&fh);
        Ok(())
    }

    pub async fn readdir(&self, fh: u64) -> FsResult<Vec<FsEntry>> {
        let inode = self
            .dir_handles
            .lock()
            .unwrap()
            .get(&fh)
            .copied()
            .ok_or(FsError::new(libc::EBADF))?;
        let rows = self.offload(move |e| e.children(inode)).await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(self.make_entry(row).await?);
        }
        Ok(entries)
    }

    pub async fn statfs(&self) -> FsResult<StatsReport> {
        self.offload(|e| e.stats()).await
    }
}

fn slice_at(data: &[u8], offset: u64, len: usize) -> Vec<u8> {
    let start = (offset as usize).min(data.len());
    let end = start.saturating_add(len).min(data.len());
    data[start..end].to_vec()
}
