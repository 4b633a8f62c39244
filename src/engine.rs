// src/engine.rs
//
// =============================================================================
// COWFS: VERSIONING ENGINE
// =============================================================================
//
// Orchestrates writes, deletes, renames, restores, snapshots and GC across
// the metadata store and the object store, and enforces the invariants that
// tie them together:
// 1. Every operation commits its full effect or rolls back with no effect.
// 2. ref_count(H) equals the number of non-deleted versions with hash H.
// 3. Every non-deleted version's blob is present in the object store.
//
// The metadata connection is single-writer: all access is serialized behind
// one lock. Object-store puts happen before the transaction opens; they are
// idempotent, and a blob orphaned by a rollback is reclaimed by the next GC.

use crate::error::{EngineError, Result};
use crate::metadata::{
    EventRow, FileRow, MetadataStore, SnapshotDetailRow, SnapshotRow, VersionRow,
};
use crate::store::ObjectStore;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub const ROOT_INODE: i64 = 1;

const HASH_ALGO: &str = "sha256";

// -----------------------------------------------------------------------------
// Reports and plans (serialized by the operator surface)
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RestorePlan {
    pub path: String,
    pub restored_from_version: usize,
    pub version_id: i64,
    pub target_hash: String,
    pub size_bytes: i64,
    pub created_at: String,
    pub was_deleted: bool,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotCreated {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub file_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotDeleted {
    pub name: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRestoreReport {
    pub snapshot: String,
    pub keep_new: bool,
    pub dry_run: bool,
    pub files_restored: i64,
    pub files_soft_deleted: i64,
    pub entries_skipped: i64,
}

#[derive(Debug, Clone)]
pub enum GcPolicy {
    None,
    KeepLast(u32),
    Before(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct GcReport {
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_last: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    pub versions_pruned: i64,
    pub orphaned_objects: i64,
    pub processed_objects: i64,
    pub reclaimed_bytes: i64,
    pub skipped_referenced: i64,
    pub missing_blobs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub logical_size_bytes: i64,
    pub actual_size_bytes: i64,
    pub dedup_savings_bytes: i64,
    pub dedup_percentage: f64,
    pub total_files: i64,
    pub total_versions: i64,
    pub total_objects: i64,
    pub orphaned_objects: i64,
    pub hash_algo: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub version: usize,
    pub id: i64,
    pub created_at: String,
    pub size_bytes: i64,
    pub hash: String,
    pub current: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum DiffReport {
    Text {
        left_version: usize,
        right_version: usize,
        left_hash: String,
        right_hash: String,
        diff: Vec<String>,
    },
    Binary {
        left_version: usize,
        right_version: usize,
        left_size: i64,
        right_size: i64,
        size_delta: i64,
        identical: bool,
    },
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct Engine {
    meta: Mutex<MetadataStore>,
    store: ObjectStore,
}

/// Runs `body` inside an explicit transaction; commits on success, rolls
/// back on any error so partial effects never become visible.
fn in_tx<T>(meta: &MetadataStore, body: impl FnOnce(&MetadataStore) -> Result<T>) -> Result<T> {
    meta.begin()?;
    match body(meta) {
        Ok(value) => {
            meta.commit()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rb) = meta.rollback() {
                log::error!("rollback failed after '{e}': {rb}");
            }
            Err(e)
        }
    }
}

fn child_path(parent_path: &str, name: &str) -> String {
    if parent_path == "/" {
        format!("/{name}")
    } else {
        format!("{parent_path}/{name}")
    }
}

impl Engine {
    /// Opens (or initializes) a storage directory: `objects/` blob store
    /// plus `metadata.db`.
    pub fn open(storage_root: impl AsRef<Path>) -> Result<Self> {
        let root = storage_root.as_ref();
        std::fs::create_dir_all(root)?;
        let store = ObjectStore::open(root.join("objects"))?;
        let meta = MetadataStore::open(root.join("metadata.db"))?;
        log::info!("engine ready at {:?}", root);
        Ok(Self {
            meta: Mutex::new(meta),
            store,
        })
    }

    fn meta(&self) -> MutexGuard<'_, MetadataStore> {
        self.meta.lock().unwrap()
    }

    // -------------------------------------------------------------------------
    // Write pipeline
    // -------------------------------------------------------------------------

    /// Whole-file replacement: store the blob, then atomically append a
    /// version, bump the object ref count, repoint the file and record the
    /// WRITE event. Works on soft-deleted files too (write-after-unlink
    /// keeps flushing until the last close).
    pub fn write(&self, inode: i64, data: &[u8]) -> Result<i64> {
        let (hash, size) = self.store.put(data)?;

        let meta = self.meta();
        let Some(file) = meta.file_any(inode)? else {
            return Err(EngineError::NotFound(format!("inode {inode}")));
        };
        if file.is_dir {
            return Err(EngineError::IsDir(file.path));
        }
        let version_id = in_tx(&meta, |m| m.create_version(inode, &hash, size as i64, "WRITE"))?;
        log::debug!(
            "write inode={} version={} hash={} size={}",
            inode,
            version_id,
            &hash[..12],
            size
        );
        Ok(version_id)
    }

    /// Current content of a live file. A file with no versions reads as
    /// empty.
    pub fn read(&self, inode: i64) -> Result<Vec<u8>> {
        let version = {
            let meta = self.meta();
            let Some(file) = meta.file(inode)? else {
                return Err(EngineError::NotFound(format!("inode {inode}")));
            };
            if file.is_dir {
                return Err(EngineError::IsDir(file.path));
            }
            meta.current_version(inode)?
        };
        match version {
            Some(v) => self.store.get(&v.object_hash),
            None => Ok(Vec::new()),
        }
    }

    pub fn read_at(&self, inode: i64, offset: u64, len: usize) -> Result<Vec<u8>> {
        let data = self.read(inode)?;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    // -------------------------------------------------------------------------
    // Namespace operations
    // -------------------------------------------------------------------------

    /// Creates a file or directory row under `parent`. Content versions are
    /// appended by `write`; a fresh file reads as empty until then.
    ///
    /// A soft-deleted row occupying the path keeps its history but has its
    /// path slot retired, so the namespace stays unique across live and
    /// deleted files.
    pub fn create(
        &self,
        parent: i64,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        is_dir: bool,
    ) -> Result<i64> {
        let meta = self.meta();
        let Some(parent_row) = meta.file(parent)? else {
            return Err(EngineError::NotFound(format!("inode {parent}")));
        };
        if !parent_row.is_dir {
            return Err(EngineError::NotDir(parent_row.path));
        }
        let path = child_path(&parent_row.path, name);
        if meta.lookup(parent, name)?.is_some() {
            return Err(EngineError::AlreadyExists(path));
        }

        let inode = in_tx(&meta, |m| {
            if let Some(dead) = m.file_by_path(&path, true)? {
                m.retire_path(dead.id)?;
            }
            m.create_file(parent, name, &path, is_dir, mode, uid, gid)
        })?;
        log::debug!("create {} -> inode {}", path, inode);
        Ok(inode)
    }

    /// Marks a file deleted; history and ref counts are untouched.
    /// Directories must have no live children.
    pub fn soft_delete(&self, inode: i64) -> Result<()> {
        let meta = self.meta();
        let Some(file) = meta.file(inode)? else {
            return Err(EngineError::NotFound(format!("inode {inode}")));
        };
        if file.id == ROOT_INODE {
            return Err(EngineError::NotEmpty(file.path));
        }
        if file.is_dir && !meta.children(inode)?.is_empty() {
            return Err(EngineError::NotEmpty(file.path));
        }
        in_tx(&meta, |m| m.soft_delete(inode, "DELETE"))
    }

    pub fn undelete(&self, inode: i64) -> Result<()> {
        let meta = self.meta();
        if meta.file_any(inode)?.is_none() {
            return Err(EngineError::NotFound(format!("inode {inode}")));
        }
        meta.set_deleted(inode, false)
    }

    /// Moves `inode` to (new_parent, new_name). An existing destination is
    /// soft-deleted first and its path slot retired; a non-empty destination
    /// directory refuses the move. Directory sources get every descendant
    /// path rewritten. One transaction.
    pub fn rename(&self, inode: i64, new_parent: i64, new_name: &str) -> Result<()> {
        let meta = self.meta();
        let Some(src) = meta.file(inode)? else {
            return Err(EngineError::NotFound(format!("inode {inode}")));
        };
        let Some(parent_row) = meta.file(new_parent)? else {
            return Err(EngineError::NotFound(format!("inode {new_parent}")));
        };
        if !parent_row.is_dir {
            return Err(EngineError::NotDir(parent_row.path));
        }
        let new_path = child_path(&parent_row.path, new_name);
        if new_path == src.path {
            return Ok(());
        }
        let dst = meta.lookup(new_parent, new_name)?;

        in_tx(&meta, |m| {
            if let Some(dst) = &dst {
                if dst.is_dir && !m.children(dst.id)?.is_empty() {
                    return Err(EngineError::NotEmpty(dst.path.clone()));
                }
                m.soft_delete(dst.id, "DELETE")?;
                m.retire_path(dst.id)?;
            }
            m.rename_file(inode, new_parent, new_name, &new_path)?;
            m.record_event("RENAME", Some(&new_path), None, None)?;
            Ok(())
        })?;
        log::debug!("rename {} -> {}", src.path, new_path);
        Ok(())
    }

    pub fn update_attrs(
        &self,
        inode: i64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<()> {
        let meta = self.meta();
        if meta.file(inode)?.is_none() {
            return Err(EngineError::NotFound(format!("inode {inode}")));
        }
        meta.update_attrs(inode, mode, uid, gid)
    }

    // -------------------------------------------------------------------------
    // Derived reads (adapter and operator surface)
    // -------------------------------------------------------------------------

    pub fn lookup(&self, parent: i64, name: &str) -> Result<Option<FileRow>> {
        self.meta().lookup(parent, name)
    }

    pub fn file(&self, inode: i64) -> Result<Option<FileRow>> {
        self.meta().file(inode)
    }

    pub fn file_by_path(&self, path: &str, include_deleted: bool) -> Result<Option<FileRow>> {
        self.meta().file_by_path(path, include_deleted)
    }

    pub fn children(&self, inode: i64) -> Result<Vec<FileRow>> {
        let meta = self.meta();
        let Some(dir) = meta.file(inode)? else {
            return Err(EngineError::NotFound(format!("inode {inode}")));
        };
        if !dir.is_dir {
            return Err(EngineError::NotDir(dir.path));
        }
        meta.children(inode)
    }

    pub fn current_version(&self, inode: i64) -> Result<Option<VersionRow>> {
        self.meta().current_version(inode)
    }

    /// Raw blob fetch by hash (no metadata hop); the adapter pairs this
    /// with its hash/size cache.
    pub fn blob(&self, hash: &str) -> Result<Vec<u8>> {
        self.store.get(hash)
    }

    pub fn blob_exists(&self, hash: &str) -> bool {
        self.store.exists(hash)
    }

    // -------------------------------------------------------------------------
    // Restore
    // -------------------------------------------------------------------------

    /// Restores a file (possibly soft-deleted) to an historical version,
    /// selected by 1-based version number or by a latest-at-or-before
    /// timestamp. Never rewrites history: a fresh version pointing at the
    /// target's blob is appended and becomes current.
    pub fn restore_file(
        &self,
        path: &str,
        version: Option<i64>,
        before: Option<&str>,
        dry_run: bool,
    ) -> Result<RestorePlan> {
        if version.is_some() == before.is_some() {
            return Err(EngineError::AmbiguousSelector(
                "specify exactly one of a version number or a before-timestamp".into(),
            ));
        }

        let meta = self.meta();
        let Some(file) = meta.file_by_path(path, true)? else {
            return Err(EngineError::NotFound(path.to_string()));
        };
        if file.is_dir {
            return Err(EngineError::IsDir(path.to_string()));
        }
        let versions = meta.versions_for(file.id)?;
        if versions.is_empty() {
            return Err(EngineError::NotFound(format!("{path} has no versions")));
        }

        let (index, target) = if let Some(n) = version {
            if n < 1 || n as usize > versions.len() {
                return Err(EngineError::OutOfRange {
                    given: n,
                    max: versions.len(),
                });
            }
            (n as usize, versions[n as usize - 1].clone())
        } else {
            let cutoff = before.unwrap_or_default();
            let Some(target) = meta.latest_version_before(file.id, cutoff)? else {
                return Err(EngineError::NotFound(format!(
                    "no version of {path} at or before {cutoff}"
                )));
            };
            let index = versions
                .iter()
                .position(|v| v.id == target.id)
                .map(|i| i + 1)
                .ok_or_else(|| {
                    EngineError::CorruptStore(format!("version {} not in history", target.id))
                })?;
            (index, target)
        };

        let mut plan = RestorePlan {
            path: file.path.clone(),
            restored_from_version: index,
            version_id: target.id,
            target_hash: target.object_hash.clone(),
            size_bytes: target.size_bytes,
            created_at: target.created_at.clone(),
            was_deleted: file.is_deleted,
            dry_run,
            new_version_id: None,
        };
        if dry_run {
            return Ok(plan);
        }

        let new_version_id = in_tx(&meta, |m| {
            let vid = m.create_version(file.id, &target.object_hash, target.size_bytes, "RESTORE")?;
            if file.is_deleted {
                m.set_deleted(file.id, false)?;
            }
            Ok(vid)
        })?;
        plan.new_version_id = Some(new_version_id);
        log::info!(
            "restored {} to v{} (version id {})",
            path,
            index,
            new_version_id
        );
        Ok(plan)
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Captures the current version of every live regular file under a
    /// unique name.
    pub fn snapshot_create(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<SnapshotCreated> {
        let meta = self.meta();
        let (id, file_count) = in_tx(&meta, |m| {
            let created = m.create_snapshot(name, description)?;
            m.record_event("SNAPSHOT_CREATE", Some(&format!("snapshot:{name}")), None, None)?;
            Ok(created)
        })?;
        log::info!("snapshot '{}' created with {} entries", name, file_count);
        Ok(SnapshotCreated {
            id,
            name: name.to_string(),
            description: description.map(String::from),
            file_count,
        })
    }

    pub fn snapshot_list(&self) -> Result<Vec<SnapshotRow>> {
        self.meta().snapshots()
    }

    pub fn snapshot_show(&self, name: &str) -> Result<Vec<SnapshotDetailRow>> {
        let meta = self.meta();
        let Some(snap) = meta.snapshot_by_name(name)? else {
            return Err(EngineError::NotFound(format!("snapshot '{name}'")));
        };
        meta.snapshot_entries_detailed(snap.id)
    }

    pub fn snapshot_delete(&self, name: &str) -> Result<SnapshotDeleted> {
        let meta = self.meta();
        let Some(snap) = meta.snapshot_by_name(name)? else {
            return Err(EngineError::NotFound(format!("snapshot '{name}'")));
        };
        in_tx(&meta, |m| {
            m.delete_snapshot(snap.id)?;
            m.record_event("SNAPSHOT_DELETE", Some(&format!("snapshot:{name}")), None, None)?;
            Ok(())
        })?;
        Ok(SnapshotDeleted {
            name: name.to_string(),
            deleted: true,
        })
    }

    /// Rolls live state back to a snapshot. Files created after the
    /// snapshot are soft-deleted unless `keep_new`; every snapshot entry
    /// gets a fresh SNAPSHOT_RESTORE version pointing at the captured blob
    /// and its file undeleted. Entries whose version has since been pruned
    /// are skipped and counted. All or nothing.
    pub fn snapshot_restore(
        &self,
        name: &str,
        keep_new: bool,
        dry_run: bool,
    ) -> Result<SnapshotRestoreReport> {
        let meta = self.meta();
        let Some(snap) = meta.snapshot_by_name(name)? else {
            return Err(EngineError::NotFound(format!("snapshot '{name}'")));
        };
        let entries = meta.snapshot_entries(snap.id)?;
        let entry_files: HashSet<i64> = entries.iter().map(|e| e.file_id).collect();
        let to_soft_delete: Vec<i64> = if keep_new {
            Vec::new()
        } else {
            meta.active_file_ids()?
                .into_iter()
                .filter(|id| !entry_files.contains(id))
                .collect()
        };

        if dry_run {
            let mut restored = 0;
            let mut skipped = 0;
            for entry in &entries {
                match meta.version(entry.version_id)? {
                    Some(_) => restored += 1,
                    None => skipped += 1,
                }
            }
            return Ok(SnapshotRestoreReport {
                snapshot: name.to_string(),
                keep_new,
                dry_run,
                files_restored: restored,
                files_soft_deleted: to_soft_delete.len() as i64,
                entries_skipped: skipped,
            });
        }

        let (restored, skipped) = in_tx(&meta, |m| {
            for id in &to_soft_delete {
                m.soft_delete(*id, "DELETE")?;
            }
            let mut restored = 0;
            let mut skipped = 0;
            for entry in &entries {
                let Some(version) = m.version(entry.version_id)? else {
                    skipped += 1;
                    continue;
                };
                m.create_version(
                    entry.file_id,
                    &version.object_hash,
                    version.size_bytes,
                    "SNAPSHOT_RESTORE",
                )?;
                m.set_deleted(entry.file_id, false)?;
                restored += 1;
            }
            m.record_event("SNAPSHOT_RESTORE", Some(&format!("snapshot:{name}")), None, None)?;
            Ok((restored, skipped))
        })?;

        log::info!(
            "snapshot '{}' restored: {} files, {} soft-deleted, {} skipped",
            name,
            restored,
            to_soft_delete.len(),
            skipped
        );
        Ok(SnapshotRestoreReport {
            snapshot: name.to_string(),
            keep_new,
            dry_run,
            files_restored: restored,
            files_soft_deleted: to_soft_delete.len() as i64,
            entries_skipped: skipped,
        })
    }

    // -------------------------------------------------------------------------
    // Garbage collection
    // -------------------------------------------------------------------------

    /// Two phases in one transaction: prune versions per policy, then
    /// collect orphaned objects (row + blob). A blob-delete failure rolls
    /// the whole run back so no committed version ever loses its blob.
    /// Dry-run projects the same outcome without mutating.
    pub fn gc(&self, policy: GcPolicy, dry_run: bool) -> Result<GcReport> {
        let meta = self.meta();
        let mut report = GcReport {
            dry_run,
            keep_last: match &policy {
                GcPolicy::KeepLast(k) => Some(*k),
                _ => None,
            },
            before: match &policy {
                GcPolicy::Before(ts) => Some(ts.clone()),
                _ => None,
            },
            versions_pruned: 0,
            orphaned_objects: 0,
            processed_objects: 0,
            reclaimed_bytes: 0,
            skipped_referenced: 0,
            missing_blobs: 0,
        };

        meta.begin()?;
        match self.gc_phases(&meta, &policy, dry_run, &mut report) {
            Ok(()) => {
                meta.commit()?;
                Ok(report)
            }
            Err(e) => {
                if let Err(rb) = meta.rollback() {
                    log::error!("gc rollback failed after '{e}': {rb}");
                }
                Err(e)
            }
        }
    }

    fn gc_phases(
        &self,
        meta: &MetadataStore,
        policy: &GcPolicy,
        dry_run: bool,
        report: &mut GcReport,
    ) -> Result<()> {
        // Phase 1: version pruning.
        let victims = match policy {
            GcPolicy::KeepLast(k) => meta.prunable_keep_last(*k)?,
            GcPolicy::Before(cutoff) => meta.prunable_before(cutoff)?,
            GcPolicy::None => Vec::new(),
        };
        report.versions_pruned = victims.len() as i64;

        if dry_run {
            // Project orphaning: per-hash decrements from the victim list,
            // united with the objects already at ref_count <= 0.
            let mut decrements: HashMap<&str, i64> = HashMap::new();
            for victim in &victims {
                *decrements.entry(victim.object_hash.as_str()).or_insert(0) += 1;
            }
            let mut doomed: HashMap<String, i64> = HashMap::new();
            for orphan in meta.orphaned_objects()? {
                doomed.insert(orphan.hash, orphan.size_bytes);
            }
            for (hash, dec) in decrements {
                if doomed.contains_key(hash) {
                    continue;
                }
                if let Some(object) = meta.object(hash)? {
                    if object.ref_count - dec <= 0 {
                        doomed.insert(object.hash, object.size_bytes);
                    }
                }
            }
            report.orphaned_objects = doomed.len() as i64;
            report.processed_objects = doomed.len() as i64;
            report.reclaimed_bytes = doomed.values().sum();
            return Ok(());
        }

        meta.prune(&victims)?;

        // Phase 2: orphan collection.
        let orphans = meta.orphaned_objects()?;
        report.orphaned_objects = orphans.len() as i64;
        for object in orphans {
            match meta.delete_object(&object.hash) {
                Ok(()) => {}
                Err(EngineError::StillReferenced(hash)) => {
                    log::warn!("gc: object {} still referenced, skipping", &hash[..12]);
                    report.skipped_referenced += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
            // Any failure here aborts and rolls back the pruning too.
            let freed = self.store.delete(&object.hash)?;
            if freed == 0 {
                log::warn!("gc: blob {} already missing on disk", &object.hash[..12]);
                report.missing_blobs += 1;
            }
            report.reclaimed_bytes += freed as i64;
            report.processed_objects += 1;
        }
        meta.record_event("GC", None, None, None)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stats, history, diff, activity
    // -------------------------------------------------------------------------

    pub fn stats(&self) -> Result<StatsReport> {
        let totals = self.meta().totals()?;
        let savings = totals.logical_size_bytes - totals.actual_size_bytes;
        let percentage = if totals.logical_size_bytes > 0 {
            savings as f64 / totals.logical_size_bytes as f64 * 100.0
        } else {
            0.0
        };
        Ok(StatsReport {
            logical_size_bytes: totals.logical_size_bytes,
            actual_size_bytes: totals.actual_size_bytes,
            dedup_savings_bytes: savings,
            dedup_percentage: (percentage * 10.0).round() / 10.0,
            total_files: totals.total_files,
            total_versions: totals.total_versions,
            total_objects: totals.total_objects,
            orphaned_objects: totals.orphaned_objects,
            hash_algo: HASH_ALGO.to_string(),
        })
    }

    /// Version history of a live file, oldest first, 1-based numbering.
    pub fn history(&self, path: &str) -> Result<Vec<HistoryEntry>> {
        let meta = self.meta();
        let Some(file) = meta.file_by_path(path, false)? else {
            return Err(EngineError::NotFound(path.to_string()));
        };
        if file.is_dir {
            return Err(EngineError::IsDir(path.to_string()));
        }
        let versions = meta.versions_for(file.id)?;
        Ok(versions
            .into_iter()
            .enumerate()
            .map(|(i, v)| HistoryEntry {
                version: i + 1,
                current: Some(v.id) == file.current_version_id,
                id: v.id,
                created_at: v.created_at,
                size_bytes: v.size_bytes,
                hash: v.object_hash,
            })
            .collect())
    }

    /// Compares two versions of a file: either two explicit 1-based
    /// numbers, or one number against the current version. Binary payloads
    /// (NUL byte or invalid UTF-8) report size deltas; text payloads get a
    /// unified diff labeled v<left>/v<right>.
    pub fn diff(
        &self,
        path: &str,
        v1: Option<i64>,
        v2: Option<i64>,
        version: Option<i64>,
    ) -> Result<DiffReport> {
        if version.is_some() && (v1.is_some() || v2.is_some()) {
            return Err(EngineError::AmbiguousSelector(
                "a single version cannot be combined with an explicit pair".into(),
            ));
        }

        let (left_data, right_data, left_no, right_no, left_hash, right_hash) = {
            let meta = self.meta();
            let Some(file) = meta.file_by_path(path, false)? else {
                return Err(EngineError::NotFound(path.to_string()));
            };
            if file.is_dir {
                return Err(EngineError::IsDir(path.to_string()));
            }
            let versions = meta.versions_for(file.id)?;
            if versions.is_empty() {
                return Err(EngineError::NotFound(format!("{path} has no versions")));
            }

            let (left_no, right_no) = match (v1, v2, version) {
                (Some(a), Some(b), None) => (a, b),
                (None, None, Some(n)) => {
                    let current = versions
                        .iter()
                        .position(|v| Some(v.id) == file.current_version_id)
                        .map(|i| (i + 1) as i64)
                        .ok_or_else(|| {
                            EngineError::CorruptStore(format!("{path} has no current version"))
                        })?;
                    (current, n)
                }
                (None, None, None) => {
                    return Err(EngineError::AmbiguousSelector(
                        "specify a version pair or a single version to compare against current"
                            .into(),
                    ));
                }
                _ => {
                    return Err(EngineError::AmbiguousSelector(
                        "a version pair requires both sides".into(),
                    ));
                }
            };

            for n in [left_no, right_no] {
                if n < 1 || n as usize > versions.len() {
                    return Err(EngineError::OutOfRange {
                        given: n,
                        max: versions.len(),
                    });
                }
            }
            let left = &versions[left_no as usize - 1];
            let right = &versions[right_no as usize - 1];
            (
                self.store.get(&left.object_hash)?,
                self.store.get(&right.object_hash)?,
                left_no as usize,
                right_no as usize,
                left.object_hash.clone(),
                right.object_hash.clone(),
            )
        };

        let as_text = |data: &[u8]| -> Option<String> {
            if data.contains(&0) {
                return None;
            }
            String::from_utf8(data.to_vec()).ok()
        };
        match (as_text(&left_data), as_text(&right_data)) {
            (Some(left_text), Some(right_text)) => {
                let text_diff = similar::TextDiff::from_lines(left_text.as_str(), right_text.as_str());
                let unified = text_diff
                    .unified_diff()
                    .header(&format!("v{left_no}"), &format!("v{right_no}"))
                    .to_string();
                Ok(DiffReport::Text {
                    left_version: left_no,
                    right_version: right_no,
                    left_hash,
                    right_hash,
                    diff: unified.lines().map(String::from).collect(),
                })
            }
            _ => Ok(DiffReport::Binary {
                left_version: left_no,
                right_version: right_no,
                left_size: left_data.len() as i64,
                right_size: right_data.len() as i64,
                size_delta: right_data.len() as i64 - left_data.len() as i64,
                identical: left_data == right_data,
            }),
        }
    }

    /// Most recent activity, oldest first within the window.
    pub fn activity(
        &self,
        limit: usize,
        since: Option<&str>,
        until: Option<&str>,
    ) -> Result<Vec<EventRow>> {
        self.meta().events(limit, since, until)
    }
}
