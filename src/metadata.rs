// src/metadata.rs
//
// =============================================================================
// COWFS: METADATA STORE
// =============================================================================
//
// The Persistence Layer.
//
// Architecture:
// - SQLite in WAL mode with foreign keys enforced.
// - Fully relational: files (inodes), versions, objects (ref counts),
//   snapshots + entries, events, format_version.
// - Single-statement operations auto-commit; composite operations are
//   grouped by the engine with explicit begin/commit/rollback.
// - Timestamps are `YYYY-MM-DD HH:MM:SS` UTC strings (SQLite
//   CURRENT_TIMESTAMP); lexicographic compare agrees with temporal order.

use crate::error::{EngineError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;

const SCHEMA_SQL: &str = "
BEGIN;
-- Format version tracking (checked on mount)
CREATE TABLE IF NOT EXISTS format_version (
    version INTEGER NOT NULL DEFAULT 1,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

-- Logical files (paths in the mounted filesystem)
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_id INTEGER NOT NULL DEFAULT 1,
    name TEXT NOT NULL,
    path TEXT UNIQUE NOT NULL,
    is_dir BOOLEAN DEFAULT FALSE,
    current_version_id INTEGER,
    is_deleted BOOLEAN DEFAULT FALSE,
    mode INTEGER DEFAULT 33188,
    uid INTEGER DEFAULT 0,
    gid INTEGER DEFAULT 0,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

-- Version history per file
CREATE TABLE IF NOT EXISTS versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL REFERENCES files(id),
    object_hash TEXT NOT NULL REFERENCES objects(hash),
    size_bytes INTEGER NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    is_deleted BOOLEAN DEFAULT FALSE
);

-- Content-addressable objects
CREATE TABLE IF NOT EXISTS objects (
    hash TEXT PRIMARY KEY,
    size_bytes INTEGER NOT NULL,
    ref_count INTEGER DEFAULT 0,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

-- Named filesystem snapshots
CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL,
    description TEXT,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

-- Maps each snapshot to the version of each file at snapshot time.
-- version_id carries no foreign key: GC may prune a captured version,
-- and restore skips entries whose version has gone missing.
CREATE TABLE IF NOT EXISTS snapshot_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id INTEGER NOT NULL REFERENCES snapshots(id),
    file_id INTEGER NOT NULL REFERENCES files(id),
    version_id INTEGER NOT NULL
);

-- Chronological activity feed
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    path TEXT,
    version_id INTEGER,
    object_hash TEXT,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

-- Performance indexes
CREATE INDEX IF NOT EXISTS idx_versions_file_id ON versions(file_id);
CREATE INDEX IF NOT EXISTS idx_versions_object_hash ON versions(object_hash);
CREATE INDEX IF NOT EXISTS idx_snapshot_entries_snapshot_id ON snapshot_entries(snapshot_id);
CREATE INDEX IF NOT EXISTS idx_files_path ON files(path);
CREATE INDEX IF NOT EXISTS idx_files_parent ON files(parent_id, name);
CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at, id);

-- Root inode: id 1, its own parent, empty name
INSERT OR IGNORE INTO files (id, parent_id, name, path, is_dir, mode)
    VALUES (1, 1, '', '/', TRUE, 16877);

INSERT INTO format_version (version) SELECT 1
    WHERE NOT EXISTS (SELECT 1 FROM format_version);
COMMIT;
";

// -----------------------------------------------------------------------------
// Row types
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct FileRow {
    pub id: i64,
    pub parent_id: i64,
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub current_version_id: Option<i64>,
    pub is_deleted: bool,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionRow {
    pub id: i64,
    pub file_id: i64,
    pub object_hash: String,
    pub size_bytes: i64,
    pub created_at: String,
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectRow {
    pub hash: String,
    pub size_bytes: i64,
    pub ref_count: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRow {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: String,
    pub file_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotEntryRow {
    pub file_id: i64,
    pub version_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotDetailRow {
    pub file_id: i64,
    pub version_id: i64,
    pub path: String,
    pub hash: String,
    pub size_bytes: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRow {
    pub id: i64,
    pub action: String,
    pub path: Option<String>,
    pub version_id: Option<i64>,
    pub object_hash: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreTotals {
    pub total_files: i64,
    pub total_versions: i64,
    pub total_objects: i64,
    pub actual_size_bytes: i64,
    pub logical_size_bytes: i64,
    pub orphaned_objects: i64,
}

const FILE_COLS: &str =
    "id, parent_id, name, path, is_dir, current_version_id, is_deleted, mode, uid, gid, \
     created_at, updated_at";

const VERSION_COLS: &str = "id, file_id, object_hash, size_bytes, created_at, is_deleted";

fn file_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRow> {
    Ok(FileRow {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        name: row.get(2)?,
        path: row.get(3)?,
        is_dir: row.get(4)?,
        current_version_id: row.get(5)?,
        is_deleted: row.get(6)?,
        mode: row.get(7)?,
        uid: row.get(8)?,
        gid: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn version_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionRow> {
    Ok(VersionRow {
        id: row.get(0)?,
        file_id: row.get(1)?,
        object_hash: row.get(2)?,
        size_bytes: row.get(3)?,
        created_at: row.get(4)?,
        is_deleted: row.get(5)?,
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// =============================================================================
// STORE
// =============================================================================

pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    /// Opens (creating if needed) the metadata database and applies the
    /// schema. WAL keeps readers unblocked; NORMAL sync is safe with WAL.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=10000;",
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    // -------------------------------------------------------------------------
    // Transaction control (composite operations only)
    // -------------------------------------------------------------------------

    pub fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Inodes
    // -------------------------------------------------------------------------

    /// Resolves (parent, name) to a live file row.
    pub fn lookup(&self, parent_id: i64, name: &str) -> Result<Option<FileRow>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {FILE_COLS} FROM files
                     WHERE parent_id = ?1 AND name = ?2 AND is_deleted = FALSE"
                ),
                params![parent_id, name],
                file_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Live file by inode.
    pub fn file(&self, inode: i64) -> Result<Option<FileRow>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {FILE_COLS} FROM files WHERE id = ?1 AND is_deleted = FALSE"),
                params![inode],
                file_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// File by inode regardless of deletion state.
    pub fn file_any(&self, inode: i64) -> Result<Option<FileRow>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {FILE_COLS} FROM files WHERE id = ?1"),
                params![inode],
                file_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn file_by_path(&self, path: &str, include_deleted: bool) -> Result<Option<FileRow>> {
        let sql = if include_deleted {
            format!("SELECT {FILE_COLS} FROM files WHERE path = ?1")
        } else {
            format!("SELECT {FILE_COLS} FROM files WHERE path = ?1 AND is_deleted = FALSE")
        };
        let row = self
            .conn
            .query_row(&sql, params![path], file_from_row)
            .optional()?;
        Ok(row)
    }

    /// Live children of a directory, excluding the root's self-reference.
    pub fn children(&self, parent_id: i64) -> Result<Vec<FileRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FILE_COLS} FROM files
             WHERE parent_id = ?1 AND is_deleted = FALSE AND id != ?1
             ORDER BY name ASC"
        ))?;
        let rows = stmt.query_map(params![parent_id], file_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_file(
        &self,
        parent_id: i64,
        name: &str,
        path: &str,
        is_dir: bool,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO files (parent_id, name, path, is_dir, mode, uid, gid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![parent_id, name, path, is_dir, mode, uid, gid],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Marks a file deleted and records the event. History is untouched.
    pub fn soft_delete(&self, inode: i64, action: &str) -> Result<()> {
        let path = self.file(inode)?.map(|f| f.path);
        self.conn.execute(
            "UPDATE files SET is_deleted = TRUE, updated_at = CURRENT_TIMESTAMP WHERE id = ?1",
            params![inode],
        )?;
        self.record_event(action, path.as_deref(), None, None)?;
        Ok(())
    }

    /// Frees a dead row's path slot so a new file can take the path. The
    /// row keeps its history under the retired name; the namespace stays
    /// unique across live and deleted files.
    pub fn retire_path(&self, inode: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE files SET path = path || '#deleted-' || id,
                              name = name || '#deleted-' || id,
                              updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1",
            params![inode],
        )?;
        Ok(())
    }

    pub fn set_deleted(&self, inode: i64, is_deleted: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE files SET is_deleted = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![is_deleted, inode],
        )?;
        Ok(())
    }

    /// Moves a file row. Directories additionally get every descendant path
    /// rewritten with prefix replacement in a single UPDATE.
    pub fn rename_file(
        &self,
        inode: i64,
        new_parent_id: i64,
        new_name: &str,
        new_path: &str,
    ) -> Result<()> {
        let Some(row) = self.file(inode)? else {
            return Err(EngineError::NotFound(format!("inode {inode}")));
        };
        let old_path = row.path;

        self.conn.execute(
            "UPDATE files SET parent_id = ?1, name = ?2, path = ?3,
             updated_at = CURRENT_TIMESTAMP WHERE id = ?4",
            params![new_parent_id, new_name, new_path, inode],
        )?;
        if row.is_dir {
            self.conn.execute(
                "UPDATE files SET path = ?1 || substr(path, ?2),
                 updated_at = CURRENT_TIMESTAMP
                 WHERE path LIKE ?3 || '/%'",
                params![new_path, old_path.len() as i64 + 1, old_path],
            )?;
        }
        Ok(())
    }

    pub fn update_attrs(
        &self,
        inode: i64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<()> {
        if let Some(mode) = mode {
            self.conn.execute(
                "UPDATE files SET mode = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
                params![mode, inode],
            )?;
        }
        if let Some(uid) = uid {
            self.conn.execute(
                "UPDATE files SET uid = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
                params![uid, inode],
            )?;
        }
        if let Some(gid) = gid {
            self.conn.execute(
                "UPDATE files SET gid = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
                params![gid, inode],
            )?;
        }
        Ok(())
    }

    /// Live regular files (snapshot-restore works over this set).
    pub fn active_file_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM files WHERE is_deleted = FALSE AND is_dir = FALSE")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -------------------------------------------------------------------------
    // Versions
    // -------------------------------------------------------------------------

    /// Inserts a new version: upserts the object's ref count, appends the
    /// version row, repoints current_version_id, and records the event with
    /// the caller-supplied action (WRITE, RESTORE, SNAPSHOT_RESTORE).
    /// Callers group this inside their enclosing transaction.
    pub fn create_version(
        &self,
        file_id: i64,
        object_hash: &str,
        size_bytes: i64,
        action: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO objects (hash, size_bytes, ref_count)
             VALUES (?1, ?2, 1)
             ON CONFLICT(hash) DO UPDATE SET ref_count = ref_count + 1",
            params![object_hash, size_bytes],
        )?;
        self.conn.execute(
            "INSERT INTO versions (file_id, object_hash, size_bytes) VALUES (?1, ?2, ?3)",
            params![file_id, object_hash, size_bytes],
        )?;
        let version_id = self.conn.last_insert_rowid();
        self.conn.execute(
            "UPDATE files SET current_version_id = ?1, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?2",
            params![version_id, file_id],
        )?;
        let path = self.file_any(file_id)?.map(|f| f.path);
        self.record_event(action, path.as_deref(), Some(version_id), Some(object_hash))?;
        Ok(version_id)
    }

    pub fn version(&self, version_id: i64) -> Result<Option<VersionRow>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {VERSION_COLS} FROM versions WHERE id = ?1"),
                params![version_id],
                version_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// The version a live file resolves to for reads. Deleted files
    /// contribute nothing.
    pub fn current_version(&self, inode: i64) -> Result<Option<VersionRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT v.id, v.file_id, v.object_hash, v.size_bytes, v.created_at, v.is_deleted
                 FROM versions v
                 JOIN files f ON f.current_version_id = v.id
                 WHERE f.id = ?1 AND f.is_deleted = FALSE",
                params![inode],
                version_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Full history for a file, oldest first.
    pub fn versions_for(&self, file_id: i64) -> Result<Vec<VersionRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {VERSION_COLS} FROM versions
             WHERE file_id = ?1 AND is_deleted = FALSE
             ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![file_id], version_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn latest_version_before(&self, file_id: i64, before: &str) -> Result<Option<VersionRow>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {VERSION_COLS} FROM versions
                     WHERE file_id = ?1 AND is_deleted = FALSE AND created_at <= ?2
                     ORDER BY created_at DESC, id DESC
                     LIMIT 1"
                ),
                params![file_id, before],
                version_from_row,
            )
            .optional()?;
        Ok(row)
    }

    // -------------------------------------------------------------------------
    // Version pruning
    // -------------------------------------------------------------------------

    /// Victims of a keep-last(k) policy: per file, every version ranked
    /// past the k most recent.
    pub fn prunable_keep_last(&self, keep_last: u32) -> Result<Vec<VersionRow>> {
        let mut stmt = self.conn.prepare(
            "WITH ranked AS (
                 SELECT v.id, v.file_id, v.object_hash, v.size_bytes, v.created_at,
                        v.is_deleted,
                        ROW_NUMBER() OVER (
                            PARTITION BY v.file_id
                            ORDER BY v.created_at DESC, v.id DESC
                        ) AS rn
                 FROM versions v
                 WHERE v.is_deleted = FALSE
             )
             SELECT id, file_id, object_hash, size_bytes, created_at, is_deleted
             FROM ranked
             WHERE rn > ?1
             ORDER BY file_id ASC, created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![keep_last], version_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Victims of a prune-before(cutoff) policy. Versions pointed to by any
    /// file's current_version_id are kept regardless of age so live state
    /// is never touched.
    pub fn prunable_before(&self, before: &str) -> Result<Vec<VersionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT v.id, v.file_id, v.object_hash, v.size_bytes, v.created_at, v.is_deleted
             FROM versions v
             LEFT JOIN files f ON f.current_version_id = v.id
             WHERE v.is_deleted = FALSE
               AND v.created_at < ?1
               AND f.id IS NULL
             ORDER BY v.file_id ASC, v.created_at ASC, v.id ASC",
        )?;
        let rows = stmt.query_map(params![before], version_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Deletes each victim's row and decrements its object's ref count.
    pub fn prune(&self, victims: &[VersionRow]) -> Result<()> {
        let mut delete = self
            .conn
            .prepare("DELETE FROM versions WHERE id = ?1")?;
        let mut decrement = self
            .conn
            .prepare("UPDATE objects SET ref_count = ref_count - 1 WHERE hash = ?1")?;
        for victim in victims {
            delete.execute(params![victim.id])?;
            decrement.execute(params![victim.object_hash])?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Objects
    // -------------------------------------------------------------------------

    pub fn object(&self, hash: &str) -> Result<Option<ObjectRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT hash, size_bytes, ref_count, created_at FROM objects WHERE hash = ?1",
                params![hash],
                |row| {
                    Ok(ObjectRow {
                        hash: row.get(0)?,
                        size_bytes: row.get(1)?,
                        ref_count: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn orphaned_objects(&self) -> Result<Vec<ObjectRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT hash, size_bytes, ref_count, created_at FROM objects WHERE ref_count <= 0",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ObjectRow {
                hash: row.get(0)?,
                size_bytes: row.get(1)?,
                ref_count: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Drops an orphan's row. A foreign-key violation means some version
    /// still references the hash; that surfaces as StillReferenced so GC
    /// can skip rather than abort.
    pub fn delete_object(&self, hash: &str) -> Result<()> {
        match self
            .conn
            .execute("DELETE FROM objects WHERE hash = ?1", params![hash])
        {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                Err(EngineError::StillReferenced(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Inserts the snapshot row and fixes an entry for every live regular
    /// file with a current version. Returns (snapshot_id, file_count).
    pub fn create_snapshot(&self, name: &str, description: Option<&str>) -> Result<(i64, i64)> {
        match self.conn.execute(
            "INSERT INTO snapshots (name, description) VALUES (?1, ?2)",
            params![name, description],
        ) {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(EngineError::AlreadyExists(format!("snapshot '{name}'")));
            }
            Err(e) => return Err(e.into()),
        }
        let snapshot_id = self.conn.last_insert_rowid();
        let file_count = self.conn.execute(
            "INSERT INTO snapshot_entries (snapshot_id, file_id, version_id)
             SELECT ?1, id, current_version_id
             FROM files
             WHERE is_deleted = FALSE AND is_dir = FALSE AND current_version_id IS NOT NULL",
            params![snapshot_id],
        )?;
        Ok((snapshot_id, file_count as i64))
    }

    pub fn snapshots(&self) -> Result<Vec<SnapshotRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.name, s.description, s.created_at, COUNT(se.id) AS file_count
             FROM snapshots s
             LEFT JOIN snapshot_entries se ON se.snapshot_id = s.id
             GROUP BY s.id
             ORDER BY s.created_at ASC, s.id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SnapshotRow {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                created_at: row.get(3)?,
                file_count: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn snapshot_by_name(&self, name: &str) -> Result<Option<SnapshotRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT s.id, s.name, s.description, s.created_at,
                        (SELECT COUNT(*) FROM snapshot_entries se WHERE se.snapshot_id = s.id)
                 FROM snapshots s WHERE s.name = ?1",
                params![name],
                |row| {
                    Ok(SnapshotRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        created_at: row.get(3)?,
                        file_count: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn snapshot_entries(&self, snapshot_id: i64) -> Result<Vec<SnapshotEntryRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_id, version_id FROM snapshot_entries WHERE snapshot_id = ?1",
        )?;
        let rows = stmt.query_map(params![snapshot_id], |row| {
            Ok(SnapshotEntryRow {
                file_id: row.get(0)?,
                version_id: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn snapshot_entries_detailed(&self, snapshot_id: i64) -> Result<Vec<SnapshotDetailRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT se.file_id, se.version_id, f.path, v.object_hash, v.size_bytes, v.created_at
             FROM snapshot_entries se
             JOIN files f ON f.id = se.file_id
             JOIN versions v ON v.id = se.version_id
             WHERE se.snapshot_id = ?1
             ORDER BY f.path ASC",
        )?;
        let rows = stmt.query_map(params![snapshot_id], |row| {
            Ok(SnapshotDetailRow {
                file_id: row.get(0)?,
                version_id: row.get(1)?,
                path: row.get(2)?,
                hash: row.get(3)?,
                size_bytes: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete_snapshot(&self, snapshot_id: i64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM snapshot_entries WHERE snapshot_id = ?1",
            params![snapshot_id],
        )?;
        self.conn
            .execute("DELETE FROM snapshots WHERE id = ?1", params![snapshot_id])?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    pub fn record_event(
        &self,
        action: &str,
        path: Option<&str>,
        version_id: Option<i64>,
        object_hash: Option<&str>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO events (action, path, version_id, object_hash)
             VALUES (?1, ?2, ?3, ?4)",
            params![action, path, version_id, object_hash],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent `limit` events within the optional window, returned in
    /// chronological order.
    pub fn events(
        &self,
        limit: usize,
        since: Option<&str>,
        until: Option<&str>,
    ) -> Result<Vec<EventRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, action, path, version_id, object_hash, created_at
             FROM events
             WHERE created_at >= COALESCE(?1, created_at)
               AND created_at <= COALESCE(?2, created_at)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![since, until, limit as i64], |row| {
            Ok(EventRow {
                id: row.get(0)?,
                action: row.get(1)?,
                path: row.get(2)?,
                version_id: row.get(3)?,
                object_hash: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        let mut events = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        events.reverse();
        Ok(events)
    }

    // -------------------------------------------------------------------------
    // Stats
    // -------------------------------------------------------------------------

    pub fn totals(&self) -> Result<StoreTotals> {
        let total_files = self.conn.query_row(
            "SELECT COUNT(*) FROM files WHERE is_deleted = FALSE AND is_dir = FALSE",
            [],
            |row| row.get(0),
        )?;
        let total_versions = self.conn.query_row(
            "SELECT COUNT(*) FROM versions WHERE is_deleted = FALSE",
            [],
            |row| row.get(0),
        )?;
        let total_objects = self
            .conn
            .query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))?;
        let actual_size_bytes = self.conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM objects",
            [],
            |row| row.get(0),
        )?;
        let logical_size_bytes = self.conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM versions WHERE is_deleted = FALSE",
            [],
            |row| row.get(0),
        )?;
        let orphaned_objects = self.conn.query_row(
            "SELECT COUNT(*) FROM objects WHERE ref_count <= 0",
            [],
            |row| row.get(0),
        )?;
        Ok(StoreTotals {
            total_files,
            total_versions,
            total_objects,
            actual_size_bytes,
            logical_size_bytes,
            orphaned_objects,
        })
    }
}
