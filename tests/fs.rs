// Integration tests for the async FS adapter: buffers, handles, flush
// semantics and errno mapping over a real engine.

use cowfs::engine::{Engine, ROOT_INODE};
use cowfs::fs::FsAdapter;
use cowfs::store::EMPTY_HASH;
use std::sync::Arc;
use tempfile::TempDir;

fn setup(tmp: &TempDir) -> (Arc<Engine>, FsAdapter) {
    let engine = Arc::new(Engine::open(tmp.path()).expect("open engine"));
    let adapter = FsAdapter::new(engine.clone());
    (engine, adapter)
}

#[tokio::test]
async fn touch_creates_version_history() {
    let tmp = TempDir::new().unwrap();
    let (engine, fs) = setup(&tmp);

    let (fh, entry) = fs.create(ROOT_INODE, "t.txt", 33188, 0, 0, 0).await.unwrap();
    assert_eq!(entry.size, 0);
    assert!(!entry.is_dir);
    fs.release(fh).await.unwrap();

    // Initial zero-length version plus the close-time flush, both empty.
    let history = engine.history("/t.txt").unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|h| h.hash == EMPTY_HASH && h.size_bytes == 0));
    assert!(history[1].current);
}

#[tokio::test]
async fn write_read_flush_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let (engine, fs) = setup(&tmp);

    let (fh, _) = fs.create(ROOT_INODE, "f.txt", 33188, 0, 0, 0).await.unwrap();
    let written = fs.write(fh, 0, b"hello world").await.unwrap();
    assert_eq!(written, 11);

    // Reads before flush come from the buffer.
    assert_eq!(fs.read(fh, 0, 1024).await.unwrap(), b"hello world");
    assert_eq!(fs.read(fh, 6, 5).await.unwrap(), b"world");

    let inode = fs.lookup(ROOT_INODE, "f.txt").await.unwrap().inode;
    assert_eq!(fs.getattr(inode).await.unwrap().size, 11);

    fs.flush(fh).await.unwrap();
    assert_eq!(engine.read(inode).unwrap(), b"hello world");

    // After flush the buffer is dropped; reads hit the blob store.
    assert_eq!(fs.read(fh, 0, 1024).await.unwrap(), b"hello world");
    fs.release(fh).await.unwrap();

    // Flush cleared the dirty bit, so release adds no extra version.
    assert_eq!(engine.history("/f.txt").unwrap().len(), 2);
}

#[tokio::test]
async fn offset_write_zero_extends_the_buffer() {
    let tmp = TempDir::new().unwrap();
    let (engine, fs) = setup(&tmp);

    let (fh, _) = fs.create(ROOT_INODE, "gap.bin", 33188, 0, 0, 0).await.unwrap();
    fs.write(fh, 3, b"abc").await.unwrap();

    let expected = vec![0u8, 0, 0, b'a', b'b', b'c'];
    assert_eq!(fs.read(fh, 0, 16).await.unwrap(), expected);

    fs.release(fh).await.unwrap();
    let inode = fs.lookup(ROOT_INODE, "gap.bin").await.unwrap().inode;
    assert_eq!(engine.read(inode).unwrap(), expected);
}

#[tokio::test]
async fn truncate_shrinks_and_extends() {
    let tmp = TempDir::new().unwrap();
    let (engine, fs) = setup(&tmp);

    let (fh, entry) = fs.create(ROOT_INODE, "t.bin", 33188, 0, 0, 0).await.unwrap();
    let inode = entry.inode;
    fs.write(fh, 0, b"hello").await.unwrap();

    fs.truncate(inode, 2).await.unwrap();
    assert_eq!(fs.read(fh, 0, 16).await.unwrap(), b"he");

    let entry = fs.setattr(inode, None, None, None, Some(4)).await.unwrap();
    assert_eq!(entry.size, 4);
    assert_eq!(fs.read(fh, 0, 16).await.unwrap(), b"he\0\0");

    fs.release(fh).await.unwrap();
    assert_eq!(engine.read(inode).unwrap(), b"he\0\0");
}

#[tokio::test]
async fn setattr_updates_mode_and_ownership() {
    let tmp = TempDir::new().unwrap();
    let (_, fs) = setup(&tmp);

    let (fh, entry) = fs.create(ROOT_INODE, "m.txt", 33188, 0, 0, 0).await.unwrap();
    fs.release(fh).await.unwrap();

    let updated = fs
        .setattr(entry.inode, Some(33261), Some(500), Some(500), None)
        .await
        .unwrap();
    assert_eq!(updated.mode, 33261);
    assert_eq!(updated.uid, 500);
    assert_eq!(updated.gid, 500);
}

#[tokio::test]
async fn reopen_reads_through_the_blob_cache() {
    let tmp = TempDir::new().unwrap();
    let (_, fs) = setup(&tmp);

    let (fh, entry) = fs.create(ROOT_INODE, "c.txt", 33188, 0, 0, 0).await.unwrap();
    fs.write(fh, 0, b"cached bytes").await.unwrap();
    fs.release(fh).await.unwrap();

    let fh2 = fs.open(entry.inode, 0).await.unwrap();
    assert_eq!(fs.read(fh2, 0, 1024).await.unwrap(), b"cached bytes");
    assert_eq!(fs.read(fh2, 7, 5).await.unwrap(), b"bytes");
    fs.release(fh2).await.unwrap();
}

#[tokio::test]
async fn unlink_soft_deletes_and_maps_enoent() {
    let tmp = TempDir::new().unwrap();
    let (engine, fs) = setup(&tmp);

    let (fh, entry) = fs.create(ROOT_INODE, "gone.txt", 33188, 0, 0, 0).await.unwrap();
    fs.release(fh).await.unwrap();

    fs.unlink(ROOT_INODE, "gone.txt").await.unwrap();
    let err = fs.lookup(ROOT_INODE, "gone.txt").await.unwrap_err();
    assert_eq!(err.errno, libc::ENOENT);

    // Soft delete: the row and its history survive for restore.
    let row = engine.file_by_path("/gone.txt", true).unwrap().expect("tombstone");
    assert_eq!(row.id, entry.inode);
    assert!(row.is_deleted);

    let err = fs.unlink(ROOT_INODE, "gone.txt").await.unwrap_err();
    assert_eq!(err.errno, libc::ENOENT);
}

#[tokio::test]
async fn unlink_directory_is_eisdir() {
    let tmp = TempDir::new().unwrap();
    let (_, fs) = setup(&tmp);

    fs.mkdir(ROOT_INODE, "d", 16877, 0, 0).await.unwrap();
    let err = fs.unlink(ROOT_INODE, "d").await.unwrap_err();
    assert_eq!(err.errno, libc::EISDIR);
}

#[tokio::test]
async fn rmdir_requires_empty_directory() {
    let tmp = TempDir::new().unwrap();
    let (_, fs) = setup(&tmp);

    let dir = fs.mkdir(ROOT_INODE, "d", 16877, 0, 0).await.unwrap();
    let (fh, _) = fs.create(dir.inode, "child.txt", 33188, 0, 0, 0).await.unwrap();
    fs.release(fh).await.unwrap();

    let err = fs.rmdir(ROOT_INODE, "d").await.unwrap_err();
    assert_eq!(err.errno, libc::ENOTEMPTY);

    fs.unlink(dir.inode, "child.txt").await.unwrap();
    fs.rmdir(ROOT_INODE, "d").await.unwrap();
    let err = fs.lookup(ROOT_INODE, "d").await.unwrap_err();
    assert_eq!(err.errno, libc::ENOENT);

    let err = fs.rmdir(ROOT_INODE, "missing").await.unwrap_err();
    assert_eq!(err.errno, libc::ENOENT);
}

#[tokio::test]
async fn rename_moves_and_replaces_destination() {
    let tmp = TempDir::new().unwrap();
    let (engine, fs) = setup(&tmp);

    let (fh_a, a) = fs.create(ROOT_INODE, "a.txt", 33188, 0, 0, 0).await.unwrap();
    fs.write(fh_a, 0, b"A").await.unwrap();
    fs.release(fh_a).await.unwrap();

    let (fh_b, _) = fs.create(ROOT_INODE, "b.txt", 33188, 0, 0, 0).await.unwrap();
    fs.write(fh_b, 0, b"B").await.unwrap();
    fs.release(fh_b).await.unwrap();

    fs.rename(ROOT_INODE, "a.txt", ROOT_INODE, "b.txt").await.unwrap();

    let entry = fs.lookup(ROOT_INODE, "b.txt").await.unwrap();
    assert_eq!(entry.inode, a.inode);
    assert_eq!(engine.read(a.inode).unwrap(), b"A");

    let err = fs.lookup(ROOT_INODE, "a.txt").await.unwrap_err();
    assert_eq!(err.errno, libc::ENOENT);

    let err = fs
        .rename(ROOT_INODE, "missing.txt", ROOT_INODE, "x.txt")
        .await
        .unwrap_err();
    assert_eq!(err.errno, libc::ENOENT);
}

#[tokio::test]
async fn readdir_lists_live_children() {
    let tmp = TempDir::new().unwrap();
    let (_, fs) = setup(&tmp);

    let dir = fs.mkdir(ROOT_INODE, "d", 16877, 0, 0).await.unwrap();
    for name in ["one.txt", "two.txt"] {
        let (fh, _) = fs.create(dir.inode, name, 33188, 0, 0, 0).await.unwrap();
        fs.release(fh).await.unwrap();
    }
    fs.unlink(dir.inode, "one.txt").await.unwrap();

    let dh = fs.opendir(dir.inode).await.unwrap();
    let names: Vec<String> = fs
        .readdir(dh)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["two.txt"]);
    fs.releasedir(dh).await.unwrap();
}

#[tokio::test]
async fn open_and_opendir_check_file_kind() {
    let tmp = TempDir::new().unwrap();
    let (_, fs) = setup(&tmp);

    let dir = fs.mkdir(ROOT_INODE, "d", 16877, 0, 0).await.unwrap();
    let err = fs.open(dir.inode, 0).await.unwrap_err();
    assert_eq!(err.errno, libc::EISDIR);

    let (fh, file) = fs.create(ROOT_INODE, "f.txt", 33188, 0, 0, 0).await.unwrap();
    fs.release(fh).await.unwrap();
    let err = fs.opendir(file.inode).await.unwrap_err();
    assert_eq!(err.errno, libc::ENOTDIR);

    let err = fs.open(99999, 0).await.unwrap_err();
    assert_eq!(err.errno, libc::ENOENT);
}

#[tokio::test]
async fn release_drops_buffer_on_last_close() {
    let tmp = TempDir::new().unwrap();
    let (engine, fs) = setup(&tmp);

    let (fh1, entry) = fs.create(ROOT_INODE, "multi.txt", 33188, 0, 0, 0).await.unwrap();
    let fh2 = fs.open(entry.inode, 0).await.unwrap();

    fs.write(fh1, 0, b"shared").await.unwrap();
    // Second handle sees the same buffer.
    assert_eq!(fs.read(fh2, 0, 16).await.unwrap(), b"shared");

    fs.release(fh1).await.unwrap();
    // Buffer still live while fh2 is open; the flushed content reads back.
    assert_eq!(fs.read(fh2, 0, 16).await.unwrap(), b"shared");
    fs.release(fh2).await.unwrap();

    assert_eq!(engine.read(entry.inode).unwrap(), b"shared");
}

#[tokio::test]
async fn statfs_surfaces_engine_stats() {
    let tmp = TempDir::new().unwrap();
    let (_, fs) = setup(&tmp);

    let (fh, _) = fs.create(ROOT_INODE, "s.txt", 33188, 0, 0, 0).await.unwrap();
    fs.write(fh, 0, b"stats!").await.unwrap();
    fs.release(fh).await.unwrap();

    let stats = fs.statfs().await.unwrap();
    assert_eq!(stats.total_files, 1);
    assert!(stats.total_versions >= 2);
    assert_eq!(stats.hash_algo, "sha256");
}
