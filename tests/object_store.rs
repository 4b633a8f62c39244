// Integration tests for the content-addressed object store.

use cowfs::error::EngineError;
use cowfs::store::{sha256_bytes, ObjectStore, EMPTY_HASH};
use tempfile::TempDir;

const HELLO_HASH: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

fn open_store(tmp: &TempDir) -> ObjectStore {
    ObjectStore::open(tmp.path().join("objects")).expect("open object store")
}

#[test]
fn empty_blob_is_seeded_on_open() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    assert!(store.exists(EMPTY_HASH));
    assert_eq!(store.get(EMPTY_HASH).unwrap(), Vec::<u8>::new());
}

#[test]
fn put_computes_sha256_and_shards_by_prefix() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    let (hash, size) = store.put(b"hello").unwrap();
    assert_eq!(hash, HELLO_HASH);
    assert_eq!(size, 5);
    assert_eq!(sha256_bytes(b"hello"), HELLO_HASH);

    // objects/2c/f24d...
    let path = store.object_path(&hash);
    assert!(path.exists());
    assert_eq!(
        path.parent().unwrap().file_name().unwrap().to_str().unwrap(),
        "2c"
    );
}

#[test]
fn put_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    let (first, _) = store.put(b"same content").unwrap();
    let (second, _) = store.put(b"same content").unwrap();
    assert_eq!(first, second);
    assert!(store.exists(&first));

    // Exactly one file in the shard, no leftover temp files.
    let shard = store.object_path(&first).parent().unwrap().to_path_buf();
    let entries: Vec<_> = std::fs::read_dir(shard).unwrap().collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn get_returns_stored_bytes() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    let (hash, _) = store.put(b"payload bytes").unwrap();
    assert_eq!(store.get(&hash).unwrap(), b"payload bytes");
}

#[test]
fn get_missing_blob_is_a_hard_error() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    let bogus = "a".repeat(64);
    match store.get(&bogus) {
        Err(EngineError::MissingBlob(hash)) => assert_eq!(hash, bogus),
        other => panic!("expected MissingBlob, got {other:?}"),
    }
}

#[test]
fn delete_frees_bytes_and_prunes_empty_shard() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    let (hash, _) = store.put(b"doomed").unwrap();
    let shard = store.object_path(&hash).parent().unwrap().to_path_buf();

    let freed = store.delete(&hash).unwrap();
    assert_eq!(freed, 6);
    assert!(!store.exists(&hash));
    assert!(!shard.exists());
}

#[test]
fn delete_missing_blob_frees_zero() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    assert_eq!(store.delete(&"b".repeat(64)).unwrap(), 0);
}

#[test]
fn put_empty_returns_well_known_hash() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let (hash, size) = store.put(b"").unwrap();
    assert_eq!(hash, EMPTY_HASH);
    assert_eq!(size, 0);
}
