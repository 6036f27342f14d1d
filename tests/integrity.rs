#![allow(clippy::uninlined_format_args)]

use burrow::{BurrowError, Db, Options, Result, TxId};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("test.db")
}

fn open(path: &Path) -> Result<Db> {
    Db::open(path, Options::default())
}

fn page_size_of(path: &Path) -> usize {
    let db = open(path).expect("open for page size");
    db.page_size()
}

#[test]
fn check_passes_on_fresh_and_used_databases() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let db = open(&db_path(&dir))?;
    db.check()?;

    db.batch(|tx| {
        tx.create_bucket("a")?;
        tx.create_bucket("b")?;
        let bucket = tx.bucket("a")?;
        for i in 0..1000u32 {
            bucket.put(format!("key-{i:05}").as_bytes(), &[1u8; 50])?;
        }
        Ok(())
    })?;
    db.check()?;

    db.batch(|tx| {
        let bucket = tx.bucket("a")?;
        for i in (0..1000u32).step_by(2) {
            bucket.delete(format!("key-{i:05}").as_bytes())?;
        }
        Ok(())
    })?;
    db.check()?;
    Ok(())
}

#[test]
fn check_runs_inside_an_active_writer() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let db = open(&db_path(&dir))?;
    let mut tx = db.begin(true)?;
    tx.create_bucket("live")?;
    let bucket = tx.bucket("live")?;
    for i in 0..100u32 {
        bucket.put(format!("k{i}").as_bytes(), b"v")?;
    }
    tx.check()?;
    drop(bucket);
    tx.commit()?;
    db.check()
}

#[test]
fn corrupting_the_newest_meta_falls_back_to_the_previous_state() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    {
        let db = open(&path)?;
        db.batch(|tx| {
            tx.create_bucket("widgets")?;
            tx.bucket("widgets")?.put(b"foo", b"bar")
        })?;
        db.batch(|tx| tx.bucket("widgets")?.put(b"foo", b"baz"))?;
    }
    let psize = page_size_of(&path);

    // The second commit was txid 3, living in meta slot 1. Destroy it.
    let mut bytes = fs::read(&path).unwrap();
    for byte in &mut bytes[psize..psize + 64] {
        *byte = 0xFF;
    }
    fs::write(&path, &bytes).unwrap();

    let db = open(&path)?;
    db.check()?;
    let txid = db.view(|tx| Ok(tx.id()))?;
    assert_eq!(txid, TxId(2));
    let value = db.view(|tx| tx.bucket("widgets")?.get(b"foo"))?;
    assert_eq!(value.as_deref(), Some(&b"bar"[..]));
    Ok(())
}

#[test]
fn truncated_commit_reopens_at_the_previous_transaction() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    {
        let db = open(&path)?;
        db.batch(|tx| {
            tx.create_bucket("widgets")?;
            tx.bucket("widgets")?.put(b"foo", b"bar")
        })?;
    }
    let snapshot = fs::read(&path).unwrap();
    {
        let db = open(&path)?;
        db.batch(|tx| tx.bucket("widgets")?.put(b"foo", b"baz"))?;
    }
    let psize = page_size_of(&path);

    // Model a crash after the data writes of txid 3 but before its meta
    // write: its slot still holds the bytes it had before the commit.
    let mut bytes = fs::read(&path).unwrap();
    bytes[psize..2 * psize].copy_from_slice(&snapshot[psize..2 * psize]);
    fs::write(&path, &bytes).unwrap();

    let db = open(&path)?;
    db.check()?;
    let txid = db.view(|tx| Ok(tx.id()))?;
    assert_eq!(txid, TxId(2));
    let value = db.view(|tx| tx.bucket("widgets")?.get(b"foo"))?;
    assert_eq!(value.as_deref(), Some(&b"bar"[..]));
    Ok(())
}

#[test]
fn corrupting_both_metas_fails_open() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let psize = {
        let db = open(&path).expect("create");
        db.page_size()
    };

    let mut bytes = fs::read(&path).unwrap();
    for byte in &mut bytes[..2 * psize] {
        *byte = 0xAA;
    }
    fs::write(&path, &bytes).unwrap();

    let err = open(&path).map(|_| ()).unwrap_err();
    assert!(matches!(err, BurrowError::InvalidDatabase));
}

#[test]
fn future_format_version_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let psize = {
        let db = open(&path).expect("create");
        db.page_size()
    };

    // Bump the version field (header + 4) in both meta slots.
    let mut bytes = fs::read(&path).unwrap();
    for slot in 0..2 {
        let off = slot * psize + 16 + 4;
        bytes[off..off + 4].copy_from_slice(&99u32.to_le_bytes());
    }
    fs::write(&path, &bytes).unwrap();

    let err = open(&path).map(|_| ()).unwrap_err();
    assert!(matches!(err, BurrowError::VersionMismatch));
}

#[test]
fn corrupted_freelist_page_fails_open() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let psize = {
        let db = open(&path).expect("create");
        db.page_size()
    };

    // A fresh database keeps its freelist at page 2.
    let mut bytes = fs::read(&path).unwrap();
    for byte in &mut bytes[2 * psize..2 * psize + 32] {
        *byte = 0xEE;
    }
    fs::write(&path, &bytes).unwrap();

    let err = open(&path).map(|_| ()).unwrap_err();
    assert!(matches!(err, BurrowError::Corruption(_)));
}

#[test]
fn corrupted_catalog_surfaces_on_first_transaction() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let psize = {
        let db = open(&path).expect("create");
        db.page_size()
    };

    // A fresh database keeps its catalog at page 3.
    let mut bytes = fs::read(&path).unwrap();
    for byte in &mut bytes[3 * psize..3 * psize + 32] {
        *byte = 0xEE;
    }
    fs::write(&path, &bytes).unwrap();

    let db = open(&path).expect("open succeeds; catalog is read lazily");
    let err = db.view(|_tx| Ok(())).unwrap_err();
    assert!(matches!(err, BurrowError::Corruption(_)));
}

#[test]
fn copy_matches_source_state() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let db = open(&path)?;
    db.batch(|tx| {
        tx.create_bucket("widgets")?;
        let bucket = tx.bucket("widgets")?;
        for i in 0..300u32 {
            bucket.put(format!("key-{i:04}").as_bytes(), format!("val-{i}").as_bytes())?;
        }
        Ok(())
    })?;

    let copy_path = dir.path().join("copy.db");
    let written = db.copy_file(&copy_path)?;
    assert_eq!(written, fs::metadata(&copy_path).unwrap().len());

    let copy = open(&copy_path)?;
    copy.check()?;
    let value = copy.view(|tx| tx.bucket("widgets")?.get(b"key-0123"))?;
    assert_eq!(value.as_deref(), Some(&b"val-123"[..]));
    Ok(())
}

#[test]
fn no_sync_mode_still_round_trips() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    {
        let db = Db::open(
            &path,
            Options {
                no_sync: true,
                ..Options::default()
            },
        )?;
        db.batch(|tx| {
            tx.create_bucket("widgets")?;
            tx.bucket("widgets")?.put(b"foo", b"bar")
        })?;
    }
    let db = open(&path)?;
    let value = db.view(|tx| tx.bucket("widgets")?.get(b"foo"))?;
    assert_eq!(value.as_deref(), Some(&b"bar"[..]));
    Ok(())
}
