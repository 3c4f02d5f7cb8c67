// Fault Injection Tests for larch
// These tests simulate damaged files and failed commits to ensure problems
// are reported and the database stays usable

use larch::{Database, Error, Options};
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use tempfile::TempDir;

fn options() -> Options {
    Options::default().block_size(2048).no_sync(true)
}

fn populate(dir: &TempDir, keys: u32) {
    let mut db = Database::create(dir.path(), &["t"], options()).unwrap();
    for i in 0..keys {
        db.table_mut("t").unwrap().add(format!("key{:05}", i).as_bytes(), &[0x42; 40]).unwrap();
    }
    db.commit().unwrap();
}

/// A failed commit rolls back and never reuses the failed revision number
#[test]
fn test_failed_commit_rolls_back() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    let mut db = Database::create(dir.path(), &["t"], options()).unwrap();
    db.table_mut("t").unwrap().add(b"kept", b"1").unwrap();
    assert_eq!(db.commit().unwrap(), 1);

    // A directory where the temporary version file goes makes the write fail.
    let blocker = dir.path().join("v.tmp");
    fs::create_dir(&blocker).unwrap();
    db.table_mut("t").unwrap().add(b"lost", b"2").unwrap();
    assert!(matches!(db.commit(), Err(Error::Opening { .. })));
    assert_eq!(db.revision(), 1);
    assert!(!db.table("t").unwrap().key_exists(b"lost").unwrap());
    assert!(db.table("t").unwrap().key_exists(b"kept").unwrap());

    fs::remove_dir(&blocker).unwrap();
    db.table_mut("t").unwrap().add(b"later", b"3").unwrap();
    let revision = db.commit().unwrap();
    assert!(revision > 2, "revision {} reused a failed number", revision);

    let reader = Database::open_readonly(dir.path(), options()).unwrap();
    assert_eq!(reader.revision(), revision);
    let table = reader.table("t").unwrap();
    assert!(table.key_exists(b"kept").unwrap());
    assert!(table.key_exists(b"later").unwrap());
    assert!(!table.key_exists(b"lost").unwrap());
}

/// A table file cut short is reported as corruption
#[test]
fn test_truncated_table_file() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    populate(&dir, 2000);

    let path = dir.path().join("t.lrt");
    let len = fs::metadata(&path).unwrap().len();
    OpenOptions::new().write(true).open(&path).unwrap().set_len(len / 4).unwrap();

    let result = Database::open_readonly(dir.path(), options()).and_then(|db| {
        let table = db.table("t")?;
        let mut cursor = table.cursor()?;
        while cursor.next()? {
            cursor.value()?;
        }
        Ok(())
    });
    assert!(matches!(result, Err(Error::Corruption(_))), "got {:?}", result);
}

/// Garbage written over blocks is found by the consistency check
#[test]
fn test_scribbled_block_is_detected() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    populate(&dir, 2000);
    let root = {
        let db = Database::open_readonly(dir.path(), options()).unwrap();
        db.table("t").unwrap().root_info().root
    };

    // Damage every block but the root.
    let path = dir.path().join("t.lrt");
    let blocks = fs::metadata(&path).unwrap().len() / 2048;
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    for n in (0..blocks as u32).filter(|&n| n != root) {
        file.seek(SeekFrom::Start(n as u64 * 2048 + 5)).unwrap();
        file.write_all(&[0xff; 64]).unwrap();
    }
    drop(file);

    let mut db = Database::open_readonly(dir.path(), options()).unwrap();
    let report = db.check(false).unwrap();
    assert!(!report.is_ok());
    assert!(!report.tables[0].errors.is_empty());
}

/// Leaked blocks are reported and --fix style repair reclaims them
#[test]
fn test_leaked_blocks_are_fixed() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    populate(&dir, 3000);
    {
        // A second revision frees the blocks the first one used.
        let mut db = Database::open(dir.path(), options()).unwrap();
        for i in (0..3000u32).step_by(3) {
            db.table_mut("t").unwrap().add(format!("key{:05}", i).as_bytes(), &[0x44; 40]).unwrap();
        }
        db.commit().unwrap();
    }

    // Replace the free list in the version file with an empty one so every
    // free block leaks.
    {
        let mut version = larch::version::VersionFile::read(dir.path()).unwrap();
        let mut root = version.tables()[0].1.clone();
        let free_list = larch::freelist::FreeList::unpack(&root.free_list).unwrap();
        let mut packed = Vec::new();
        larch::pack::pack_uint(&mut packed, free_list.revision() as u64);
        larch::pack::pack_uint(&mut packed, free_list.first_unused_block() as u64);
        packed.extend_from_slice(&[0, 0, 0, 0]);
        root.free_list = packed;
        let revision = version.revision();
        version.advance(revision, vec![root]);
        version.write(dir.path(), false, true, None).unwrap();
    }

    let mut db = Database::open(dir.path(), options()).unwrap();
    let report = db.check(false).unwrap();
    assert!(report.tables[0].errors.is_empty(), "{:?}", report.tables[0].errors);
    assert!(!report.tables[0].leaked_blocks.is_empty());

    let fixed = db.check(true).unwrap();
    assert_eq!(fixed.fixed, vec!["t".to_string()]);
    let after = db.check(false).unwrap();
    assert!(after.is_ok(), "{:?}", after);

    // The reclaimed blocks are handed out again.
    for i in 0..3000u32 {
        db.table_mut("t").unwrap().add(format!("key{:05}", i).as_bytes(), &[0x43; 40]).unwrap();
    }
    db.commit().unwrap();
    assert!(db.check(false).unwrap().is_ok());
}

/// Opening with a table file missing fails with an opening error
#[test]
fn test_missing_table_file() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    populate(&dir, 10);
    fs::remove_file(dir.path().join("t.lrt")).unwrap();
    assert!(matches!(
        Database::open_readonly(dir.path(), options()),
        Err(Error::Opening { .. })
    ));
}
