// Crash Recovery Tests for larch
// These tests verify that only committed revisions survive and that
// rollback leaves tables exactly as they were committed

use larch::changes::read_changeset;
use larch::version::VersionFile;
use larch::{Database, Error, Options};
use std::fs;
use tempfile::TempDir;

fn options() -> Options {
    Options::default().block_size(2048).no_sync(true)
}

/// Helper function to simulate a crash by dropping the database without a
/// clean shutdown. Uses mem::forget to prevent Drop from running
fn simulate_crash(db: Database) {
    std::mem::forget(db);
}

fn collect(db: &Database, table: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut cursor = db.table(table).unwrap().cursor().unwrap();
    let mut out = Vec::new();
    while cursor.next().unwrap() {
        out.push((cursor.key().unwrap().to_vec(), cursor.value().unwrap()));
    }
    out
}

/// Uncommitted writes vanish after a crash; committed ones survive
#[test]
fn test_recovery_after_crash_mid_transaction() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();

    // First session: commit some data, then crash with more pending
    {
        let mut db = Database::create(dir.path(), &["t"], options()).unwrap();
        for i in 0..300u32 {
            db.table_mut("t").unwrap().add(format!("key_{}", i).as_bytes(), b"committed").unwrap();
        }
        db.commit().unwrap();

        let table = db.table_mut("t").unwrap();
        for i in 0..300u32 {
            table.add(format!("key_{}", i).as_bytes(), b"pending").unwrap();
        }
        for i in 300..2000u32 {
            table.add(format!("key_{}", i).as_bytes(), &[0x55; 100]).unwrap();
        }
        // Push dirty blocks to disk without committing.
        table.flush().unwrap();
        simulate_crash(db);
    }

    // Second session: only revision 1 is visible
    let db = Database::open(dir.path(), options()).unwrap();
    assert_eq!(db.revision(), 1);
    let table = db.table("t").unwrap();
    assert_eq!(table.entry_count(), 300);
    for i in 0..300u32 {
        assert_eq!(
            table.get_exact_entry(format!("key_{}", i).as_bytes()).unwrap(),
            Some(b"committed".to_vec()),
            "key_{} should hold its committed value",
            i
        );
    }
    assert!(!table.key_exists(b"key_1999").unwrap());
    let report = Database::open_readonly(dir.path(), options()).unwrap().check(false).unwrap();
    assert!(report.tables[0].errors.is_empty(), "{:?}", report);
}

/// cancel() restores the last committed state exactly
#[test]
fn test_cancel_restores_last_commit() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    let mut db = Database::create(dir.path(), &["t"], options()).unwrap();
    for i in 0..1000u32 {
        db.table_mut("t").unwrap().add(format!("{:05}", i).as_bytes(), &[1u8; 60]).unwrap();
    }
    db.commit().unwrap();
    let before = collect(&db, "t");
    let root_before = db.table("t").unwrap().root_info().clone();

    let table = db.table_mut("t").unwrap();
    for i in 0..1000u32 {
        if i % 3 == 0 {
            table.del(format!("{:05}", i).as_bytes()).unwrap();
        } else {
            table.add(format!("{:05}x", i).as_bytes(), &[2u8; 200]).unwrap();
        }
    }
    db.cancel().unwrap();

    assert_eq!(collect(&db, "t"), before);
    let table = db.table("t").unwrap();
    assert_eq!(table.root_info(), &root_before);
    assert!(!table.is_modified());

    // Work after a cancel commits normally.
    db.table_mut("t").unwrap().add(b"after", b"cancel").unwrap();
    assert_eq!(db.commit().unwrap(), 2);
    let report = db.check(false).unwrap();
    assert!(report.is_ok(), "{:?}", report);
}

/// Deleting an absent key changes nothing
#[test]
fn test_delete_absent_key_is_a_no_op() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    let mut db = Database::create(dir.path(), &["t"], options()).unwrap();
    for i in 0..500u32 {
        db.table_mut("t").unwrap().add(format!("k{}", i).as_bytes(), b"v").unwrap();
    }
    db.commit().unwrap();
    let root_before = db.table("t").unwrap().root_info().clone();

    let table = db.table_mut("t").unwrap();
    assert!(!table.del(b"missing").unwrap());
    assert!(!table.del(b"").unwrap());
    assert!(!table.is_modified());

    db.commit().unwrap();
    let root_after = db.table("t").unwrap().root_info();
    assert_eq!(root_after.root, root_before.root);
    assert_eq!(root_after.level, root_before.level);
    assert_eq!(root_after.num_entries, root_before.num_entries);
    assert_eq!(root_after.sequential, root_before.sequential);
}

/// A leftover temporary version file from a crashed commit is ignored
#[test]
fn test_torn_version_write_is_ignored() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    {
        let mut db = Database::create(dir.path(), &["t"], options()).unwrap();
        db.table_mut("t").unwrap().add(b"k", b"v").unwrap();
        db.commit().unwrap();
    }
    fs::write(dir.path().join("v.tmp"), b"half a version file").unwrap();

    let mut db = Database::open(dir.path(), options()).unwrap();
    assert_eq!(db.revision(), 1);
    db.table_mut("t").unwrap().add(b"k2", b"v2").unwrap();
    assert_eq!(db.commit().unwrap(), 2);
    assert!(!dir.path().join("v.tmp").exists());
}

/// A damaged version file is reported, not silently repaired
#[test]
fn test_damaged_version_file() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    Database::create(dir.path(), &["t"], options()).unwrap();
    let path = VersionFile::path(dir.path());
    let mut image = fs::read(&path).unwrap();
    let n = image.len();
    image[n / 2] ^= 0xff;
    fs::write(&path, image).unwrap();
    assert!(matches!(Database::open(dir.path(), options()), Err(Error::Corruption(_))));
}

/// Each commit leaves a changeset chaining one revision to the next
#[test]
fn test_changesets_chain_revisions() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    let mut db = Database::create(dir.path(), &["a", "b"], options().max_changesets(3)).unwrap();
    for rev in 1..=5u32 {
        for i in 0..200u32 {
            db.table_mut("a").unwrap().add(format!("{}-{}", rev, i).as_bytes(), &[rev as u8; 30]).unwrap();
        }
        db.table_mut("b").unwrap().add(format!("rev{}", rev).as_bytes(), b"b").unwrap();
        assert_eq!(db.commit().unwrap(), rev);
    }

    // Only the most recent changesets are kept.
    assert!(!dir.path().join("changes0").exists());
    assert!(!dir.path().join("changes1").exists());
    for old in 2..5u32 {
        let cs = read_changeset(dir.path().join(format!("changes{}", old))).unwrap();
        assert_eq!(cs.old_rev, old);
        assert_eq!(cs.new_rev, old + 1);
        assert!(!cs.dangerous);
        assert!(cs.blocks.iter().any(|b| b.table_id == 0));
        assert!(cs.blocks.iter().any(|b| b.table_id == 1));
        assert!(cs.blocks.iter().all(|b| b.block_size == 2048 && b.data.len() == 2048));
        let version = VersionFile::parse(cs.version.as_deref().unwrap()).unwrap();
        assert_eq!(version.revision(), old + 1);
        assert_eq!(version.uuid(), db.uuid());
    }
}

/// A reader opened before a writer crash keeps its revision
#[test]
fn test_reader_unaffected_by_writer_crash() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    let mut writer = Database::create(dir.path(), &["t"], options()).unwrap();
    for i in 0..100u32 {
        writer.table_mut("t").unwrap().add(format!("{:03}", i).as_bytes(), b"one").unwrap();
    }
    writer.commit().unwrap();

    let reader = Database::open_readonly(dir.path(), options()).unwrap();
    let expected = collect(&reader, "t");

    for i in 0..100u32 {
        writer.table_mut("t").unwrap().add(format!("{:03}", i).as_bytes(), b"two").unwrap();
    }
    writer.table_mut("t").unwrap().flush().unwrap();
    simulate_crash(writer);

    assert_eq!(collect(&reader, "t"), expected);
    let mut reader = reader;
    assert!(!reader.reopen().unwrap());
}
