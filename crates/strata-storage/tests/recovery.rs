// Crash recovery and reopen tests for the engine

mod common;

use common::{get, key_of, put, scan, small_options, value_of, DbTestFixture};
use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use strata_core::{Comparator, Error, Options};
use strata_storage::{destroy, Db, ReadOptions, WriteOptions};
use strata_wal::LogWriter;

/// Copy the files of a live database, as a crash would leave them
fn crash_copy(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name();
        if name == "LOCK" {
            continue;
        }
        fs::copy(entry.path(), to.join(&name)).unwrap();
    }
}

fn log_files(path: &Path) -> Vec<std::path::PathBuf> {
    let mut logs: Vec<_> = fs::read_dir(path)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .collect();
    logs.sort();
    logs
}

#[test]
fn test_unflushed_writes_survive_crash() {
    let fixture = DbTestFixture::new();
    let db = fixture.open();
    for i in 0..100 {
        let mut batch = db.new_write_batch();
        batch.put(&key_of(i), &value_of(i, 20));
        if i % 10 == 0 {
            batch.delete(&key_of(i));
        }
        db.write(batch, WriteOptions::default()).unwrap();
    }

    let crashed = fixture.temp_dir.path().join("crashed");
    crash_copy(fixture.path(), &crashed);
    drop(db);

    let db = Db::open(&crashed, Options::default()).unwrap();
    for i in 0..100 {
        let expected = (i % 10 != 0).then(|| value_of(i, 20));
        assert_eq!(get(&db, &key_of(i)), expected);
    }
}

#[test]
fn test_sync_writes_survive_crash_after_flushes() {
    let fixture = DbTestFixture::new();
    let db = fixture.open_with(small_options());
    for i in 0..1000 {
        let sync = i % 100 == 99;
        db.put(&key_of(i), &value_of(i, 64), WriteOptions::new().with_sync(sync))
            .unwrap();
    }

    let crashed = fixture.temp_dir.path().join("crashed");
    crash_copy(fixture.path(), &crashed);
    drop(db);

    let db = Db::open(&crashed, small_options()).unwrap();
    for i in 0..1000 {
        assert_eq!(get(&db, &key_of(i)), Some(value_of(i, 64)), "key {}", i);
    }
}

#[test]
fn test_torn_batch_is_never_partially_applied() {
    let fixture = DbTestFixture::new();
    {
        let db = fixture.open();
        put(&db, b"before", b"1");
        let mut batch = db.new_write_batch();
        for i in 0..50 {
            batch.put(&key_of(i), &value_of(i, 200));
        }
        db.write(batch, WriteOptions::default()).unwrap();
    }

    // Cut the last record in half
    let log = log_files(fixture.path()).pop().unwrap();
    let len = fs::metadata(&log).unwrap().len();
    let file = fs::OpenOptions::new().write(true).open(&log).unwrap();
    file.set_len(len - 5000).unwrap();

    let db = fixture.open();
    assert_eq!(get(&db, b"before"), Some(b"1".to_vec()));
    for i in 0..50 {
        assert_eq!(get(&db, &key_of(i)), None);
    }
}

#[test]
fn test_reopen_repeatedly() {
    let fixture = DbTestFixture::new();
    for round in 0..5u32 {
        let db = fixture.open_with(small_options());
        for i in 0..200 {
            put(&db, &key_of(round * 200 + i), &value_of(i, 40));
        }
        if round > 0 {
            db.delete(&key_of((round - 1) * 200), WriteOptions::default())
                .unwrap();
        }
        db.close().unwrap();
    }

    let db = fixture.open_with(small_options());
    let all = scan(&db, &ReadOptions::default());
    assert_eq!(all.len(), 1000 - 4);
    assert_eq!(get(&db, &key_of(0)), None);
    assert_eq!(get(&db, &key_of(1)), Some(value_of(1, 40)));
    assert_eq!(get(&db, &key_of(999)), Some(value_of(199, 40)));
}

#[test]
fn test_sequence_numbers_resume_after_reopen() {
    let fixture = DbTestFixture::new();
    {
        let db = fixture.open();
        for i in 0..10 {
            put(&db, &key_of(i), b"v");
        }
        db.compact_range(None, None).unwrap();
        put(&db, b"tail", b"v");
    }
    let db = fixture.open();
    let snapshot = db.get_snapshot();
    assert_eq!(snapshot.sequence(), 11);
    put(&db, &key_of(0), b"new");
    let at = ReadOptions::new().with_snapshot(snapshot);
    assert_eq!(db.get(&key_of(0), &at).unwrap(), Some(b"v".to_vec()));
    assert_eq!(get(&db, &key_of(0)), Some(b"new".to_vec()));
}

#[test]
fn test_paranoid_open_rejects_corrupt_log() {
    let fixture = DbTestFixture::new();
    {
        let db = fixture.open();
        put(&db, b"a", b"first");
        put(&db, b"b", b"second");
    }
    let log = log_files(fixture.path()).pop().unwrap();
    let mut bytes = fs::read(&log).unwrap();
    bytes[12] ^= 0xFF;
    fs::write(&log, bytes).unwrap();

    let paranoid = Options::default().with_paranoid_checks(true);
    let err = Db::open(fixture.path(), paranoid).unwrap_err();
    assert!(err.is_corruption(), "unexpected error {}", err);

    // Without paranoid checks the damaged record is skipped
    let db = Db::open(fixture.path(), Options::default()).unwrap();
    assert_eq!(get(&db, b"a"), None);
}

#[test]
fn test_malformed_batch_is_skipped_whole() {
    let fixture = DbTestFixture::new();
    {
        let db = fixture.open();
        put(&db, b"before", b"1");
        db.close().unwrap();
    }

    // One checksummed record: seq=10, count=2, a good put and a truncated put
    let mut record = Vec::new();
    record.extend_from_slice(&10u64.to_le_bytes());
    record.extend_from_slice(&2u32.to_le_bytes());
    record.push(1);
    record.extend_from_slice(&1u32.to_le_bytes());
    record.extend_from_slice(b"a");
    record.extend_from_slice(&1u32.to_le_bytes());
    record.extend_from_slice(b"x");
    record.push(1);
    record.extend_from_slice(&5u32.to_le_bytes());
    record.extend_from_slice(b"b");
    let mut writer = LogWriter::create(&fixture.path().join("000999.log")).unwrap();
    writer.add_record(&record).unwrap();
    writer.sync().unwrap();
    drop(writer);

    let paranoid = Options::default().with_paranoid_checks(true);
    let err = Db::open(fixture.path(), paranoid).unwrap_err();
    assert!(err.is_corruption(), "unexpected error {}", err);

    let db = Db::open(fixture.path(), Options::default()).unwrap();
    assert_eq!(get(&db, b"a"), None);
    assert_eq!(get(&db, b"before"), Some(b"1".to_vec()));
    assert_eq!(db.get_snapshot().sequence(), 1);
}

struct ReverseComparator;

impl Comparator for ReverseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        b.cmp(a)
    }

    fn name(&self) -> &str {
        "test.ReverseComparator"
    }
}

#[test]
fn test_custom_comparator_orders_keys_and_is_checked() {
    let fixture = DbTestFixture::new();
    let options = Options::default().with_comparator(Arc::new(ReverseComparator));
    {
        let db = fixture.open_with(options.clone());
        for k in ["a", "c", "b"] {
            put(&db, k.as_bytes(), k.as_bytes());
        }
        db.compact_range(None, None).unwrap();
        let keys: Vec<_> = scan(&db, &ReadOptions::default())
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    let err = Db::open(fixture.path(), Options::default()).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let db = Db::open(fixture.path(), options).unwrap();
    assert_eq!(get(&db, b"b"), Some(b"b".to_vec()));
}

#[test]
fn test_destroy_removes_database() {
    let fixture = DbTestFixture::new();
    {
        let db = fixture.open_with(small_options());
        for i in 0..500 {
            put(&db, &key_of(i), &value_of(i, 64));
        }
    }
    fs::write(fixture.path().join("notes.txt"), b"keep me").unwrap();

    destroy(fixture.path()).unwrap();
    let left: Vec<_> = fs::read_dir(fixture.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(left, vec![std::ffi::OsString::from("notes.txt")]);

    let db = fixture.open();
    assert_eq!(get(&db, &key_of(1)), None);
}

#[test]
fn test_destroy_refuses_open_database() {
    let fixture = DbTestFixture::new();
    let db = fixture.open();
    assert!(destroy(fixture.path()).is_err());
    put(&db, b"still", b"here");
    assert_eq!(get(&db, b"still"), Some(b"here".to_vec()));
}
