// Integration tests for the engine's read and write paths

mod common;

use common::{get, key_of, put, scan, small_options, value_of, DbTestFixture};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use strata_storage::{ReadOptions, WriteOptions};

fn kv(k: &str, v: &str) -> (Vec<u8>, Vec<u8>) {
    (k.as_bytes().to_vec(), v.as_bytes().to_vec())
}

#[test]
fn test_snapshot_scenario() {
    let fixture = DbTestFixture::new();
    let db = fixture.open();

    put(&db, b"a", b"1");
    put(&db, b"a", b"2");
    put(&db, b"b", b"3");
    let snapshot = db.get_snapshot();
    db.delete(b"a", WriteOptions::default()).unwrap();

    assert_eq!(get(&db, b"a"), None);
    let at = ReadOptions::new().with_snapshot(snapshot.clone());
    assert_eq!(db.get(b"a", &at).unwrap(), Some(b"2".to_vec()));
    assert_eq!(scan(&db, &ReadOptions::default()), vec![kv("b", "3")]);
    assert_eq!(scan(&db, &at), vec![kv("a", "2"), kv("b", "3")]);

    // Same answers once everything has been compacted
    db.compact_range(None, None).unwrap();
    assert_eq!(get(&db, b"a"), None);
    assert_eq!(db.get(b"a", &at).unwrap(), Some(b"2".to_vec()));
    assert_eq!(scan(&db, &at), vec![kv("a", "2"), kv("b", "3")]);
    snapshot.release();
}

#[test]
fn test_batch_is_atomic_and_ordered() {
    let fixture = DbTestFixture::new();
    let db = fixture.open();
    put(&db, b"x", b"old");

    let mut batch = db.new_write_batch();
    batch.put(b"x", b"1").delete(b"x").put(b"y", b"2").put(b"x", b"3");
    db.write(batch, WriteOptions::default()).unwrap();

    // Later operations in a batch win
    assert_eq!(get(&db, b"x"), Some(b"3".to_vec()));
    assert_eq!(get(&db, b"y"), Some(b"2".to_vec()));
}

#[test]
fn test_empty_values_and_keys() {
    let fixture = DbTestFixture::new();
    let db = fixture.open();
    put(&db, b"", b"empty key");
    put(&db, b"k", b"");
    assert_eq!(get(&db, b""), Some(b"empty key".to_vec()));
    assert_eq!(get(&db, b"k"), Some(Vec::new()));
    db.compact_range(None, None).unwrap();
    assert_eq!(get(&db, b""), Some(b"empty key".to_vec()));
    assert_eq!(get(&db, b"k"), Some(Vec::new()));
}

#[test]
fn test_many_writes_spill_to_tables() {
    let fixture = DbTestFixture::new();
    let db = fixture.open_with(small_options());
    for i in 0..2000 {
        put(&db, &key_of(i), &value_of(i, 100));
    }
    for i in (0..2000).step_by(3) {
        db.delete(&key_of(i), WriteOptions::default()).unwrap();
    }

    let tables: usize = DbTestFixture::files_per_level(&db).iter().sum();
    assert!(tables > 0);
    for i in 0..2000 {
        let expected = (i % 3 != 0).then(|| value_of(i, 100));
        assert_eq!(get(&db, &key_of(i)), expected, "key {}", i);
    }

    let all = scan(&db, &ReadOptions::default());
    assert_eq!(all.len(), 2000 - 667);
    assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn test_concurrent_writers_all_land() {
    let fixture = DbTestFixture::new();
    let db = Arc::new(fixture.open_with(small_options()));
    let threads = 8;
    let per_thread = 250u32;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..per_thread {
                    let key = format!("t{}-{:04}", t, i);
                    let sync = i % 50 == 0;
                    db.put(key.as_bytes(), &value_of(i, 32), WriteOptions::new().with_sync(sync))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..threads {
        for i in 0..per_thread {
            let key = format!("t{}-{:04}", t, i);
            assert_eq!(get(&db, key.as_bytes()), Some(value_of(i, 32)));
        }
    }
    assert_eq!(
        scan(&db, &ReadOptions::default()).len(),
        threads * per_thread as usize
    );
}

#[test]
fn test_concurrent_write_snapshots_are_distinct_and_consistent() {
    let fixture = DbTestFixture::new();
    let db = Arc::new(fixture.open());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                (0..100u32)
                    .map(|i| {
                        let key = format!("t{}-{:03}", t, i);
                        let snapshot = db
                            .put(key.as_bytes(), b"v", WriteOptions::new().with_snapshot(true))
                            .unwrap()
                            .unwrap();
                        // The write is visible at its own snapshot
                        let at = ReadOptions::new().with_snapshot(snapshot.clone());
                        assert_eq!(db.get(key.as_bytes(), &at).unwrap(), Some(b"v".to_vec()));
                        snapshot.sequence()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut sequences = HashSet::new();
    for handle in handles {
        for sequence in handle.join().unwrap() {
            assert!(sequences.insert(sequence), "duplicate sequence {}", sequence);
        }
    }
    assert_eq!(sequences.len(), 400);
    assert_eq!(sequences.iter().max(), Some(&400));
}

#[test]
fn test_readers_run_alongside_writers() {
    let fixture = DbTestFixture::new();
    let db = Arc::new(fixture.open_with(small_options()));
    for i in 0..500 {
        put(&db, &key_of(i), b"stable");
    }

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for i in 500..3000 {
                put(&db, &key_of(i), &value_of(i, 64));
            }
        })
    };
    let reader = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for round in 0..20 {
                for i in (0..500).step_by(7) {
                    assert_eq!(get(&db, &key_of(i)), Some(b"stable".to_vec()), "round {}", round);
                }
            }
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();
    assert_eq!(get(&db, &key_of(2999)), Some(value_of(2999, 64)));
}

#[test]
fn test_iterator_pins_its_view_across_compaction() {
    let fixture = DbTestFixture::new();
    let db = fixture.open_with(small_options());
    for i in 0..300 {
        put(&db, &key_of(i), &value_of(i, 50));
    }

    let mut it = db.new_iterator(&ReadOptions::default());
    for i in 0..300 {
        db.delete(&key_of(i), WriteOptions::default()).unwrap();
    }
    db.compact_range(None, None).unwrap();
    assert!(scan(&db, &ReadOptions::default()).is_empty());

    it.seek_to_first();
    let mut count = 0;
    while it.valid() {
        assert_eq!(it.key(), key_of(count).as_slice());
        count += 1;
        it.next();
    }
    it.status().unwrap();
    assert_eq!(count, 300);
}

#[test]
fn test_verify_checksums_reads() {
    let fixture = DbTestFixture::new();
    let db = fixture.open();
    put(&db, b"k", b"v");
    db.compact_range(None, None).unwrap();
    let options = ReadOptions::new().with_verify_checksums(true);
    assert_eq!(db.get(b"k", &options).unwrap(), Some(b"v".to_vec()));
    assert_eq!(scan(&db, &options), vec![kv("k", "v")]);
}
