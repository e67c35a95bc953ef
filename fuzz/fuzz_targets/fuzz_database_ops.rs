#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use std::collections::BTreeMap;
use strata::{Database, Options};

#[derive(Arbitrary, Debug)]
enum DbOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Get { key: Vec<u8> },
    Delete { key: Vec<u8> },
    Batch { puts: Vec<(Vec<u8>, Vec<u8>)>, deletes: Vec<Vec<u8>> },
    Compact,
    Reopen,
}

fuzz_target!(|ops: Vec<DbOp>| {
    let Ok(dir) = tempfile::tempdir() else {
        return;
    };
    let options = Options::default()
        .with_create_if_missing(true)
        .with_write_buffer_size(64 * 1024);
    let open = || Database::open_with_options(dir.path(), options.clone());
    let Ok(mut db) = open() else {
        return;
    };
    let mut model = BTreeMap::new();

    // Limit operations to prevent timeout
    for op in ops.into_iter().take(100) {
        match op {
            DbOp::Put { key, value } => {
                db.put(&key, &value).unwrap();
                model.insert(key, value);
            }
            DbOp::Get { key } => {
                assert_eq!(db.get(&key).unwrap(), model.get(&key).cloned());
            }
            DbOp::Delete { key } => {
                db.delete(&key).unwrap();
                model.remove(&key);
            }
            DbOp::Batch { puts, deletes } => {
                let mut batch = db.batch();
                for (key, value) in &puts {
                    batch.put(key, value);
                }
                for key in &deletes {
                    batch.delete(key);
                }
                db.write(batch).unwrap();
                model.extend(puts);
                for key in deletes {
                    model.remove(&key);
                }
            }
            DbOp::Compact => db.compact().unwrap(),
            DbOp::Reopen => {
                db.close().unwrap();
                db = open().unwrap();
            }
        }
    }

    let scanned: Vec<_> = db.iter().map(|entry| entry.unwrap()).collect();
    let expected: Vec<_> = model.into_iter().collect();
    assert_eq!(scanned, expected);
});
