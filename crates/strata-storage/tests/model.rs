// Property tests: the engine against an in-memory model

mod common;

use common::{scan, small_options, DbTestFixture};
use proptest::prelude::*;
use std::collections::BTreeMap;
use strata_storage::{ReadOptions, WriteOptions};

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    Compact,
    Reopen,
}

fn key() -> impl Strategy<Value = Vec<u8>> {
    // A small alphabet so keys collide often
    prop::collection::vec(prop::sample::select(vec![b'a', b'b', b'c', b'd']), 0..4)
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (key(), prop::collection::vec(any::<u8>(), 0..300)).prop_map(|(k, v)| Op::Put(k, v)),
        3 => key().prop_map(Op::Delete),
        1 => Just(Op::Compact),
        1 => Just(Op::Reopen),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_engine_matches_model(ops in prop::collection::vec(op(), 1..120)) {
        let fixture = DbTestFixture::new();
        let mut db = fixture.open_with(small_options());
        let mut model = BTreeMap::new();

        for op in ops {
            match op {
                Op::Put(k, v) => {
                    db.put(&k, &v, WriteOptions::default()).unwrap();
                    model.insert(k, v);
                }
                Op::Delete(k) => {
                    db.delete(&k, WriteOptions::default()).unwrap();
                    model.remove(&k);
                }
                Op::Compact => db.compact_range(None, None).unwrap(),
                Op::Reopen => {
                    db.close().unwrap();
                    db = fixture.open_with(small_options());
                }
            }
        }

        let expected: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        prop_assert_eq!(scan(&db, &ReadOptions::default()), expected);
        for (k, v) in &model {
            prop_assert_eq!(db.get(k, &ReadOptions::default()).unwrap(), Some(v.clone()));
        }
    }

    #[test]
    fn test_iteration_is_strictly_ordered(
        keys in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..12), 1..200)
    ) {
        let fixture = DbTestFixture::new();
        let db = fixture.open_with(small_options());
        for (i, k) in keys.iter().enumerate() {
            db.put(k, &i.to_le_bytes(), WriteOptions::default()).unwrap();
            if i % 7 == 0 {
                db.delete(k, WriteOptions::default()).unwrap();
            }
        }

        let all = scan(&db, &ReadOptions::default());
        prop_assert!(all.windows(2).all(|w| w[0].0 < w[1].0));

        // Backward iteration visits the same keys in reverse
        let mut it = db.new_iterator(&ReadOptions::default());
        let mut backward = Vec::new();
        it.seek_to_last();
        while it.valid() {
            backward.push(it.key().to_vec());
            it.prev();
        }
        backward.reverse();
        let forward: Vec<_> = all.into_iter().map(|(k, _)| k).collect();
        prop_assert_eq!(forward, backward);
    }
}
