#![no_main]

use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use strata_core::BytewiseComparator;
use strata_storage::key::InternalKeyComparator;
use strata_storage::memtable::MemTable;
use strata_storage::WriteBatch;

fuzz_target!(|data: &[u8]| {
    if data.len() > 100_000 {
        return;
    }

    // Decoding a batch from a log record should never panic
    if let Ok(mut batch) = WriteBatch::from_contents(data) {
        let ops = batch.iter().take_while(|op| op.is_ok()).count();
        batch.set_sequence(1);
        let mem = MemTable::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)));
        match batch.insert_into(&mem) {
            Ok(()) => {
                assert_eq!(ops as u32, batch.count());
                assert_eq!(mem.len(), ops);
            }
            // A rejected batch applies nothing
            Err(_) => assert!(mem.is_empty()),
        }
    }
});
