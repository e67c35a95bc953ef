#![no_main]

use libfuzzer_sys::fuzz_target;
use std::io::Write;
use std::sync::Arc;
use strata_core::BytewiseComparator;
use strata_storage::iterator::InternalIterator;
use strata_storage::key::InternalKeyComparator;
use strata_storage::sstable::SSTableReader;

fuzz_target!(|data: &[u8]| {
    // Limit input size
    if data.len() > 10_000_000 {
        return;
    }

    // Write to temporary file and try to open and scan it as a table
    if let Ok(mut temp_file) = tempfile::NamedTempFile::new() {
        if temp_file.write_all(data).is_err() {
            return;
        }
        let cmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        if let Ok(reader) = SSTableReader::open(temp_file.path(), cmp) {
            let reader = Arc::new(reader);
            let mut it = reader.iter(true);
            it.seek_to_first();
            let mut steps = 0;
            while it.valid() && steps < 100_000 {
                it.next();
                steps += 1;
            }
            let _ = it.status();
            let _ = reader.get(b"needle", true);
        }
    }
});
