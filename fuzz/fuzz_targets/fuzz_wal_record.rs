#![no_main]

use libfuzzer_sys::fuzz_target;
use std::io::Cursor;
use strata_wal::LogReader;

fuzz_target!(|data: &[u8]| {
    // Limit input size to prevent timeout
    if data.len() > 1_000_000 {
        return;
    }

    // Tolerant and strict readers must both stop cleanly on any input
    for strict in [false, true] {
        let mut reader = LogReader::new(Cursor::new(data), strict);
        let mut total = 0usize;
        while let Ok(Some(record)) = reader.read_record() {
            total += record.len();
            assert!(total <= data.len());
        }
    }
});
