//! Fuzz target for staged-record decoding.
//!
//! Records in the staging collection may be written by other tools, so
//! decoding must reject garbage without panicking.

#![no_main]

use changestream_migration::StagedRecord;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(doc) = bson::from_slice::<bson::Document>(data) else {
        return;
    };

    // Should never panic
    if let Ok(record) = StagedRecord::from_document(&doc) {
        // A decoded record re-encodes to something that decodes the same
        if let Ok(again) = StagedRecord::from_document(&record.to_document()) {
            assert_eq!(again.id, record.id);
            assert_eq!(again.sequence, record.sequence);
            assert_eq!(again.status, record.status);
        }
    }
});
