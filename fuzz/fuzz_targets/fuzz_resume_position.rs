//! Fuzz target for checkpoint blob decoding.
//!
//! This tests that a damaged token file is rejected, never a panic.

#![no_main]

use changestream_migration::ResumePosition;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Should never panic
    if let Ok(position) = ResumePosition::from_bytes(data) {
        let bytes = position.to_bytes().expect("decoded position should encode");
        assert_eq!(ResumePosition::from_bytes(&bytes).ok(), Some(position));
    }
});
