//! Fuzz target for raw change-document parsing.
//!
//! This tests that `ChangeEvent::from_raw` never panics on arbitrary BSON
//! and that a parsed event always carries its position.

#![no_main]

use changestream_migration::{ChangeEvent, Namespace};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = bson::from_slice::<bson::Document>(data) else {
        return;
    };
    let watched = Namespace::new("fuzz", "events");

    // Should never panic
    if let Ok(event) = ChangeEvent::from_raw(&raw, &watched) {
        assert_eq!(Some(event.source_position.as_document()), raw.get_document("_id").ok());
        let _ = event.key_display();
    }
});
