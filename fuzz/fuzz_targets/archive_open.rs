//! Fuzz target for Archive::open with arbitrary byte input.
//!
//! Probes every format, lists the items and tests them under tight limits,
//! looking for panics, hangs or runaway allocations.
//!
//! Run with: cargo +nightly fuzz run archive_open

#![no_main]

use std::io::Cursor;

use arkiv::{Archive, ExtractOptions, Limits, OpenOptions, Selection};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let limits = Limits::default()
        .max_items(4096)
        .max_header_bytes(1 << 22)
        .max_item_size(1 << 22);
    let options = OpenOptions::new().limits(limits);
    let Ok(mut archive) = Archive::open(Cursor::new(data), options) else {
        return;
    };
    for item in archive.items() {
        let _ = (&item.name, item.size, item.crc, item.kind);
    }
    let _ = archive.test(Selection::All, ExtractOptions::new());
});
