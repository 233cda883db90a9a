//! Fuzz target for patch decompression.
//!
//! `maybe_decompress` must never panic, and anything without the zstd
//! magic passes through untouched.

#![no_main]

use global_sync::source::redis::maybe_decompress;
use libfuzzer_sys::fuzz_target;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

fuzz_target!(|data: &[u8]| {
    let result = maybe_decompress(data);
    if data.len() < 4 || data[..4] != ZSTD_MAGIC {
        assert_eq!(result.ok().as_deref(), Some(data));
    }
});
