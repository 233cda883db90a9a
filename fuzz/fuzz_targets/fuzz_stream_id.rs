//! Fuzz target for stream id handling.

#![no_main]

use global_sync::source::redis::{seq_from_stream_id, stream_id_for};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, u64)| {
    let (id, seq) = data;

    // Should never panic
    let _ = seq_from_stream_id(id);

    assert_eq!(seq_from_stream_id(&stream_id_for(seq)).ok(), Some(seq));
});
