//! Fuzz target for origin stream entry parsing.
//!
//! Arbitrary field bytes must produce an error, never a panic.

#![no_main]

use global_sync::source::redis::{parse_entry, seq_from_stream_id};
use libfuzzer_sys::fuzz_target;
use std::collections::HashMap;

fuzz_target!(|data: (&str, Vec<(String, Vec<u8>)>)| {
    let (stream_id, raw) = data;
    let fields: HashMap<String, redis::Value> = raw
        .into_iter()
        .map(|(k, v)| (k, redis::Value::BulkString(v)))
        .collect();

    if let Ok(op) = parse_entry(stream_id, &fields) {
        // A parsed entry always agrees with its stream id.
        assert_eq!(seq_from_stream_id(stream_id).ok(), Some(op.origin_seq));
    }
});
