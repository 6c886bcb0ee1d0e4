//! Fuzz target for handle packing.
//!
//! Any raw 64-bit value must split into a generation id and offset that
//! pack back into the same value.

#![no_main]

use libfuzzer_sys::fuzz_target;

use genstore::{GenId, Handle};

fuzz_target!(|data: [u8; 8]| {
    let raw = u64::from_le_bytes(data);
    let handle = Handle::from_raw(raw);
    let (gen_id, offset) = handle.decode();
    assert_eq!(Handle::new(gen_id, offset), handle);
    assert_eq!(Handle::try_new(gen_id, offset), Some(handle));
    assert_eq!(handle.with_offset(offset), handle);
    assert_eq!(Handle::new(GenId(gen_id.0), offset).raw(), raw);
    assert!(offset <= Handle::MAX_OFFSET);
});
