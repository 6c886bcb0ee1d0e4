//! Fuzz target for generation image decoding.
//!
//! Arbitrary bytes handed to `GenImage::from_bytes` must either be rejected
//! or yield an image whose map, items and expansion can be walked without
//! panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;

use genstore::{GenImage, GenMap, compaction::expand_image};

/// Expanded images above this size are skipped to keep runs fast.
const MAX_EXPANDED: u64 = 16 * 1024 * 1024;

fuzz_target!(|data: &[u8]| {
    let Ok(image) = GenImage::from_bytes(data.to_vec()) else {
        return;
    };

    let _ = image.used_len();
    for offset in image.granule_offsets() {
        if let Ok(desc) = image.descriptor(offset) {
            let _ = image.canonical_offset(&desc);
            let _ = image.payload(offset);
        }
    }

    if !image.is_compacted() {
        return;
    }
    if let Ok(map) = GenMap::build(&image) {
        let _ = map.byte_size();
    }
    for item in image.compacted_items().take(4096) {
        let _ = item;
    }
    if image.header().mem_size_bytes <= MAX_EXPANDED {
        let _ = expand_image(&image);
    }
});
