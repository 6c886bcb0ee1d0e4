//! Proptest strategies for genstore types.
//!
//! # Usage
//!
//! ```no_run
//! use genstore_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn handle_keeps_its_parts(gen_id in strategies::arb_data_gen_id(), offset in strategies::arb_offset()) {
//!         let h = genstore_types::Handle::new(gen_id, offset);
//!         prop_assert_eq!(h.decode(), (gen_id, offset));
//!     }
//! }
//! ```

use genstore_types::{GenId, Handle};
use proptest::prelude::*;

/// Any generation id, including the reserved ones.
pub fn arb_gen_id() -> impl Strategy<Value = GenId> {
    any::<u16>().prop_map(GenId)
}

/// Generation ids that can name a data generation.
pub fn arb_data_gen_id() -> impl Strategy<Value = GenId> {
    (GenId::FIRST_DATA.0..=u16::MAX).prop_map(GenId)
}

/// Offsets that fit the 48-bit handle field.
pub fn arb_offset() -> impl Strategy<Value = u64> {
    prop_oneof![0..4096u64, 0..=Handle::MAX_OFFSET, Just(Handle::MAX_OFFSET)]
}

/// Handles into data generations.
pub fn arb_handle() -> impl Strategy<Value = Handle> {
    (arb_data_gen_id(), arb_offset()).prop_map(|(g, o)| Handle::new(g, o))
}

/// Item payloads from empty to a few granules long.
pub fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..700)
}

/// Item payloads paired with a liveness flag, for compaction properties.
pub fn arb_items() -> impl Strategy<Value = Vec<(Vec<u8>, bool)>> {
    proptest::collection::vec((arb_payload(), any::<bool>()), 0..24)
}
