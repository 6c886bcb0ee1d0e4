//! Generation ids and handles.
//!
//! A [`Handle`] packs a generation id into the top 16 bits and a byte offset
//! within that generation into the low 48 bits:
//!
//! ```text
//!  63            48 47                                             0
//! ┌────────────────┬────────────────────────────────────────────────┐
//! │     GenId      │              byte offset                       │
//! └────────────────┴────────────────────────────────────────────────┘
//! ```
//!
//! Business code treats handles as opaque. Only the store resolves them to
//! bytes, and always through a bounds-checked accessor.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Identifier of a generation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct GenId(pub u16);

impl GenId {
    /// Reserved id; never names a generation.
    pub const NULL: GenId = GenId(0);

    /// The management generation, permanently resident.
    pub const MGMT: GenId = GenId(1);

    /// Smallest id that can name a data generation.
    pub const FIRST_DATA: GenId = GenId(2);

    /// Returns `true` for the reserved null id.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` for the management generation.
    #[inline]
    pub const fn is_mgmt(self) -> bool {
        self.0 == Self::MGMT.0
    }
}

impl fmt::Display for GenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for GenId {
    fn from(id: u16) -> Self {
        GenId(id)
    }
}

/// Opaque address of an item: generation id plus byte offset.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct Handle(u64);

impl Handle {
    /// The null handle (generation 0, offset 0).
    pub const NULL: Handle = Handle(0);

    /// Number of low bits holding the offset.
    pub const OFFSET_BITS: u32 = 48;

    /// Largest representable offset.
    pub const MAX_OFFSET: u64 = (1 << Self::OFFSET_BITS) - 1;

    /// Packs a generation id and offset.
    ///
    /// Offset bits above [`Self::OFFSET_BITS`] are discarded; use
    /// [`Self::try_new`] when the offset is not already known to fit.
    #[inline]
    pub const fn new(gen_id: GenId, offset: u64) -> Self {
        Handle(((gen_id.0 as u64) << Self::OFFSET_BITS) | (offset & Self::MAX_OFFSET))
    }

    /// Packs a generation id and offset, rejecting offsets that do not fit.
    #[inline]
    pub const fn try_new(gen_id: GenId, offset: u64) -> Option<Self> {
        if offset > Self::MAX_OFFSET {
            return None;
        }
        Some(Self::new(gen_id, offset))
    }

    /// Wraps a raw packed value read from an image.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    /// Returns the raw packed value, for storing inside an image.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Generation part.
    #[inline]
    pub const fn gen_id(self) -> GenId {
        GenId((self.0 >> Self::OFFSET_BITS) as u16)
    }

    /// Offset part.
    #[inline]
    pub const fn offset(self) -> u64 {
        self.0 & Self::MAX_OFFSET
    }

    /// Splits the handle into its generation id and offset.
    #[inline]
    pub const fn decode(self) -> (GenId, u64) {
        (self.gen_id(), self.offset())
    }

    /// Returns `true` for the null handle.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` when the handle carries no offset.
    ///
    /// Chain links use a zero offset as the end marker even when the
    /// generation part is set.
    #[inline]
    pub const fn is_end(self) -> bool {
        self.offset() == 0
    }

    /// Same generation, different offset.
    #[inline]
    pub const fn with_offset(self, offset: u64) -> Self {
        Self::new(self.gen_id(), offset)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}:{:#x})", self.gen_id(), self.offset())
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.gen_id(), self.offset())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_null_handle() {
        assert!(Handle::NULL.is_null());
        assert!(Handle::NULL.is_end());
        assert_eq!(Handle::NULL.decode(), (GenId::NULL, 0));
    }

    #[test]
    fn test_packing_layout() {
        let h = Handle::new(GenId(5), 0x1234);
        assert_eq!(h.raw(), (5u64 << 48) | 0x1234);
        assert_eq!(h.gen_id(), GenId(5));
        assert_eq!(h.offset(), 0x1234);
        assert!(!h.is_end());
    }

    #[test]
    fn test_end_marker_keeps_generation() {
        let h = Handle::new(GenId(9), 0);
        assert!(h.is_end());
        assert!(!h.is_null());
    }

    #[test]
    fn test_try_new_rejects_wide_offset() {
        assert!(Handle::try_new(GenId(3), Handle::MAX_OFFSET).is_some());
        assert!(Handle::try_new(GenId(3), Handle::MAX_OFFSET + 1).is_none());
    }

    #[test]
    fn test_new_masks_wide_offset() {
        let h = Handle::new(GenId(2), (1 << 48) | 8);
        assert_eq!(h.decode(), (GenId(2), 8));
    }

    #[test]
    fn test_with_offset() {
        let h = Handle::new(GenId(7), 64).with_offset(128);
        assert_eq!(h.decode(), (GenId(7), 128));
    }

    #[test]
    fn test_display() {
        assert_eq!(Handle::new(GenId(5), 0x40).to_string(), "5:0x40");
        assert_eq!(format!("{:?}", Handle::new(GenId(1), 8)), "Handle(1:0x8)");
    }

    #[test]
    fn test_gen_id_classification() {
        assert!(GenId::NULL.is_null());
        assert!(GenId::MGMT.is_mgmt());
        assert!(!GenId::FIRST_DATA.is_mgmt());
    }

    #[test]
    fn test_serde_is_transparent() {
        let h = Handle::new(GenId(4), 16);
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, h.raw().to_string());
        let back: Handle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    proptest! {
        #[test]
        fn prop_handle_round_trip(gen_id in any::<u16>(), offset in 0u64..=Handle::MAX_OFFSET) {
            let h = Handle::new(GenId(gen_id), offset);
            prop_assert_eq!(h.decode(), (GenId(gen_id), offset));
            prop_assert_eq!(Handle::from_raw(h.raw()), h);
        }
    }
}
