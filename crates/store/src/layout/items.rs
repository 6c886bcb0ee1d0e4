//! Payload formats of the internal item types.

use genstore_types::{GenId, Handle};

use super::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};
use crate::error::{Error, Result};

/// Encoded size of a [`SplitItem`].
pub const SPLIT_ITEM_SIZE: usize = 32;

/// Encoded size of the fixed part of a [`ReferenceChunk`].
pub const REFERENCE_CHUNK_HEADER_SIZE: usize = 24;

/// Encoded size of one [`Reference`].
pub const REFERENCE_SIZE: usize = 16;

/// Ref-state marking a reference as deleted.
pub const REFSTATE_DELETED: u8 = 0xfe;

/// Ref-state meaning "no override, keep the stored state".
pub const REFSTATE_NOT_VALID: u8 = 0xff;

/// Flag of a valid state entry.
pub const STATE_VALID: u8 = 1;

const REFSTATE_CHUNK_HEADER_SIZE: usize = 24;
const STATE_CHUNK_HEADER_SIZE: usize = 16;
const STATE_ENTRY_SIZE: usize = 8;
const GENID_CHUNK_HEADER_SIZE: usize = 8;

fn truncated(what: &str, len: usize) -> Error {
    Error::corrupted(format!("{what} truncated: {len} bytes"))
}

/// Owner record kept in the management generation.
///
/// The record's data lives in a data generation at `large_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SplitItem {
    /// Owner version; reference chunks carrying another version are orphans.
    pub version: u32,
    /// Length of the data at `large_data`.
    pub data_length: u32,
    /// Location of the record data; an end handle means none.
    pub large_data: Handle,
    /// References below this order id are no longer needed.
    pub min_active_order_id: u64,
}

impl SplitItem {
    /// Decodes from a payload slice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the payload is shorter than [`SPLIT_ITEM_SIZE`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SPLIT_ITEM_SIZE {
            return Err(truncated("split item", buf.len()));
        }
        Ok(Self {
            version: get_u32(buf, 0),
            data_length: get_u32(buf, 4),
            large_data: Handle::from_raw(get_u64(buf, 8)),
            min_active_order_id: get_u64(buf, 16),
        })
    }

    /// Encodes into a fresh payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SPLIT_ITEM_SIZE];
        put_u32(&mut buf, 0, self.version);
        put_u32(&mut buf, 4, self.data_length);
        put_u64(&mut buf, 8, self.large_data.raw());
        put_u64(&mut buf, 16, self.min_active_order_id);
        buf
    }

    /// Generation holding the record data, falling back to `first` when none.
    pub fn data_gen(&self, first: GenId) -> GenId {
        if self.large_data.is_end() { first } else { self.large_data.gen_id() }
    }
}

/// One reference slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reference {
    /// Referenced item; null marks an empty slot.
    pub ref_handle: Handle,
    /// Opaque value.
    pub value: u32,
    /// Stored state.
    pub state: u8,
    /// Opaque flag.
    pub flag: u8,
}

impl Reference {
    /// Returns `true` for an empty slot.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.ref_handle.is_null()
    }
}

/// A run of references owned by one split item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReferenceChunk {
    /// Owning split item in the management generation.
    pub owner: Handle,
    /// Order id of `references[0]`.
    pub base_order_id: u64,
    /// Owner version the chunk was written under.
    pub owner_version: u32,
    /// Reference slots.
    pub references: Vec<Reference>,
}

impl ReferenceChunk {
    /// Number of references a granule with `granule_data_size` payload bytes holds.
    pub fn capacity(granule_data_size: u32) -> usize {
        (granule_data_size as usize).saturating_sub(REFERENCE_CHUNK_HEADER_SIZE) / REFERENCE_SIZE
    }

    /// Payload length for `count` references.
    pub fn encoded_len_for(count: usize) -> usize {
        REFERENCE_CHUNK_HEADER_SIZE + count * REFERENCE_SIZE
    }

    /// Decodes from a payload slice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the payload cannot hold the stated count.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < REFERENCE_CHUNK_HEADER_SIZE {
            return Err(truncated("reference chunk", buf.len()));
        }
        let count = get_u32(buf, 20) as usize;
        if Self::encoded_len_for(count) > buf.len() {
            return Err(Error::corrupted(format!(
                "reference chunk claims {count} references in {} bytes",
                buf.len()
            )));
        }
        let references = (0..count)
            .map(|i| {
                let at = REFERENCE_CHUNK_HEADER_SIZE + i * REFERENCE_SIZE;
                Reference {
                    ref_handle: Handle::from_raw(get_u64(buf, at)),
                    value: get_u32(buf, at + 8),
                    state: buf[at + 12],
                    flag: buf[at + 13],
                }
            })
            .collect();
        Ok(Self {
            owner: Handle::from_raw(get_u64(buf, 0)),
            base_order_id: get_u64(buf, 8),
            owner_version: get_u32(buf, 16),
            references,
        })
    }

    /// Reads only the owner, base order id and owner version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the payload is shorter than the chunk header.
    pub fn decode_owner(buf: &[u8]) -> Result<(Handle, u64, u32)> {
        if buf.len() < REFERENCE_CHUNK_HEADER_SIZE {
            return Err(truncated("reference chunk", buf.len()));
        }
        Ok((Handle::from_raw(get_u64(buf, 0)), get_u64(buf, 8), get_u32(buf, 16)))
    }

    /// Encodes into a fresh payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        put_u64(&mut buf, 0, self.owner.raw());
        put_u64(&mut buf, 8, self.base_order_id);
        put_u32(&mut buf, 16, self.owner_version);
        put_u32(&mut buf, 20, self.references.len() as u32);
        for (i, r) in self.references.iter().enumerate() {
            let at = REFERENCE_CHUNK_HEADER_SIZE + i * REFERENCE_SIZE;
            put_u64(&mut buf, at, r.ref_handle.raw());
            put_u32(&mut buf, at + 8, r.value);
            buf[at + 12] = r.state;
            buf[at + 13] = r.flag;
        }
        buf
    }

    /// Payload length of this chunk.
    pub fn encoded_len(&self) -> usize {
        Self::encoded_len_for(self.references.len())
    }

    /// Returns `true` if any slot holds a reference.
    pub fn has_live(&self) -> bool {
        self.references.iter().any(|r| !r.is_null())
    }

    /// One past the highest order id covered.
    pub fn end_order_id(&self) -> u64 {
        self.base_order_id + self.references.len() as u64
    }

    /// Drops empty slots at both ends, advancing the base order id.
    ///
    /// Returns `true` if anything was removed. A chunk with no live slot is
    /// left untouched.
    pub fn trim(&mut self) -> bool {
        let Some(first) = self.references.iter().position(|r| !r.is_null()) else {
            return false;
        };
        let last = self.references.iter().rposition(|r| !r.is_null()).unwrap_or(first);
        if first == 0 && last + 1 == self.references.len() {
            return false;
        }
        self.references.truncate(last + 1);
        self.references.drain(..first);
        self.base_order_id += first as u64;
        true
    }
}

/// Reference-state overrides for one owner, kept in the management generation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RefStateChunk {
    /// Owning split item.
    pub owner: Handle,
    /// Order id of `states[0]`.
    pub base_order_id: u64,
    /// Owner version the chunk was written under.
    pub owner_version: u32,
    /// One state byte per order id.
    pub states: Vec<u8>,
}

impl RefStateChunk {
    /// Decodes from a payload slice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the payload cannot hold the stated count.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < REFSTATE_CHUNK_HEADER_SIZE {
            return Err(truncated("refstate chunk", buf.len()));
        }
        let count = get_u32(buf, 20) as usize;
        if REFSTATE_CHUNK_HEADER_SIZE + count > buf.len() {
            return Err(Error::corrupted(format!("refstate chunk claims {count} states")));
        }
        Ok(Self {
            owner: Handle::from_raw(get_u64(buf, 0)),
            base_order_id: get_u64(buf, 8),
            owner_version: get_u32(buf, 16),
            states: buf[REFSTATE_CHUNK_HEADER_SIZE..REFSTATE_CHUNK_HEADER_SIZE + count].to_vec(),
        })
    }

    /// Encodes into a fresh payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; REFSTATE_CHUNK_HEADER_SIZE + self.states.len()];
        put_u64(&mut buf, 0, self.owner.raw());
        put_u64(&mut buf, 8, self.base_order_id);
        put_u32(&mut buf, 16, self.owner_version);
        put_u32(&mut buf, 20, self.states.len() as u32);
        buf[REFSTATE_CHUNK_HEADER_SIZE..].copy_from_slice(&self.states);
        buf
    }

    /// State override for `order_id`, if this chunk covers it.
    pub fn state_for(&self, order_id: u64) -> Option<u8> {
        let idx = order_id.checked_sub(self.base_order_id)?;
        self.states.get(usize::try_from(idx).ok()?).copied()
    }
}

/// One state object slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateEntry {
    /// Opaque value.
    pub value: u32,
    /// [`STATE_VALID`] when the slot is in use.
    pub flag: u8,
}

/// State objects owned by a client record, kept in the management generation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateChunk {
    /// Owning client record.
    pub owner: Handle,
    /// Slots, valid or not.
    pub entries: Vec<StateEntry>,
}

impl StateChunk {
    /// Byte offset of entry `index` within the payload.
    pub fn entry_offset(index: usize) -> usize {
        STATE_CHUNK_HEADER_SIZE + index * STATE_ENTRY_SIZE
    }

    /// Decodes from a payload slice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the payload cannot hold the stated count.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < STATE_CHUNK_HEADER_SIZE {
            return Err(truncated("state chunk", buf.len()));
        }
        let count = get_u32(buf, 8) as usize;
        if Self::entry_offset(count) > buf.len() {
            return Err(Error::corrupted(format!("state chunk claims {count} entries")));
        }
        let entries = (0..count)
            .map(|i| {
                let at = Self::entry_offset(i);
                StateEntry { value: get_u32(buf, at), flag: buf[at + 4] }
            })
            .collect();
        Ok(Self { owner: Handle::from_raw(get_u64(buf, 0)), entries })
    }

    /// Encodes into a fresh payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::entry_offset(self.entries.len())];
        put_u64(&mut buf, 0, self.owner.raw());
        put_u32(&mut buf, 8, self.entries.len() as u32);
        for (i, e) in self.entries.iter().enumerate() {
            let at = Self::entry_offset(i);
            put_u32(&mut buf, at, e.value);
            buf[at + 4] = e.flag;
        }
        buf
    }
}

/// Node of the generation id chain, kept in the management generation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GenIdChunk {
    /// Generation ids in creation order.
    pub gen_ids: Vec<GenId>,
}

impl GenIdChunk {
    /// Decodes from a payload slice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the payload cannot hold the stated count.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < GENID_CHUNK_HEADER_SIZE {
            return Err(truncated("gen id chunk", buf.len()));
        }
        let count = get_u16(buf, 0) as usize;
        if GENID_CHUNK_HEADER_SIZE + count * 2 > buf.len() {
            return Err(Error::corrupted(format!("gen id chunk claims {count} ids")));
        }
        let gen_ids =
            (0..count).map(|i| GenId(get_u16(buf, GENID_CHUNK_HEADER_SIZE + i * 2))).collect();
        Ok(Self { gen_ids })
    }

    /// Encodes into a fresh payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; GENID_CHUNK_HEADER_SIZE + self.gen_ids.len() * 2];
        put_u16(&mut buf, 0, self.gen_ids.len() as u16);
        for (i, gen_id) in self.gen_ids.iter().enumerate() {
            put_u16(&mut buf, GENID_CHUNK_HEADER_SIZE + i * 2, gen_id.0);
        }
        buf
    }
}
