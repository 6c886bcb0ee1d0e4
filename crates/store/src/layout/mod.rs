//! Arena layout of a generation image.
//!
//! A generation is a self-describing byte image: a fixed-size header
//! followed by granule pools. Every stored item starts with a
//! [`Descriptor`] and lives in one granule; longer items chain further
//! granules through `next_handle`.
//!
//! ```text
//! ┌──────────────────────┐ 0
//! │ GenHeader (256 B)    │  struct id, gen id, pools, sizes, checksum
//! ├──────────────────────┤ pools[0].offset
//! │ pool 0: granule × n0 │  [Descriptor | payload ...] per granule
//! ├──────────────────────┤ pools[1].offset
//! │ pool 1: granule × n1 │
//! └──────────────────────┘ mem_size_bytes
//! ```
//!
//! A compacted image keeps the same header (with `compact_size_bytes` set)
//! but packs the surviving items back to back starting at
//! `pools[0].offset`. Each descriptor keeps its canonical `(pool_id,
//! granule_index)` so the image can be expanded again.
//!
//! All integers are little-endian.

mod builder;
mod image;
mod items;

pub use builder::{GenerationBuilder, GranuleAllocator, NewItem, set_gen_id_chain, set_next};
use genstore_types::{GenId, Handle};
pub use image::{GenImage, GenMap};
pub use items::{
    GenIdChunk, REFERENCE_CHUNK_HEADER_SIZE, REFERENCE_SIZE, REFSTATE_DELETED,
    REFSTATE_NOT_VALID, RefStateChunk, Reference, ReferenceChunk, SPLIT_ITEM_SIZE, STATE_VALID,
    SplitItem, StateChunk, StateEntry,
};

use crate::error::{Error, Result};

/// Size of the generation header region.
pub const HEADER_SIZE: usize = 256;

/// Size of an encoded [`Descriptor`].
pub const DESCRIPTOR_SIZE: usize = 40;

/// Alignment of every item and pool.
pub const ITEM_ALIGN: usize = 8;

/// Largest expanded image a header may declare.
pub const MAX_GENERATION_BYTES: u64 = 1 << 32;

/// Maximum number of granule pools per generation.
pub const MAX_POOLS: usize = 4;

/// Maximum number of in-memory generations recorded by the management header.
pub const MAX_ACTIVE_GENS: usize = 8;

/// Struct id of an ordinary generation header.
pub const GEN_STRUCT_ID: u32 = 0xABCD_AAAA;

/// Struct id of the management generation header.
pub const MGMT_STRUCT_ID: u32 = 0xABCD_AAAB;

/// Image format version.
pub const FORMAT_VERSION: u16 = 1;

const POOL_ENTRY_SIZE: usize = 32;
const POOLS_AT: usize = 48;
const MGMT_EXT_AT: usize = POOLS_AT + MAX_POOLS * POOL_ENTRY_SIZE;
const CHECKSUM_AT: usize = 40;

/// Rounds `len` up to [`ITEM_ALIGN`].
#[inline]
pub const fn align_item(len: usize) -> usize {
    (len + ITEM_ALIGN - 1) & !(ITEM_ALIGN - 1)
}

/// Bytes an item occupies in a compacted image.
#[inline]
pub const fn item_footprint(data_length: u32) -> usize {
    align_item(DESCRIPTOR_SIZE + data_length as usize)
}

// Little-endian field access. Callers validate bounds before calling.
#[inline]
pub(crate) fn get_u16(buf: &[u8], at: usize) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&buf[at..at + 2]);
    u16::from_le_bytes(b)
}

#[inline]
pub(crate) fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

#[inline]
pub(crate) fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

#[inline]
pub(crate) fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

// =========================================================================
// DataType
// =========================================================================

/// Type tag of a stored item.
///
/// The high bit ([`DataType::NOT_PRIMARY`]) marks a granule that continues
/// a chain started elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DataType(pub u16);

impl DataType {
    /// Zeroed granule, or a tombstone left by compaction.
    pub const NONE: DataType = DataType(0);
    /// Granule available for allocation.
    pub const FREE_GRANULE: DataType = DataType(0x7FFF);
    /// Granule allocated but not yet committed.
    pub const NEWLY_HATCHED: DataType = DataType(0x7FFE);
    /// Flag on every chain member after the first.
    pub const NOT_PRIMARY: u16 = 0x8000;

    /// Server record.
    pub const SERVER: DataType = DataType(0x0001);
    /// Client record.
    pub const CLIENT: DataType = DataType(0x0002);
    /// Queue record.
    pub const QUEUE: DataType = DataType(0x0003);
    /// Topic record.
    pub const TOPIC: DataType = DataType(0x0004);
    /// Subscription record.
    pub const SUBSCRIPTION: DataType = DataType(0x0005);
    /// Transaction record.
    pub const TRANSACTION: DataType = DataType(0x0006);
    /// Bridge record.
    pub const BRIDGE: DataType = DataType(0x0007);
    /// Remote server record.
    pub const REMOTE_SERVER: DataType = DataType(0x0008);

    /// Message record.
    pub const MESSAGE: DataType = DataType(0x0010);
    /// Generic property record.
    pub const PROPERTY: DataType = DataType(0x0011);
    /// Client property record.
    pub const CLIENT_PROP: DataType = DataType(0x0012);
    /// Queue property record.
    pub const QUEUE_PROP: DataType = DataType(0x0013);
    /// Topic property record.
    pub const TOPIC_PROP: DataType = DataType(0x0014);
    /// Subscription property record.
    pub const SUBSCRIPTION_PROP: DataType = DataType(0x0015);
    /// Bridge property record.
    pub const BRIDGE_PROP: DataType = DataType(0x0016);
    /// Remote server property record.
    pub const REMOTE_SERVER_PROP: DataType = DataType(0x0017);

    /// Run of references owned by one split item.
    pub const REFERENCES: DataType = DataType(0x1001);
    /// Reference state overrides for one owner.
    pub const REFSTATES: DataType = DataType(0x1002);
    /// State objects owned by a client.
    pub const STATES: DataType = DataType(0x1003);
    /// Node of the generation id chain.
    pub const GENIDS: DataType = DataType(0x1004);
    /// Store transaction bookkeeping.
    pub const STORE_TRAN: DataType = DataType(0x1005);

    /// Split record types: kept in the management generation with their
    /// payload in a data generation.
    pub const SPLIT_TYPES: [DataType; 8] = [
        Self::SERVER,
        Self::CLIENT,
        Self::QUEUE,
        Self::TOPIC,
        Self::SUBSCRIPTION,
        Self::TRANSACTION,
        Self::BRIDGE,
        Self::REMOTE_SERVER,
    ];

    /// Tag with the chain flag removed.
    #[inline]
    pub const fn base(self) -> DataType {
        DataType(self.0 & !Self::NOT_PRIMARY)
    }

    /// Returns `true` unless the granule continues another item's chain.
    #[inline]
    pub const fn is_primary(self) -> bool {
        self.0 & Self::NOT_PRIMARY == 0
    }

    /// Same tag marked as a chain continuation.
    #[inline]
    pub const fn as_continuation(self) -> DataType {
        DataType(self.0 | Self::NOT_PRIMARY)
    }

    /// Returns `true` for granules that hold no item.
    #[inline]
    pub const fn is_free(self) -> bool {
        let base = self.base().0;
        base == Self::NONE.0 || base == Self::FREE_GRANULE.0 || base == Self::NEWLY_HATCHED.0
    }

    /// Returns `true` for split record types.
    pub fn is_split_item(self) -> bool {
        Self::SPLIT_TYPES.contains(&self.base())
    }

    /// Returns `true` for split types whose attribute names a property record.
    pub fn has_properties(self) -> bool {
        [Self::CLIENT, Self::QUEUE, Self::SUBSCRIPTION, Self::REMOTE_SERVER].contains(&self.base())
    }

    /// Returns `true` for business record types (split or data).
    pub const fn is_record(self) -> bool {
        let base = self.base().0;
        (base >= Self::SERVER.0 && base <= Self::REMOTE_SERVER.0)
            || (base >= Self::MESSAGE.0 && base <= Self::REMOTE_SERVER_PROP.0)
    }

    /// Returns `true` for every tag this store knows.
    pub const fn is_known(self) -> bool {
        let base = self.base().0;
        self.is_free() || self.is_record() || (base >= Self::REFERENCES.0 && base <= Self::STORE_TRAN.0)
    }

    /// Returns `true` for the first granule of an allocated item.
    #[inline]
    pub const fn is_head(self) -> bool {
        self.is_primary() && !self.is_free()
    }
}

// =========================================================================
// Descriptor
// =========================================================================

/// Header of every granule-resident item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor {
    /// Total payload length across the chain (head) or this fragment.
    pub total_length: u32,
    /// Canonical granule index within `pool_id`.
    pub granule_index: u32,
    /// Opaque attribute word.
    pub attribute: u64,
    /// Opaque state word.
    pub state: u64,
    /// Next item in the chain; an end handle terminates it.
    pub next_handle: Handle,
    /// Payload bytes stored in this granule.
    pub data_length: u32,
    /// Type tag.
    pub data_type: DataType,
    /// Pool holding the canonical granule.
    pub pool_id: u8,
}

impl Descriptor {
    /// A free granule at the given coordinates.
    pub fn free(pool_id: u8, granule_index: u32) -> Self {
        Self { pool_id, granule_index, data_type: DataType::FREE_GRANULE, ..Self::default() }
    }

    /// Decodes a descriptor from the first [`DESCRIPTOR_SIZE`] bytes of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if `buf` is too short.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DESCRIPTOR_SIZE {
            return Err(Error::corrupted(format!("descriptor truncated: {} bytes", buf.len())));
        }
        Ok(Self {
            total_length: get_u32(buf, 0),
            granule_index: get_u32(buf, 4),
            attribute: get_u64(buf, 8),
            state: get_u64(buf, 16),
            next_handle: Handle::from_raw(get_u64(buf, 24)),
            data_length: get_u32(buf, 32),
            data_type: DataType(get_u16(buf, 36)),
            pool_id: buf[38],
        })
    }

    /// Encodes into the first [`DESCRIPTOR_SIZE`] bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.total_length);
        put_u32(buf, 4, self.granule_index);
        put_u64(buf, 8, self.attribute);
        put_u64(buf, 16, self.state);
        put_u64(buf, 24, self.next_handle.raw());
        put_u32(buf, 32, self.data_length);
        put_u16(buf, 36, self.data_type.0);
        buf[38] = self.pool_id;
        buf[39] = 0;
    }

    /// Bytes this item occupies in a compacted image.
    #[inline]
    pub fn footprint(&self) -> usize {
        item_footprint(self.data_length)
    }
}

// =========================================================================
// Header
// =========================================================================

/// Geometry of one granule pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GranulePool {
    /// Offset of granule 0 within the image.
    pub offset: u64,
    /// Bytes per granule, descriptor included.
    pub granule_size: u32,
    /// Number of granules.
    pub granule_count: u32,
}

impl GranulePool {
    /// Payload bytes available per granule.
    #[inline]
    pub fn granule_data_size(&self) -> u32 {
        self.granule_size.saturating_sub(DESCRIPTOR_SIZE as u32)
    }

    /// Bytes spanned by the pool.
    #[inline]
    pub fn max_mem_size(&self) -> u64 {
        self.granule_size as u64 * self.granule_count as u64
    }

    /// Offset one past the last granule.
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.max_mem_size()
    }

    /// Canonical offset of granule `index`.
    #[inline]
    pub fn granule_offset(&self, index: u32) -> u64 {
        self.offset + index as u64 * self.granule_size as u64
    }

    /// Granule index for a canonical offset, if it is granule-aligned and in range.
    pub fn granule_at(&self, offset: u64) -> Option<u32> {
        if offset < self.offset || offset >= self.end() {
            return None;
        }
        let rel = offset - self.offset;
        if rel % self.granule_size as u64 != 0 {
            return None;
        }
        Some((rel / self.granule_size as u64) as u32)
    }
}

/// Decoded generation header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenHeader {
    /// Generation this image belongs to.
    pub gen_id: GenId,
    /// Opaque lifecycle state word maintained by the management layer.
    pub state: u32,
    /// Size of the expanded image.
    pub mem_size_bytes: u64,
    /// Used bytes of a compacted image; 0 when not compacted.
    pub compact_size_bytes: u64,
    /// Standard deviation of chain sizes at the last compaction.
    pub std_dev_bytes: u64,
    /// Granule pools in ascending offset order.
    pub pools: Vec<GranulePool>,
    /// Management only: head of the generation id chain.
    pub gen_id_chain: Handle,
    /// Management only: generations that were memory-resident when persisted.
    pub active_gens: Vec<GenId>,
}

impl GenHeader {
    /// Returns `true` for the management generation's header.
    #[inline]
    pub fn is_mgmt(&self) -> bool {
        self.gen_id.is_mgmt()
    }

    /// Returns `true` when the image is compacted.
    #[inline]
    pub fn is_compacted(&self) -> bool {
        self.compact_size_bytes != 0
    }

    /// Offset of the first granule.
    pub fn data_start(&self) -> u64 {
        self.pools.first().map_or(HEADER_SIZE as u64, |p| p.offset)
    }

    /// Total granules across pools.
    pub fn granule_count(&self) -> u64 {
        self.pools.iter().map(|p| p.granule_count as u64).sum()
    }

    /// Pool and granule index for a canonical item offset.
    pub fn locate(&self, offset: u64) -> Option<(usize, u32)> {
        self.pools
            .iter()
            .enumerate()
            .find_map(|(i, p)| p.granule_at(offset).map(|g| (i, g)))
    }

    /// Encodes the header, including its checksum, into `buf[..HEADER_SIZE]`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[..HEADER_SIZE].fill(0);
        let struct_id = if self.is_mgmt() { MGMT_STRUCT_ID } else { GEN_STRUCT_ID };
        put_u32(buf, 0, struct_id);
        put_u16(buf, 4, self.gen_id.0);
        put_u16(buf, 6, FORMAT_VERSION);
        put_u16(buf, 8, self.pools.len() as u16);
        put_u16(buf, 10, DESCRIPTOR_SIZE as u16);
        put_u32(buf, 12, self.state);
        put_u64(buf, 16, self.mem_size_bytes);
        put_u64(buf, 24, self.compact_size_bytes);
        put_u64(buf, 32, self.std_dev_bytes);
        for (i, pool) in self.pools.iter().enumerate() {
            let at = POOLS_AT + i * POOL_ENTRY_SIZE;
            put_u64(buf, at, pool.offset);
            put_u64(buf, at + 8, pool.max_mem_size());
            put_u32(buf, at + 16, pool.granule_count);
            put_u32(buf, at + 20, pool.granule_size);
            put_u32(buf, at + 24, pool.granule_data_size());
        }
        put_u64(buf, MGMT_EXT_AT, self.gen_id_chain.raw());
        put_u16(buf, MGMT_EXT_AT + 8, self.active_gens.len() as u16);
        for (i, gen_id) in self.active_gens.iter().enumerate() {
            put_u16(buf, MGMT_EXT_AT + 10 + i * 2, gen_id.0);
        }
        let checksum = xxhash_rust::xxh3::xxh3_64(&buf[..HEADER_SIZE]);
        put_u64(buf, CHECKSUM_AT, checksum);
    }

    /// Decodes and validates a header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the buffer is short, the struct id or
    /// version is unknown, the checksum does not match, or the pool geometry
    /// is inconsistent.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::corrupted(format!("header truncated: {} bytes", buf.len())));
        }
        let struct_id = get_u32(buf, 0);
        if struct_id != GEN_STRUCT_ID && struct_id != MGMT_STRUCT_ID {
            return Err(Error::corrupted(format!("unknown struct id {struct_id:#x}")));
        }
        let version = get_u16(buf, 6);
        if version != FORMAT_VERSION {
            return Err(Error::corrupted(format!("unsupported format version {version}")));
        }

        let stored = get_u64(buf, CHECKSUM_AT);
        let mut scratch = [0u8; HEADER_SIZE];
        scratch.copy_from_slice(&buf[..HEADER_SIZE]);
        put_u64(&mut scratch, CHECKSUM_AT, 0);
        if xxhash_rust::xxh3::xxh3_64(&scratch) != stored {
            return Err(Error::corrupted("header checksum mismatch"));
        }

        let gen_id = GenId(get_u16(buf, 4));
        if (struct_id == MGMT_STRUCT_ID) != gen_id.is_mgmt() || gen_id.is_null() {
            return Err(Error::corrupted(format!("struct id does not match generation {gen_id}")));
        }
        let pools_count = get_u16(buf, 8) as usize;
        if pools_count == 0 || pools_count > MAX_POOLS {
            return Err(Error::corrupted(format!("invalid pool count {pools_count}")));
        }
        if get_u16(buf, 10) as usize != DESCRIPTOR_SIZE {
            return Err(Error::corrupted("descriptor size mismatch"));
        }

        let mem_size_bytes = get_u64(buf, 16);
        if mem_size_bytes > MAX_GENERATION_BYTES {
            return Err(Error::corrupted(format!("image size {mem_size_bytes} exceeds the limit")));
        }
        let mut pools = Vec::with_capacity(pools_count);
        let mut floor = HEADER_SIZE as u64;
        for i in 0..pools_count {
            let at = POOLS_AT + i * POOL_ENTRY_SIZE;
            let pool = GranulePool {
                offset: get_u64(buf, at),
                granule_count: get_u32(buf, at + 16),
                granule_size: get_u32(buf, at + 20),
            };
            if (pool.granule_size as usize) < DESCRIPTOR_SIZE
                || pool.granule_size as usize % ITEM_ALIGN != 0
                || pool.offset as usize % ITEM_ALIGN != 0
                || pool.offset < floor
                || pool.end() > mem_size_bytes
                || get_u64(buf, at + 8) != pool.max_mem_size()
            {
                return Err(Error::corrupted(format!("invalid geometry for pool {i}")));
            }
            floor = pool.end();
            pools.push(pool);
        }

        let active_count = get_u16(buf, MGMT_EXT_AT + 8) as usize;
        if active_count > MAX_ACTIVE_GENS {
            return Err(Error::corrupted(format!("invalid active generation count {active_count}")));
        }
        let active_gens =
            (0..active_count).map(|i| GenId(get_u16(buf, MGMT_EXT_AT + 10 + i * 2))).collect();

        Ok(Self {
            gen_id,
            state: get_u32(buf, 12),
            mem_size_bytes,
            compact_size_bytes: get_u64(buf, 24),
            std_dev_bytes: get_u64(buf, 32),
            pools,
            gen_id_chain: Handle::from_raw(get_u64(buf, MGMT_EXT_AT)),
            active_gens,
        })
    }
}
