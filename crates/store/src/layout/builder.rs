//! Laying out fresh generations and placing items into granules.
//!
//! The management layer that owns live generations allocates granules with
//! [`GranuleAllocator`]; recovery only reads what it wrote.

use genstore_types::{GenId, Handle};

use super::{
    DESCRIPTOR_SIZE, DataType, Descriptor, GenHeader, GenImage, GranulePool, HEADER_SIZE,
    ITEM_ALIGN, MAX_ACTIVE_GENS, MAX_POOLS,
};
use crate::error::{Error, Result};

/// Builds an empty expanded generation image.
///
/// Every granule starts out as a [`DataType::FREE_GRANULE`] descriptor
/// carrying its own pool id and granule index.
#[derive(Debug, Clone)]
pub struct GenerationBuilder {
    gen_id: GenId,
    pools: Vec<(u32, u32)>,
    state: u32,
    gen_id_chain: Handle,
    active_gens: Vec<GenId>,
}

impl GenerationBuilder {
    /// Starts a builder for `gen_id`.
    pub fn new(gen_id: GenId) -> Self {
        Self {
            gen_id,
            pools: Vec::new(),
            state: 0,
            gen_id_chain: Handle::NULL,
            active_gens: Vec::new(),
        }
    }

    /// Appends a pool of `granule_count` granules of `granule_size` bytes.
    pub fn pool(mut self, granule_size: u32, granule_count: u32) -> Self {
        self.pools.push((granule_size, granule_count));
        self
    }

    /// Sets the opaque state word.
    pub fn state(mut self, state: u32) -> Self {
        self.state = state;
        self
    }

    /// Management only: records the in-memory generations.
    pub fn active_gens(mut self, gens: Vec<GenId>) -> Self {
        self.active_gens = gens;
        self
    }

    /// Lays out the image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] for a null generation id, no pools or
    /// more than [`MAX_POOLS`], an empty pool, or a granule size that is not
    /// aligned or cannot hold a descriptor plus one aligned word.
    pub fn build(self) -> Result<GenImage> {
        if self.gen_id.is_null() {
            return Err(Error::bad_parameter("generation id 0 is reserved"));
        }
        if self.pools.is_empty() || self.pools.len() > MAX_POOLS {
            return Err(Error::bad_parameter(format!(
                "a generation needs 1..={MAX_POOLS} pools, got {}",
                self.pools.len()
            )));
        }
        if self.active_gens.len() > MAX_ACTIVE_GENS {
            return Err(Error::bad_parameter("too many active generations"));
        }

        let mut pools = Vec::with_capacity(self.pools.len());
        let mut offset = HEADER_SIZE as u64;
        for &(granule_size, granule_count) in &self.pools {
            if granule_count == 0
                || (granule_size as usize) < DESCRIPTOR_SIZE + ITEM_ALIGN
                || granule_size as usize % ITEM_ALIGN != 0
            {
                return Err(Error::bad_parameter(format!(
                    "invalid pool: {granule_count} granules of {granule_size} bytes"
                )));
            }
            let pool = GranulePool { offset, granule_size, granule_count };
            offset = pool.end();
            pools.push(pool);
        }

        let header = GenHeader {
            gen_id: self.gen_id,
            state: self.state,
            mem_size_bytes: offset,
            compact_size_bytes: 0,
            std_dev_bytes: 0,
            pools,
            gen_id_chain: self.gen_id_chain,
            active_gens: self.active_gens,
        };

        let mut bytes = vec![0u8; offset as usize];
        header.encode(&mut bytes[..HEADER_SIZE]);
        for (pool_id, pool) in header.pools.iter().enumerate() {
            for index in 0..pool.granule_count {
                let at = pool.granule_offset(index) as usize;
                Descriptor::free(pool_id as u8, index).encode(&mut bytes[at..at + DESCRIPTOR_SIZE]);
            }
        }
        Ok(GenImage::from_parts(header, bytes))
    }
}

/// An item to place into a generation.
#[derive(Debug, Clone, Copy)]
pub struct NewItem<'a> {
    /// Type tag of the head granule.
    pub data_type: DataType,
    /// Opaque attribute word.
    pub attribute: u64,
    /// Opaque state word.
    pub state: u64,
    /// Payload; split across a chain when it exceeds one granule.
    pub payload: &'a [u8],
}

/// Per-pool free lists of granule indexes.
///
/// Allocation returns the lowest free index of a pool first, so layouts are
/// deterministic for a given sequence of calls.
#[derive(Debug, Clone, Default)]
pub struct GranuleAllocator {
    /// Free indexes per pool, highest first so `pop` yields the lowest.
    free: Vec<Vec<u32>>,
}

impl GranuleAllocator {
    /// Collects the free granules of an expanded image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] for a compacted image.
    pub fn scan(image: &GenImage) -> Result<Self> {
        if image.is_compacted() {
            return Err(Error::bad_parameter("cannot allocate in a compacted image"));
        }
        let mut free = Vec::with_capacity(image.header().pools.len());
        for pool in &image.header().pools {
            let mut list = Vec::new();
            for index in (0..pool.granule_count).rev() {
                let desc = image.descriptor(pool.granule_offset(index))?;
                if desc.data_type.is_free() {
                    list.push(index);
                }
            }
            free.push(list);
        }
        Ok(Self { free })
    }

    /// Takes the lowest free granule of `pool`.
    pub fn allocate(&mut self, pool: usize) -> Option<u32> {
        self.free.get_mut(pool)?.pop()
    }

    /// Returns a granule to its pool.
    pub fn free(&mut self, pool: usize, index: u32) {
        if let Some(list) = self.free.get_mut(pool) {
            let pos = list.partition_point(|&i| i > index);
            list.insert(pos, index);
        }
    }

    /// Number of free granules in `pool`.
    pub fn free_count(&self, pool: usize) -> usize {
        self.free.get(pool).map_or(0, Vec::len)
    }

    /// Places `item` into `image`, chaining granules when it does not fit one.
    ///
    /// The smallest pool whose granules hold the whole payload is used;
    /// otherwise the payload is split across granules of the largest pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocateError`] when the chosen pool runs out of
    /// granules. Nothing is written in that case.
    pub fn store(&mut self, image: &mut GenImage, item: NewItem<'_>) -> Result<Handle> {
        let pools = image.header().pools.clone();
        let fit = pools.iter().position(|p| p.granule_data_size() as usize >= item.payload.len());
        let pool_id = fit.unwrap_or(pools.len() - 1);
        let chunk = pools[pool_id].granule_data_size() as usize;
        let fragments = item.payload.len().div_ceil(chunk).max(1);

        if self.free_count(pool_id) < fragments {
            return Err(Error::AllocateError {
                gen_id: image.gen_id(),
                requested: item.payload.len() as u64,
            });
        }
        let granules: Vec<u32> = (0..fragments).filter_map(|_| self.allocate(pool_id)).collect();

        let gen_id = image.gen_id();
        let pool = pools[pool_id];
        for (i, &index) in granules.iter().enumerate() {
            let start = i * chunk;
            let end = (start + chunk).min(item.payload.len());
            let next_handle = granules
                .get(i + 1)
                .map_or(Handle::NULL, |&n| Handle::new(gen_id, pool.granule_offset(n)));
            let desc = Descriptor {
                total_length: if i == 0 { item.payload.len() as u32 } else { (end - start) as u32 },
                granule_index: index,
                attribute: item.attribute,
                state: item.state,
                next_handle,
                data_length: 0,
                data_type: if i == 0 { item.data_type } else { item.data_type.as_continuation() },
                pool_id: pool_id as u8,
            };
            image.write_item(pool.granule_offset(index), &desc, &item.payload[start..end])?;
        }
        Ok(Handle::new(gen_id, pool.granule_offset(granules[0])))
    }

    /// Frees the chain starting at `handle`, returning its granules.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a link leaves the image.
    pub fn release(&mut self, image: &mut GenImage, handle: Handle) -> Result<()> {
        let mut link = handle;
        while !link.is_end() && link.gen_id() == image.gen_id() {
            let offset = link.offset();
            let desc = image.descriptor(offset)?;
            if desc.data_type.is_free() {
                break;
            }
            image.set_descriptor(offset, &Descriptor::free(desc.pool_id, desc.granule_index))?;
            self.free(desc.pool_id as usize, desc.granule_index);
            link = desc.next_handle;
        }
        Ok(())
    }
}

/// Sets the chain link of the item at `from`.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if `from` does not address an item of `image`.
pub fn set_next(image: &mut GenImage, from: Handle, to: Handle) -> Result<()> {
    let mut desc = image.descriptor(from.offset())?;
    desc.next_handle = to;
    image.set_descriptor(from.offset(), &desc)
}

/// Sets the management header's generation id chain head.
///
/// # Errors
///
/// Returns [`Error::BadParameter`] if `image` is not the management generation.
pub fn set_gen_id_chain(image: &mut GenImage, head: Handle) -> Result<()> {
    if !image.gen_id().is_mgmt() {
        return Err(Error::bad_parameter("only the management generation has a gen id chain"));
    }
    let mut header = image.header().clone();
    header.gen_id_chain = head;
    image.set_header(header);
    Ok(())
}
