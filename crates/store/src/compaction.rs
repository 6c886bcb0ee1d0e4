//! Compaction engine: deflate, reflate and expand generation images.
//!
//! - [`deflate`] packs the live chains of an expanded image back to back.
//! - [`reflate`] drops chains that died since an image was compacted,
//!   moving the survivors forward in place.
//! - [`expand`] restores a compacted image to its full size, placing every
//!   item at its canonical granule offset.
//!
//! A compacted image keeps the expanded header (pools, memory size) and
//! records the packed length in `compact_size_bytes`. Its buffer is padded
//! with zeros up to the disk block size.

use genstore_types::{GenId, Handle, config::StoreConfig};

use crate::{
    bitmap::PoolBitmaps,
    error::{Error, Result},
    layout::{
        DESCRIPTOR_SIZE, DataType, Descriptor, GenHeader, GenImage, MAX_GENERATION_BYTES,
        ReferenceChunk, align_item,
    },
};

/// Payload bytes a freed split item keeps as a tombstone: its version word.
const SPLIT_TOMBSTONE_LEN: usize = 4;

/// Knobs for one compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionParams {
    /// Compacted buffers are padded to a multiple of this.
    pub disk_block_size: usize,
    /// Drop null references at both ends of every reference chunk.
    pub trim_references: bool,
}

impl CompactionParams {
    /// Parameters derived from the store configuration, without trimming.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self { disk_block_size: config.disk_block_size, trim_references: false }
    }

    /// Enables or disables reference chunk trimming.
    pub fn with_trim_references(mut self, trim: bool) -> Self {
        self.trim_references = trim;
        self
    }

    fn round(&self, len: usize) -> usize {
        let block = self.disk_block_size.max(1);
        len.div_ceil(block) * block
    }
}

impl Default for CompactionParams {
    fn default() -> Self {
        Self { disk_block_size: 4096, trim_references: false }
    }
}

/// Running mean/variance of chain sizes.
#[derive(Debug, Default)]
struct ChainStats {
    n: f64,
    sum: f64,
    sum_sq: f64,
}

impl ChainStats {
    fn add(&mut self, bytes: usize) {
        let v = bytes as f64;
        self.n += 1.0;
        self.sum += v;
        self.sum_sq += v * v;
    }

    fn std_dev(&self) -> u64 {
        if self.n <= 1.0 {
            return 0;
        }
        let mean = self.sum / self.n;
        let var = (self.sum_sq - self.n * mean * mean) / (self.n - 1.0);
        if var <= 0.0 { 0 } else { var.sqrt() as u64 }
    }
}

/// Output buffer of a deflate pass.
struct Packer {
    out: Vec<u8>,
}

impl Packer {
    fn new(image: &GenImage) -> Self {
        let start = image.header().data_start() as usize;
        let mut out = Vec::with_capacity(image.used_len());
        out.extend_from_slice(&image.as_bytes()[..start]);
        Self { out }
    }

    /// Appends one item and returns its footprint.
    fn push(&mut self, desc: &Descriptor, payload: &[u8]) -> usize {
        let mut desc = *desc;
        desc.data_length = payload.len() as u32;
        let at = self.out.len();
        let footprint = align_item(DESCRIPTOR_SIZE + payload.len());
        self.out.resize(at + footprint, 0);
        desc.encode(&mut self.out[at..at + DESCRIPTOR_SIZE]);
        self.out[at + DESCRIPTOR_SIZE..at + DESCRIPTOR_SIZE + payload.len()].copy_from_slice(payload);
        footprint
    }

    fn finish(
        mut self,
        mut header: GenHeader,
        std_dev: u64,
        params: &CompactionParams,
    ) -> GenImage {
        header.compact_size_bytes = self.out.len() as u64;
        header.std_dev_bytes = std_dev;
        let padded = params.round(self.out.len());
        self.out.resize(padded, 0);
        header.encode(&mut self.out);
        GenImage::from_parts(header, self.out)
    }
}

/// Descriptor with its coordinates rewritten to the canonical granule at `offset`.
fn canonical(header: &GenHeader, offset: u64, desc: &Descriptor) -> Result<Descriptor> {
    let (pool, index) = header.locate(offset).ok_or_else(|| {
        Error::corrupted(format!("generation {}: {offset:#x} is not a granule", header.gen_id))
    })?;
    Ok(Descriptor { pool_id: pool as u8, granule_index: index, ..*desc })
}

fn trimmed_references(payload: &[u8]) -> Option<Vec<u8>> {
    let mut chunk = ReferenceChunk::decode(payload).ok()?;
    chunk.trim().then(|| chunk.encode())
}

/// Compacts an expanded image, keeping only live chains.
///
/// For ordinary generations every granule whose bit is set in `live` is
/// taken as a chain head; its chain is followed through `next_handle` so
/// the chain stays contiguous. With `live` of `None` every head item is
/// kept. The management generation ignores `live`: pool 0 records are kept
/// in granule order (freed split items leave a version tombstone), then the
/// other pools without store-transaction items.
///
/// # Errors
///
/// Returns [`Error::BadParameter`] if `image` is already compacted, and
/// [`Error::Corrupted`] if a chain leaves its granule or loops.
pub fn deflate(
    image: &GenImage,
    live: Option<&PoolBitmaps>,
    params: &CompactionParams,
) -> Result<GenImage> {
    if image.is_compacted() {
        return Err(Error::bad_parameter(format!(
            "generation {} is already compacted",
            image.gen_id()
        )));
    }
    let header = image.header();
    let mut packer = Packer::new(image);
    let mut stats = ChainStats::default();

    if header.is_mgmt() {
        deflate_mgmt(image, &mut packer)?;
    } else {
        let max_links = header.granule_count();
        for (pool_id, pool) in header.pools.iter().enumerate() {
            for index in 0..pool.granule_count {
                let offset = pool.granule_offset(index);
                let head = image.descriptor(offset)?;
                let keep = head.data_type.is_head()
                    && live.is_none_or(|bits| bits.is_set(pool_id, index));
                if !keep {
                    continue;
                }
                let trim = params.trim_references && head.data_type == DataType::REFERENCES;
                let chain = pack_chain(image, &mut packer, offset, trim, max_links)?;
                stats.add(chain);
            }
        }
    }

    let out = packer.finish(header.clone(), stats.std_dev(), params);
    tracing::debug!(
        gen_id = %header.gen_id,
        mem_size = header.mem_size_bytes,
        compact_size = out.header().compact_size_bytes,
        "Deflated generation"
    );
    Ok(out)
}

fn pack_chain(
    image: &GenImage,
    packer: &mut Packer,
    head: u64,
    trim: bool,
    max_links: u64,
) -> Result<usize> {
    let header = image.header();
    let gen_id = header.gen_id;
    let mut total = 0;
    let mut offset = head;
    let mut links = 0u64;
    loop {
        links += 1;
        if links > max_links {
            return Err(Error::corrupted(format!(
                "generation {gen_id}: chain from {head:#x} loops"
            )));
        }
        let desc = canonical(header, offset, &image.descriptor(offset)?)?;
        let payload = image.payload(offset)?;
        total += match trim.then(|| trimmed_references(payload)).flatten() {
            Some(shorter) => packer.push(&desc, &shorter),
            None => packer.push(&desc, payload),
        };
        let next = desc.next_handle;
        if next.is_end() || next.gen_id() != gen_id {
            return Ok(total);
        }
        offset = next.offset();
    }
}

fn deflate_mgmt(image: &GenImage, packer: &mut Packer) -> Result<()> {
    let header = image.header();
    for (pool_id, pool) in header.pools.iter().enumerate() {
        for index in 0..pool.granule_count {
            let offset = pool.granule_offset(index);
            let desc = canonical(header, offset, &image.descriptor(offset)?)?;
            let base = desc.data_type.base();
            if desc.data_type.is_free() {
                if pool_id == 0 {
                    let at = offset as usize + DESCRIPTOR_SIZE;
                    let version = image.as_bytes().get(at..at + SPLIT_TOMBSTONE_LEN).ok_or_else(|| {
                        Error::corrupted(format!("management granule {offset:#x} truncated"))
                    })?;
                    if version.iter().any(|&b| b != 0) {
                        let tombstone = Descriptor { data_type: DataType::NONE, ..desc };
                        packer.push(&tombstone, version);
                    }
                }
                continue;
            }
            if pool_id > 0 && base == DataType::STORE_TRAN {
                continue;
            }
            packer.push(&desc, image.payload(offset)?);
        }
    }
    Ok(())
}

/// Recompacts an already compacted image in place.
///
/// Chains whose head granule is set in `live` move forward; the rest are
/// dropped. The freed tail is zeroed and the buffer shrinks to the next
/// block boundary.
///
/// # Errors
///
/// Returns [`Error::BadParameter`] for an expanded image or the management
/// generation, and [`Error::Corrupted`] if an item overruns the image.
pub fn reflate(image: GenImage, live: &PoolBitmaps, params: &CompactionParams) -> Result<GenImage> {
    if !image.is_compacted() {
        return Err(Error::bad_parameter(format!(
            "generation {} is not compacted",
            image.gen_id()
        )));
    }
    if image.header().is_mgmt() {
        return Err(Error::bad_parameter("the management generation is never reflated"));
    }

    let end = image.header().compact_size_bytes;
    let mut moves: Vec<(usize, usize)> = Vec::new();
    let mut stats = ChainStats::default();
    let mut at = image.header().data_start();
    while at + (DESCRIPTOR_SIZE as u64) <= end {
        let head = image.descriptor(at)?;
        let start = at;
        let mut cur = (at, head);
        while let Some(next) = image.compacted_chain_next(cur.0, &cur.1)? {
            cur = next;
        }
        at = cur.0 + cur.1.footprint() as u64;
        if at > end {
            return Err(Error::corrupted(format!(
                "generation {}: item at {:#x} overruns compact size",
                image.gen_id(),
                cur.0
            )));
        }
        if live.is_set(head.pool_id as usize, head.granule_index) {
            let len = (at - start) as usize;
            stats.add(len);
            moves.push((start as usize, len));
        }
    }

    let mut header = image.header().clone();
    let mut bytes = image.into_bytes();
    let mut write = header.data_start() as usize;
    for (from, len) in moves {
        if from != write {
            bytes.copy_within(from..from + len, write);
        }
        write += len;
    }
    bytes[write..end as usize].fill(0);

    header.compact_size_bytes = write as u64;
    header.std_dev_bytes = stats.std_dev();
    bytes.resize(params.round(write), 0);
    header.encode(&mut bytes);
    tracing::debug!(
        gen_id = %header.gen_id,
        before = end,
        after = write,
        "Reflated generation"
    );
    Ok(GenImage::from_parts(header, bytes))
}

/// Compacts `image` with `live`, deflating an expanded image or reflating a
/// compacted one.
///
/// # Errors
///
/// See [`deflate`] and [`reflate`].
pub fn compact(image: GenImage, live: &PoolBitmaps, params: &CompactionParams) -> Result<GenImage> {
    if image.is_compacted() {
        reflate(image, live, params)
    } else {
        deflate(&image, Some(live), params)
    }
}

/// Expands a compacted image into `target`, which must be exactly the
/// image's memory size.
///
/// The target is cleared first. Every item lands at the offset its
/// descriptor coordinates name and `compact_size_bytes` becomes 0.
///
/// # Errors
///
/// Returns [`Error::BadParameter`] if `compacted` is not compacted or the
/// target length differs from the memory size, and [`Error::Corrupted`] if
/// an item names a granule it does not fit.
pub fn expand(compacted: &GenImage, target: &mut [u8]) -> Result<()> {
    let header = compacted.header();
    if !header.is_compacted() {
        return Err(Error::bad_parameter(format!(
            "generation {} is not compacted",
            header.gen_id
        )));
    }
    if target.len() as u64 != header.mem_size_bytes {
        tracing::warn!(
            gen_id = %header.gen_id,
            mem_size = header.mem_size_bytes,
            target_len = target.len(),
            "Expand target size mismatch"
        );
        return Err(Error::bad_parameter(format!(
            "expand target is {} bytes, generation {} needs {}",
            target.len(),
            header.gen_id,
            header.mem_size_bytes
        )));
    }

    let start = header.data_start() as usize;
    target[..start].copy_from_slice(&compacted.as_bytes()[..start]);
    target[start..].fill(0);

    for item in compacted.compacted_items() {
        let (at, desc) = item?;
        let offset = compacted.canonical_offset(&desc)?;
        let granule = header.pools[desc.pool_id as usize].granule_size as usize;
        let len = DESCRIPTOR_SIZE + desc.data_length as usize;
        if len > granule {
            return Err(Error::corrupted(format!(
                "generation {}: item at {at:#x} does not fit granule {offset:#x}",
                header.gen_id
            )));
        }
        let (src, dst) = (at as usize, offset as usize);
        target[dst..dst + len].copy_from_slice(&compacted.as_bytes()[src..src + len]);
    }

    let mut expanded = header.clone();
    expanded.compact_size_bytes = 0;
    expanded.encode(target);
    Ok(())
}

/// Expands a compacted image into a fresh buffer.
///
/// # Errors
///
/// See [`expand`].
pub fn expand_image(compacted: &GenImage) -> Result<GenImage> {
    let size = compacted.header().mem_size_bytes;
    if size > MAX_GENERATION_BYTES {
        return Err(Error::corrupted(format!(
            "generation {}: image size {size} exceeds the limit",
            compacted.gen_id()
        )));
    }
    let mut bytes = vec![0u8; size as usize];
    expand(compacted, &mut bytes)?;
    let mut header = compacted.header().clone();
    header.compact_size_bytes = 0;
    Ok(GenImage::from_parts(header, bytes))
}

/// Logical content of an item: what compaction must preserve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemContent {
    /// Type tag of the head.
    pub data_type: DataType,
    /// Attribute word of the head.
    pub attribute: u64,
    /// State word of the head.
    pub state: u64,
    /// Payload gathered across the chain.
    pub payload: Vec<u8>,
}

/// Reads the content of the chain whose head sits at canonical `handle`.
///
/// Works on expanded and compacted images; `map` resolves canonical offsets
/// of a compacted one.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if a link cannot be resolved or loops.
pub fn read_chain(
    image: &GenImage,
    map: Option<&crate::layout::GenMap>,
    handle: Handle,
) -> Result<ItemContent> {
    let gen_id: GenId = image.gen_id();
    let header = image.header();
    let resolve = |canonical: u64| -> Result<u64> {
        if !image.is_compacted() {
            return Ok(canonical);
        }
        map.and_then(|m| m.resolve(header, canonical)).ok_or_else(|| {
            Error::corrupted(format!("generation {gen_id}: no item for {canonical:#x}"))
        })
    };

    let head_at = resolve(handle.offset())?;
    let head = image.descriptor(head_at)?;
    let mut payload = Vec::with_capacity(head.total_length as usize);
    let mut at = head_at;
    let mut links = 0u64;
    loop {
        links += 1;
        if links > header.granule_count() {
            return Err(Error::corrupted(format!("generation {gen_id}: chain loops")));
        }
        payload.extend_from_slice(image.payload(at)?);
        let next = image.descriptor(at)?.next_handle;
        if next.is_end() || next.gen_id() != gen_id {
            break;
        }
        at = resolve(next.offset())?;
    }
    Ok(ItemContent {
        data_type: head.data_type,
        attribute: head.attribute,
        state: head.state,
        payload,
    })
}
