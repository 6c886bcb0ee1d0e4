//! Reference chunk relinking and per-owner reference ranges.
//!
//! Reference chunks in a generation are only valid for the owner version
//! they were written under. Relinking turns the chunks of each live owner
//! into one forward chain ordered by base order id and frees the rest; the
//! range scan then records, per owner, which order ids the generation
//! still covers.

use std::collections::{BTreeMap, BTreeSet};

use genstore_types::{GenId, Handle};

use super::mgmt::MgmtIndex;
use crate::{
    error::{Error, Result},
    layout::{DataType, GenImage, ReferenceChunk, SplitItem},
};

/// Counts from one relink pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkSummary {
    /// Chunks kept and linked.
    pub linked: usize,
    /// Distinct owners with linked chunks.
    pub owners: usize,
    /// Chunks freed because their owner is gone, changed version, or the
    /// chunk holds no reference.
    pub freed: usize,
}

/// Range of order ids one generation holds for one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefGen {
    /// Generation holding the chunks.
    pub gen_id: GenId,
    /// First chunk of the owner's chain in this generation.
    pub head: Handle,
    /// Last chunk of the chain.
    pub tail: Handle,
    /// Lowest order id covered.
    pub lowest_order_id: u64,
    /// Highest order id covered (lowered as iteration finds the real last one).
    pub highest_order_id: u64,
    /// Chunks in the chain.
    pub chunks: u32,
}

/// Relinks the reference chunks of an expanded data generation.
///
/// A chunk is kept when its owner is a split item in `mgmt` whose version
/// matches the chunk's owner version and the chunk holds at least one
/// reference. Kept chunks are sorted by (owner, base order id): the first of
/// each owner is primary and links to the next, the rest are marked
/// [`DataType::NOT_PRIMARY`], and the last link of each owner is the end
/// handle. Every other chunk becomes a [`DataType::FREE_GRANULE`] with a
/// null link. Running it twice yields the same links.
///
/// # Errors
///
/// Returns [`Error::ArgNotValid`] for a compacted image and
/// [`Error::Corrupted`] if a descriptor cannot be rewritten.
pub fn link_ref_chunks(image: &mut GenImage, mgmt: &GenImage) -> Result<LinkSummary> {
    if image.is_compacted() {
        return Err(Error::ArgNotValid { name: "image" });
    }
    let gen_id = image.gen_id();
    let offsets: Vec<u64> = image.granule_offsets().collect();
    let mut kept: Vec<(u64, u64, u64)> = Vec::new();
    let mut summary = LinkSummary::default();

    for offset in offsets {
        let desc = image.descriptor(offset)?;
        if desc.data_type.base() != DataType::REFERENCES {
            continue;
        }
        let chunk = image.payload(offset).and_then(ReferenceChunk::decode);
        let keep = match &chunk {
            Ok(chunk) => owner_version(mgmt, chunk.owner) == Some(chunk.owner_version) && chunk.has_live(),
            Err(_) => false,
        };
        match chunk {
            Ok(chunk) if keep => kept.push((chunk.owner.raw(), chunk.base_order_id, offset)),
            Ok(chunk) => {
                tracing::trace!(
                    gen_id = %gen_id,
                    offset,
                    owner = %chunk.owner,
                    version = chunk.owner_version,
                    "Freeing orphan or empty reference chunk"
                );
                free(image, offset)?;
                summary.freed += 1;
            }
            Err(e) => {
                tracing::warn!(gen_id = %gen_id, offset, error = %e, "Freeing unreadable reference chunk");
                free(image, offset)?;
                summary.freed += 1;
            }
        }
    }

    kept.sort_unstable();
    for (i, &(owner, _, offset)) in kept.iter().enumerate() {
        let first = i == 0 || kept[i - 1].0 != owner;
        let next = match kept.get(i + 1) {
            Some(&(next_owner, _, next_offset)) if next_owner == owner => Handle::new(gen_id, next_offset),
            _ => Handle::NULL,
        };
        let mut desc = image.descriptor(offset)?;
        desc.data_type = if first { DataType::REFERENCES } else { DataType::REFERENCES.as_continuation() };
        desc.next_handle = next;
        image.set_descriptor(offset, &desc)?;
        if first {
            summary.owners += 1;
        }
    }
    summary.linked = kept.len();

    tracing::debug!(
        gen_id = %gen_id,
        linked = summary.linked,
        owners = summary.owners,
        freed = summary.freed,
        "Relinked reference chunks"
    );
    Ok(summary)
}

fn owner_version(mgmt: &GenImage, owner: Handle) -> Option<u32> {
    if !owner.gen_id().is_mgmt() {
        return None;
    }
    let desc = mgmt.descriptor(owner.offset()).ok()?;
    if !desc.data_type.is_split_item() || !desc.data_type.is_primary() {
        return None;
    }
    SplitItem::decode(mgmt.payload(owner.offset()).ok()?).ok().map(|si| si.version)
}

fn free(image: &mut GenImage, offset: u64) -> Result<()> {
    let mut desc = image.descriptor(offset)?;
    desc.data_type = DataType::FREE_GRANULE;
    desc.next_handle = Handle::NULL;
    image.set_descriptor(offset, &desc)
}

/// What a resident generation contributes to recovery.
#[derive(Debug, Default)]
pub(crate) struct GenScan {
    /// Per-owner ranges still needed, as (owner offset in management, range).
    pub(crate) ref_gens: Vec<(u64, RefGen)>,
    /// Highest order id per owner rounded up to whole chunks.
    pub(crate) rounded_highest: Vec<(u64, u64)>,
    /// Record types present.
    pub(crate) record_types: BTreeSet<DataType>,
    /// Owners with a current reference chain here, per owner type, in image order.
    pub(crate) ref_owners: BTreeMap<DataType, Vec<u64>>,
}

/// Walks a linked (or compacted) generation, collecting owner ranges and
/// the record types it holds.
///
/// Ranges whose highest order id does not exceed the owner's minimum active
/// order id are dropped. Items that do not decode are logged and skipped so
/// one bad chunk does not hide the rest of the generation.
pub(crate) fn scan_generation(image: &GenImage, index: &MgmtIndex) -> GenScan {
    let gen_id = image.gen_id();
    let mut scan = GenScan::default();

    let heads: Vec<(u64, u64)> = if image.is_compacted() {
        image
            .compacted_items()
            .filter_map(|item| match item.and_then(|(at, desc)| Ok((at, image.canonical_offset(&desc)?))) {
                Ok(head) => Some(head),
                Err(e) => {
                    tracing::warn!(gen_id = %gen_id, error = %e, "Skipping undecodable compacted item");
                    None
                }
            })
            .collect()
    } else {
        image.granule_offsets().map(|o| (o, o)).collect()
    };

    for (at, canonical) in heads {
        let desc = match image.descriptor(at) {
            Ok(desc) => desc,
            Err(e) => {
                tracing::warn!(gen_id = %gen_id, offset = at, error = %e, "Skipping unreadable descriptor");
                continue;
            }
        };
        if desc.data_type.is_record() && desc.data_type.is_primary() {
            scan.record_types.insert(desc.data_type);
            continue;
        }
        if desc.data_type != DataType::REFERENCES {
            continue;
        }
        match scan_chain(image, at, canonical) {
            Ok((chunk, range, capacity)) => {
                let Some(owner) = index.owner(chunk.owner) else { continue };
                if owner.item.version != chunk.owner_version {
                    continue;
                }
                scan.ref_owners.entry(owner.data_type).or_default().push(chunk.owner.offset());
                let end = range.highest_order_id;
                if end > owner.item.min_active_order_id {
                    let rounded = end.div_ceil(capacity).saturating_mul(capacity);
                    let range = RefGen { highest_order_id: end - 1, ..range };
                    scan.rounded_highest.push((chunk.owner.offset(), rounded));
                    scan.ref_gens.push((chunk.owner.offset(), range));
                }
            }
            Err(e) => {
                tracing::warn!(gen_id = %gen_id, offset = canonical, error = %e, "Skipping unreadable reference chain");
            }
        }
    }
    scan
}

/// Decodes the chain headed at image offset `at`. The range's highest
/// order id is still one past the last slot.
fn scan_chain(image: &GenImage, at: u64, canonical: u64) -> Result<(ReferenceChunk, RefGen, u64)> {
    let gen_id = image.gen_id();
    let chunk = ReferenceChunk::decode(image.payload(at)?)?;
    let capacity = capacity_at(image, canonical)?;
    let mut range = RefGen {
        gen_id,
        head: Handle::new(gen_id, canonical),
        tail: Handle::new(gen_id, canonical),
        lowest_order_id: chunk.base_order_id,
        highest_order_id: chunk.end_order_id(),
        chunks: 1,
    };
    for (_, link_canonical, next) in chain_after(image, at)? {
        range.tail = Handle::new(gen_id, link_canonical);
        range.highest_order_id = range.highest_order_id.max(next.end_order_id());
        range.chunks += 1;
    }
    Ok((chunk, range, capacity))
}

/// References per chunk in the pool holding canonical `offset`.
pub(crate) fn capacity_at(image: &GenImage, canonical: u64) -> Result<u64> {
    let header = image.header();
    let (pool, _) = header
        .locate(canonical)
        .ok_or_else(|| Error::corrupted(format!("generation {}: no granule at {canonical:#x}", header.gen_id)))?;
    Ok(ReferenceChunk::capacity(header.pools[pool].granule_data_size()).max(1) as u64)
}

/// Chunks following the one at image offset `at`, as (image offset,
/// canonical offset, chunk).
pub(crate) fn chain_after(image: &GenImage, at: u64) -> Result<Vec<(u64, u64, ReferenceChunk)>> {
    let gen_id = image.gen_id();
    let limit = image.header().granule_count();
    let mut out = Vec::new();
    let mut desc = image.descriptor(at)?;
    let mut cur = at;
    loop {
        if out.len() as u64 >= limit {
            return Err(Error::corrupted(format!("generation {gen_id}: reference chain loops")));
        }
        let next = if image.is_compacted() {
            image.compacted_chain_next(cur, &desc)?
        } else {
            let link = desc.next_handle;
            if link.is_end() || link.gen_id() != gen_id {
                None
            } else {
                Some((link.offset(), image.descriptor(link.offset())?))
            }
        };
        let Some((next_at, next_desc)) = next else { break };
        if next_desc.data_type.base() != DataType::REFERENCES {
            break;
        }
        let canonical = image.canonical_offset(&next_desc)?;
        out.push((next_at, canonical, ReferenceChunk::decode(image.payload(next_at)?)?));
        cur = next_at;
        desc = next_desc;
    }
    Ok(out)
}
