//! Index of the management generation.
//!
//! Built once when recovery starts: the generation id chain, every split
//! item (owner) with the generation holding its data, the ref-state chunks
//! and state chunks each owner has, and per record type the owners whose
//! data, or whose property record, lives in each generation.

use std::collections::{BTreeMap, BTreeSet};

use genstore_types::{GenId, Handle};

use crate::{
    error::{Error, Result},
    layout::{DataType, GenIdChunk, GenImage, RefStateChunk, SplitItem, StateChunk},
};

/// What recovery knows about one split item.
#[derive(Debug, Clone)]
pub(crate) struct OwnerInfo {
    pub(crate) data_type: DataType,
    pub(crate) attribute: u64,
    pub(crate) state: u64,
    pub(crate) item: SplitItem,
    /// Generation holding the owner's data.
    pub(crate) data_gen: GenId,
    /// Ref-state chunks of the current owner version, ascending base order id.
    pub(crate) ref_states: Vec<RefStateChunk>,
    /// Offsets of the owner's state chunks in granule order.
    pub(crate) state_chunks: Vec<u64>,
}

impl OwnerInfo {
    /// Ref-state override for `order_id`, if a chunk covers it.
    pub(crate) fn ref_state(&self, order_id: u64) -> Option<u8> {
        let idx = self.ref_states.partition_point(|c| c.base_order_id <= order_id);
        let chunk = self.ref_states.get(idx.checked_sub(1)?)?;
        chunk.state_for(order_id)
    }
}

#[derive(Debug, Default)]
pub(crate) struct MgmtIndex {
    /// Generation ids in chain order; position is the sequence index.
    pub(crate) chain: Vec<GenId>,
    /// First data generation in the chain; owners without large data live there.
    pub(crate) first_gen: GenId,
    /// Split items keyed by their offset in the management generation.
    pub(crate) owners: BTreeMap<u64, OwnerInfo>,
    /// Owner offsets per (record type, data generation), ascending.
    pub(crate) new_owners: BTreeMap<(DataType, GenId), Vec<u64>>,
    /// Owner offsets per (record type, property generation), ascending.
    pub(crate) prop_owners: BTreeMap<(DataType, GenId), Vec<u64>>,
}

impl MgmtIndex {
    /// Scans an expanded management image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] for a compacted or non-management
    /// image and [`Error::Corrupted`] if the generation id chain is broken.
    pub(crate) fn build(mgmt: &GenImage) -> Result<Self> {
        if !mgmt.gen_id().is_mgmt() || mgmt.is_compacted() {
            return Err(Error::bad_parameter("expected an expanded management image"));
        }
        let chain = walk_gen_chain(mgmt)?;
        let first_gen = chain.iter().copied().find(|g| !g.is_mgmt()).unwrap_or(GenId::MGMT);
        let known: BTreeSet<GenId> = chain.iter().copied().collect();

        let mut owners = BTreeMap::new();
        let mut ref_states: Vec<RefStateChunk> = Vec::new();
        let mut states: Vec<(Handle, u64)> = Vec::new();
        for offset in mgmt.granule_offsets() {
            let desc = mgmt.descriptor(offset)?;
            if !desc.data_type.is_primary() {
                continue;
            }
            match desc.data_type {
                t if t.is_split_item() => {
                    let item = SplitItem::decode(mgmt.payload(offset)?)?;
                    owners.insert(offset, OwnerInfo {
                        data_type: t,
                        attribute: desc.attribute,
                        state: desc.state,
                        item,
                        data_gen: item.data_gen(first_gen),
                        ref_states: Vec::new(),
                        state_chunks: Vec::new(),
                    });
                }
                DataType::REFSTATES => match mgmt.payload(offset).and_then(RefStateChunk::decode) {
                    Ok(chunk) => ref_states.push(chunk),
                    Err(e) => tracing::warn!(offset, error = %e, "Skipping unreadable ref-state chunk"),
                },
                DataType::STATES => match mgmt.payload(offset).and_then(StateChunk::decode) {
                    Ok(chunk) => states.push((chunk.owner, offset)),
                    Err(e) => tracing::warn!(offset, error = %e, "Skipping unreadable state chunk"),
                },
                _ => {}
            }
        }

        for chunk in ref_states {
            match owner_mut(&mut owners, chunk.owner) {
                Some(owner) if owner.item.version == chunk.owner_version => {
                    owner.ref_states.push(chunk);
                }
                _ => tracing::debug!(owner = %chunk.owner, "Orphan ref-state chunk"),
            }
        }
        for (owner, offset) in states {
            match owner_mut(&mut owners, owner) {
                Some(info) => info.state_chunks.push(offset),
                None => tracing::debug!(owner = %owner, offset, "Orphan state chunk"),
            }
        }

        let mut new_owners: BTreeMap<(DataType, GenId), Vec<u64>> = BTreeMap::new();
        let mut prop_owners: BTreeMap<(DataType, GenId), Vec<u64>> = BTreeMap::new();
        for (&offset, owner) in &mut owners {
            owner.ref_states.sort_by_key(|c| c.base_order_id);
            if known.contains(&owner.data_gen) {
                new_owners.entry((owner.data_type, owner.data_gen)).or_default().push(offset);
            } else {
                tracing::debug!(offset, data_gen = %owner.data_gen, "Orphan owner");
            }
            if owner.data_type.has_properties() {
                let prop_gen = Handle::from_raw(owner.attribute).gen_id();
                if known.contains(&prop_gen) {
                    prop_owners.entry((owner.data_type, prop_gen)).or_default().push(offset);
                }
            }
        }

        tracing::debug!(
            generations = chain.len(),
            owners = owners.len(),
            first_gen = %first_gen,
            "Indexed management generation"
        );
        Ok(Self { chain, first_gen, owners, new_owners, prop_owners })
    }

    /// Owner addressed by `handle`.
    pub(crate) fn owner(&self, handle: Handle) -> Option<&OwnerInfo> {
        if !handle.gen_id().is_mgmt() {
            return None;
        }
        self.owners.get(&handle.offset())
    }

    /// Returns `true` when `handle` names a split item of `version`.
    pub(crate) fn owner_matches(&self, handle: Handle, version: u32) -> bool {
        self.owner(handle).is_some_and(|o| o.item.version == version)
    }
}

fn owner_mut(owners: &mut BTreeMap<u64, OwnerInfo>, handle: Handle) -> Option<&mut OwnerInfo> {
    if !handle.gen_id().is_mgmt() {
        return None;
    }
    owners.get_mut(&handle.offset())
}

/// Generation ids along the management generation's id chain.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if a node does not decode, the chain loops,
/// or an id repeats.
pub(crate) fn walk_gen_chain(mgmt: &GenImage) -> Result<Vec<GenId>> {
    let mut ids = Vec::new();
    let mut seen = BTreeSet::new();
    let mut link = mgmt.header().gen_id_chain;
    let mut nodes = 0u64;
    while !link.is_end() {
        nodes += 1;
        if nodes > mgmt.header().granule_count() {
            return Err(Error::corrupted("generation id chain loops"));
        }
        let desc = mgmt.descriptor(link.offset())?;
        if desc.data_type.base() != DataType::GENIDS {
            return Err(Error::corrupted(format!(
                "generation id chain node {link} has type {:#x}",
                desc.data_type.0
            )));
        }
        for gen_id in GenIdChunk::decode(mgmt.payload(link.offset())?)?.gen_ids {
            if gen_id.is_null() || !seen.insert(gen_id) {
                return Err(Error::corrupted(format!("generation id {gen_id} repeats in the chain")));
            }
            ids.push(gen_id);
        }
        link = desc.next_handle;
    }
    Ok(ids)
}
