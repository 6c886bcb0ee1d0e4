//! Recovery iterators.
//!
//! Every iterator takes a cursor the caller initialises to `None`. The
//! first call positions it; [`Error::NoMoreEntries`] resets it to `None`.
//! [`Error::BufferTooSmall`] leaves it on the same item so the call can be
//! repeated with a larger buffer. Passing a cursor opened for other
//! arguments fails with [`Error::ArgNotValid`].
//!
//! Records and reference slots can also be read directly by handle.

use std::sync::Arc;

use genstore_types::{GenId, Handle};

use super::{
    Recovery, RecoveryShared, mark_live,
    mgmt::OwnerInfo,
    relink::{capacity_at, chain_after},
};
use crate::{
    cache::Residency,
    compaction::read_chain,
    error::{Error, ErrorKind, Result},
    layout::{
        DESCRIPTOR_SIZE, DataType, GenHeader, GenImage, GenMap, REFERENCE_CHUNK_HEADER_SIZE,
        REFERENCE_SIZE, REFSTATE_DELETED, REFSTATE_NOT_VALID, ReferenceChunk, SPLIT_ITEM_SIZE,
        STATE_VALID, StateChunk,
    },
};

/// A stored record handed out by [`Recovery::next_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordInfo {
    /// Handle of the record (a management handle for split items).
    pub handle: Handle,
    /// Record type.
    pub data_type: DataType,
    /// Attribute word.
    pub attribute: u64,
    /// State word.
    pub state: u64,
    /// Bytes copied into the caller's buffer.
    pub data_len: usize,
}

/// A reference handed out by [`Recovery::next_reference`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceInfo {
    /// Handle of the reference slot.
    pub handle: Handle,
    /// Order id of the slot.
    pub order_id: u64,
    /// Referenced item.
    pub ref_handle: Handle,
    /// Opaque value.
    pub value: u32,
    /// Effective state after ref-state overrides.
    pub state: u8,
}

/// Owner of a reference slot, from [`Recovery::reference_information`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceOwner {
    /// Split item owning the chunk.
    pub owner: Handle,
    /// Record type of the owner.
    pub owner_type: DataType,
    /// Order id of the slot.
    pub order_id: u64,
}

/// A state object handed out by [`Recovery::next_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateInfo {
    /// Handle of the state slot in the management generation.
    pub handle: Handle,
    /// Opaque value.
    pub value: u32,
}

// =========================================================================
// Cursors
// =========================================================================

/// Position in the generation sequence.
#[derive(Debug, Clone, Default)]
pub struct GenCursor {
    position: usize,
    /// Last two generations handed out, newest first.
    recent: [Option<GenId>; 2],
}

enum RecordItems {
    /// Split items: owner offsets in the management generation.
    Owners(Vec<u64>),
    /// Data items: (image offset, canonical offset) of each head.
    Heads { image: Arc<GenImage>, map: Option<Arc<GenMap>>, heads: Vec<(u64, u64)> },
}

/// Position in the records of one type in one generation.
pub struct RecordCursor {
    record_type: DataType,
    gen_id: GenId,
    items: RecordItems,
    position: usize,
}

impl std::fmt::Debug for RecordCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCursor")
            .field("record_type", &self.record_type)
            .field("gen_id", &self.gen_id)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

/// Position in one owner's references within one generation.
pub struct ReferenceCursor {
    owner: Handle,
    gen_id: GenId,
    info: OwnerInfo,
    image: Arc<GenImage>,
    capacity: u64,
    /// Canonical offset of the chain head.
    head: u64,
    /// Chunks in chain order with their canonical offsets.
    chunks: Vec<(u64, ReferenceChunk)>,
    chunk: usize,
    slot: usize,
    last_hit: Option<u64>,
}

impl std::fmt::Debug for ReferenceCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceCursor")
            .field("owner", &self.owner)
            .field("gen_id", &self.gen_id)
            .field("chunk", &self.chunk)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

/// Position in one client's state objects.
#[derive(Debug, Clone)]
pub struct StateCursor {
    owner: Handle,
    chunks: Vec<u64>,
    chunk: usize,
    entry: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnerList {
    /// Data lives in the generation.
    New,
    /// Property record lives in the generation.
    Property,
    /// Reference chain lives in the generation.
    Reference,
}

/// Position in the owners of one type tied to one generation.
#[derive(Debug, Clone)]
pub struct OwnerCursor {
    list: OwnerList,
    record_type: DataType,
    gen_id: GenId,
    owners: Vec<u64>,
    position: usize,
}

impl OwnerCursor {
    fn matches(&self, list: OwnerList, record_type: DataType, gen_id: GenId) -> bool {
        self.list == list && self.record_type == record_type && self.gen_id == gen_id
    }
}

impl Recovery {
    /// Next generation in chain order.
    ///
    /// The generation handed out two calls ago is released and the previous
    /// one is marked processed, then read-ahead continues.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMoreEntries`] after the last generation and
    /// [`Error::NotAvailable`] outside the started phase.
    pub fn next_generation(&self, cursor: &mut Option<GenCursor>) -> Result<GenId> {
        let shared = &self.shared;
        let mut t = shared.lock_started()?;
        let c = cursor.get_or_insert_with(GenCursor::default);
        if let Some(prev) = c.recent[0] {
            if let Some(info) = t.gens.get_mut(&prev) {
                info.processed = true;
            }
            t.cache.touch(prev);
        }
        if let Some(old) = c.recent[1] {
            t.cache.release(old);
        }

        let next =
            t.index.chain.iter().copied().enumerate().skip(c.position).find(|(_, g)| !g.is_mgmt());
        let Some((at, gen_id)) = next else {
            for gen_id in c.recent.into_iter().flatten() {
                t.cache.release(gen_id);
            }
            *cursor = None;
            return Err(Error::NoMoreEntries);
        };
        c.position = at + 1;
        c.recent = [Some(gen_id), c.recent[0]];
        t.visited += 1;
        tracing::debug!(gen_id = %gen_id, position = c.position, "Next generation");
        shared.read_ahead(&mut t);
        Ok(gen_id)
    }

    /// Next record of `record_type` whose data lives in `gen_id`, copied
    /// into `buf`.
    ///
    /// Split types come from the management generation; data types are
    /// visited by ascending offset, or in image order when the generation is
    /// compacted. Every record returned is marked live. Records that fail a
    /// structural check are logged and skipped.
    ///
    /// # Errors
    ///
    /// - [`Error::BufferTooSmall`] with the required length; the cursor stays put
    /// - [`Error::NoMoreEntries`] at the end
    /// - [`Error::ArgNotValid`] for a non-record type or a mismatched cursor
    pub fn next_record(
        &self,
        cursor: &mut Option<RecordCursor>,
        record_type: DataType,
        gen_id: GenId,
        buf: &mut [u8],
    ) -> Result<RecordInfo> {
        if cursor.as_ref().is_some_and(|c| c.record_type != record_type || c.gen_id != gen_id) {
            return Err(Error::ArgNotValid { name: "cursor" });
        }
        if cursor.is_none() {
            *cursor = Some(self.open_records(record_type, gen_id)?);
        }
        loop {
            let Some(c) = cursor.as_mut() else { return Err(Error::NoMoreEntries) };
            let result = match &c.items {
                RecordItems::Owners(owners) => match owners.get(c.position) {
                    Some(&offset) => self.read_split(offset, buf),
                    None => Err(Error::NoMoreEntries),
                },
                RecordItems::Heads { image, map, heads } => match heads.get(c.position) {
                    Some(&(at, canonical)) => {
                        self.read_data(image, map.as_deref(), at, canonical, buf)
                    }
                    None => Err(Error::NoMoreEntries),
                },
            };
            match result {
                Ok(info) => {
                    c.position += 1;
                    return Ok(info);
                }
                Err(Error::NoMoreEntries) => {
                    *cursor = None;
                    return Err(Error::NoMoreEntries);
                }
                Err(e) if e.kind() == ErrorKind::Consistency => {
                    tracing::warn!(
                        gen_id = %gen_id,
                        record_type = ?record_type,
                        position = c.position,
                        error = %e,
                        "Skipping unreadable record"
                    );
                    c.position += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn open_records(&self, record_type: DataType, gen_id: GenId) -> Result<RecordCursor> {
        if !record_type.is_primary() || !record_type.is_record() {
            return Err(Error::ArgNotValid { name: "record_type" });
        }
        if record_type.is_split_item() {
            let t = self.shared.lock_started()?;
            if !t.gens.contains_key(&gen_id) {
                return Err(Error::ArgNotValid { name: "gen_id" });
            }
            let owners =
                t.index.new_owners.get(&(record_type, gen_id)).cloned().unwrap_or_default();
            let items = RecordItems::Owners(owners);
            return Ok(RecordCursor { record_type, gen_id, items, position: 0 });
        }

        let (image, map) = self.shared.load(gen_id)?;
        let present = self
            .shared
            .tables
            .lock()
            .gens
            .get(&gen_id)
            .is_some_and(|i| i.record_types.contains(&record_type));
        if !present {
            return Err(Error::NoMoreEntries);
        }
        let heads = if image.is_compacted() {
            image
                .compacted_items()
                .map_while(|item| item.ok())
                .filter(|(_, desc)| desc.data_type == record_type)
                .filter_map(|(at, desc)| image.canonical_offset(&desc).ok().map(|c| (at, c)))
                .collect()
        } else {
            image
                .granule_offsets()
                .filter(|&o| image.descriptor(o).is_ok_and(|d| d.data_type == record_type))
                .map(|o| (o, o))
                .collect()
        };
        let items = RecordItems::Heads { image, map, heads };
        Ok(RecordCursor { record_type, gen_id, items, position: 0 })
    }

    fn read_data(
        &self,
        image: &GenImage,
        map: Option<&GenMap>,
        at: u64,
        canonical: u64,
        buf: &mut [u8],
    ) -> Result<RecordInfo> {
        let gen_id = image.gen_id();
        let head = image.descriptor(at)?;
        let required = head.total_length as usize;
        if buf.len() < required {
            return Err(Error::BufferTooSmall { required });
        }
        let handle = Handle::new(gen_id, canonical);
        let content = read_chain(image, map, handle)?;
        if content.payload.len() != required {
            return Err(Error::corrupted(format!(
                "item {handle} holds {} bytes, expected {required}",
                content.payload.len()
            )));
        }
        buf[..required].copy_from_slice(&content.payload);
        mark_live(&mut self.shared.tables.lock(), image, canonical);
        Ok(RecordInfo {
            handle,
            data_type: content.data_type,
            attribute: content.attribute,
            state: content.state,
            data_len: required,
        })
    }

    fn read_split(&self, offset: u64, buf: &mut [u8]) -> Result<RecordInfo> {
        let handle = Handle::new(GenId::MGMT, offset);
        let owner = self
            .shared
            .tables
            .lock()
            .index
            .owner(handle)
            .cloned()
            .ok_or(Error::ArgNotValid { name: "handle" })?;
        let item = owner.item;
        let required = item.data_length as usize;
        if buf.len() < required {
            return Err(Error::BufferTooSmall { required });
        }

        if item.large_data.is_end() {
            let content = read_chain(&self.shared.mgmt, None, handle)?;
            let inline = content
                .payload
                .get(SPLIT_ITEM_SIZE..SPLIT_ITEM_SIZE + required)
                .ok_or_else(|| Error::corrupted(format!("split item {handle} truncated")))?;
            buf[..required].copy_from_slice(inline);
        } else {
            let large = item.large_data;
            let (image, map) = self.shared.load(large.gen_id())?;
            let content = read_chain(&image, map.as_deref(), large)?;
            let data = content.payload.get(..required).ok_or_else(|| {
                Error::corrupted(format!("large data {large} of {handle} truncated"))
            })?;
            buf[..required].copy_from_slice(data);
            mark_live(&mut self.shared.tables.lock(), &image, large.offset());
        }
        Ok(RecordInfo {
            handle,
            data_type: owner.data_type,
            attribute: owner.attribute,
            state: owner.state,
            data_len: required,
        })
    }

    /// Next reference of `owner` held in `gen_id`.
    ///
    /// Skips empty slots, order ids below the owner's minimum active order
    /// id and slots whose ref-state marks them deleted; other ref-states
    /// override the stored one. At the end the chain is marked live, or the
    /// range is dropped when nothing in it is still needed.
    ///
    /// # Errors
    ///
    /// - [`Error::NoMoreEntries`] at the end or if `gen_id` holds nothing for `owner`
    /// - [`Error::ArgNotValid`] if `owner` is not a split item or the cursor
    ///   belongs to other arguments
    pub fn next_reference(
        &self,
        cursor: &mut Option<ReferenceCursor>,
        owner: Handle,
        gen_id: GenId,
    ) -> Result<ReferenceInfo> {
        if cursor.as_ref().is_some_and(|c| c.owner != owner || c.gen_id != gen_id) {
            return Err(Error::ArgNotValid { name: "cursor" });
        }
        if cursor.is_none() {
            *cursor = Some(self.open_references(owner, gen_id)?);
        }
        let Some(c) = cursor.as_mut() else { return Err(Error::NoMoreEntries) };
        let min_active = c.info.item.min_active_order_id;
        loop {
            let Some((canonical, chunk)) = c.chunks.get(c.chunk) else { break };
            let Some(r) = chunk.references.get(c.slot) else {
                c.chunk += 1;
                c.slot = 0;
                continue;
            };
            let slot = c.slot as u64;
            c.slot += 1;
            let order_id = chunk.base_order_id + slot;
            if r.is_null() || order_id < min_active {
                continue;
            }
            let state = match c.info.ref_state(order_id) {
                Some(REFSTATE_DELETED) => continue,
                Some(REFSTATE_NOT_VALID) | None => r.state,
                Some(state) => state,
            };
            let position =
                if c.image.is_compacted() { slot + chunk.base_order_id % c.capacity } else { slot };
            let offset = canonical
                + (DESCRIPTOR_SIZE + REFERENCE_CHUNK_HEADER_SIZE) as u64
                + position * REFERENCE_SIZE as u64;
            c.last_hit = Some(order_id);
            return Ok(ReferenceInfo {
                handle: Handle::new(gen_id, offset),
                order_id,
                ref_handle: r.ref_handle,
                value: r.value,
                state,
            });
        }

        self.finish_references(c);
        *cursor = None;
        Err(Error::NoMoreEntries)
    }

    fn open_references(&self, owner: Handle, gen_id: GenId) -> Result<ReferenceCursor> {
        let info = self
            .shared
            .lock_started()?
            .index
            .owner(owner)
            .filter(|o| o.data_type.is_split_item())
            .cloned()
            .ok_or(Error::ArgNotValid { name: "owner" })?;

        // ranges are collected when the generation is loaded
        let (image, map) = self.shared.load(gen_id)?;
        let range = self
            .shared
            .tables
            .lock()
            .ref_gens
            .get(&owner.offset())
            .and_then(|v| v.iter().find(|r| r.gen_id == gen_id))
            .copied()
            .ok_or(Error::NoMoreEntries)?;
        let head = range.head.offset();
        let head_at = match &map {
            Some(map) => map.resolve(image.header(), head).ok_or_else(|| {
                Error::corrupted(format!("generation {gen_id}: no reference chunk at {head:#x}"))
            })?,
            None => head,
        };
        let mut chunks = vec![(head, ReferenceChunk::decode(image.payload(head_at)?)?)];
        chunks.extend(chain_after(&image, head_at)?.into_iter().map(|(_, c, chunk)| (c, chunk)));
        let capacity = capacity_at(&image, head)?;
        Ok(ReferenceCursor {
            owner,
            gen_id,
            info,
            image,
            capacity,
            head,
            chunks,
            chunk: 0,
            slot: 0,
            last_hit: None,
        })
    }

    fn finish_references(&self, c: &ReferenceCursor) {
        let mut t = self.shared.tables.lock();
        let min_active = c.info.item.min_active_order_id;
        let key = c.owner.offset();
        let Some(ranges) = t.ref_gens.get_mut(&key) else { return };
        let Some(idx) = ranges.iter().position(|r| r.gen_id == c.gen_id) else { return };

        let end = ranges[idx].highest_order_id + 1;
        let rounded = end.div_ceil(c.capacity).saturating_mul(c.capacity);
        if c.last_hit.is_some() || rounded > min_active {
            if let Some(hit) = c.last_hit {
                ranges[idx].highest_order_id = hit;
            }
            mark_live(&mut t, &c.image, c.head);
        } else {
            ranges.remove(idx);
            if ranges.is_empty() {
                t.ref_gens.remove(&key);
            }
            tracing::debug!(owner = %c.owner, gen_id = %c.gen_id, "Dropped empty reference range");
        }
    }

    /// Next valid state object of a client `owner`.
    ///
    /// # Errors
    ///
    /// - [`Error::NoMoreEntries`] at the end
    /// - [`Error::ArgNotValid`] if `owner` is not a client record or the
    ///   cursor belongs to another owner
    pub fn next_state(&self, cursor: &mut Option<StateCursor>, owner: Handle) -> Result<StateInfo> {
        if cursor.as_ref().is_some_and(|c| c.owner != owner) {
            return Err(Error::ArgNotValid { name: "cursor" });
        }
        if cursor.is_none() {
            let t = self.shared.lock_started()?;
            let chunks = t
                .index
                .owner(owner)
                .filter(|o| o.data_type.base() == DataType::CLIENT)
                .ok_or(Error::ArgNotValid { name: "owner" })?
                .state_chunks
                .clone();
            *cursor = Some(StateCursor { owner, chunks, chunk: 0, entry: 0 });
        }
        let Some(c) = cursor.as_mut() else { return Err(Error::NoMoreEntries) };
        let mgmt = &self.shared.mgmt;
        while let Some(&offset) = c.chunks.get(c.chunk) {
            let chunk = match mgmt.payload(offset).and_then(StateChunk::decode) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!(offset, error = %e, "Skipping unreadable state chunk");
                    c.chunk += 1;
                    c.entry = 0;
                    continue;
                }
            };
            while let Some(entry) = chunk.entries.get(c.entry) {
                let index = c.entry;
                c.entry += 1;
                if entry.flag == STATE_VALID {
                    let at = offset + (DESCRIPTOR_SIZE + StateChunk::entry_offset(index)) as u64;
                    return Ok(StateInfo { handle: Handle::new(GenId::MGMT, at), value: entry.value });
                }
            }
            c.chunk += 1;
            c.entry = 0;
        }
        *cursor = None;
        Err(Error::NoMoreEntries)
    }

    /// Next owner of `record_type` whose data lives in `gen_id`, in handle
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMoreEntries`] at the end and [`Error::ArgNotValid`]
    /// for a non-split type or a mismatched cursor.
    pub fn next_new_owner(
        &self,
        cursor: &mut Option<OwnerCursor>,
        record_type: DataType,
        gen_id: GenId,
    ) -> Result<Handle> {
        if cursor.is_none() {
            if !record_type.is_primary() || !record_type.is_split_item() {
                return Err(Error::ArgNotValid { name: "record_type" });
            }
            let t = self.shared.lock_started()?;
            let owners =
                t.index.new_owners.get(&(record_type, gen_id)).cloned().unwrap_or_default();
            *cursor = Some(OwnerCursor {
                list: OwnerList::New,
                record_type,
                gen_id,
                owners,
                position: 0,
            });
        }
        next_owner(cursor, OwnerList::New, record_type, gen_id)
    }

    /// Next owner of `record_type` whose property record lives in `gen_id`,
    /// with its attribute (the property record's handle).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMoreEntries`] at the end and [`Error::ArgNotValid`]
    /// for a type without properties or a mismatched cursor.
    pub fn next_prop_owner(
        &self,
        cursor: &mut Option<OwnerCursor>,
        record_type: DataType,
        gen_id: GenId,
    ) -> Result<(Handle, u64)> {
        if cursor.is_none() {
            if !record_type.is_primary() || !record_type.has_properties() {
                return Err(Error::ArgNotValid { name: "record_type" });
            }
            let t = self.shared.lock_started()?;
            let owners =
                t.index.prop_owners.get(&(record_type, gen_id)).cloned().unwrap_or_default();
            *cursor = Some(OwnerCursor {
                list: OwnerList::Property,
                record_type,
                gen_id,
                owners,
                position: 0,
            });
        }
        let owner = next_owner(cursor, OwnerList::Property, record_type, gen_id)?;
        let attribute = self
            .shared
            .tables
            .lock()
            .index
            .owner(owner)
            .map(|o| o.attribute)
            .ok_or(Error::ArgNotValid { name: "owner" })?;
        Ok((owner, attribute))
    }

    /// Next owner of `record_type` with a current reference chain in
    /// `gen_id`, in image order. Reads the generation if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMoreEntries`] at the end, [`Error::ArgNotValid`]
    /// for a non-split type or a mismatched cursor, and any error of
    /// [`Recovery::get_generation`].
    pub fn next_ref_owner(
        &self,
        cursor: &mut Option<OwnerCursor>,
        record_type: DataType,
        gen_id: GenId,
    ) -> Result<Handle> {
        if cursor.is_none() {
            if !record_type.is_primary() || !record_type.is_split_item() {
                return Err(Error::ArgNotValid { name: "record_type" });
            }
            // owners are collected when the generation is scanned
            self.shared.get_generation(gen_id)?;
            let t = self.shared.lock_started()?;
            let owners = t
                .gens
                .get(&gen_id)
                .and_then(|i| i.ref_owners.get(&record_type))
                .cloned()
                .unwrap_or_default();
            *cursor = Some(OwnerCursor {
                list: OwnerList::Reference,
                record_type,
                gen_id,
                owners,
                position: 0,
            });
        }
        next_owner(cursor, OwnerList::Reference, record_type, gen_id)
    }

    /// Copies the record at `handle` into `buf`.
    ///
    /// A management handle must name a split item. With `block` unset a
    /// generation that is not resident fails with [`Error::WouldBlock`]
    /// instead of being read. The record is marked live.
    ///
    /// # Errors
    ///
    /// - [`Error::WouldBlock`] as above
    /// - [`Error::ArgNotValid`] if `handle` does not address a record head
    /// - [`Error::BufferTooSmall`] with the required length
    pub fn read_record(&self, handle: Handle, buf: &mut [u8], block: bool) -> Result<RecordInfo> {
        let gen_id = handle.gen_id();
        if gen_id.is_mgmt() {
            let large = {
                let t = self.shared.lock_started()?;
                let owner = t
                    .index
                    .owner(handle)
                    .filter(|o| o.data_type.is_split_item())
                    .ok_or(Error::ArgNotValid { name: "handle" })?;
                owner.item.large_data
            };
            if !large.is_end() {
                self.shared.check_resident(large.gen_id(), block)?;
            }
            return self.read_split(handle.offset(), buf);
        }

        self.shared.check_resident(gen_id, block)?;
        let (image, map) = self.shared.load(gen_id)?;
        let canonical = handle.offset();
        let at = match &map {
            Some(map) => map.resolve(image.header(), canonical),
            None => image.header().locate(canonical).map(|_| canonical),
        }
        .ok_or(Error::ArgNotValid { name: "handle" })?;
        let desc = image.descriptor(at).map_err(|_| Error::ArgNotValid { name: "handle" })?;
        if !desc.data_type.is_primary() || !desc.data_type.is_record() {
            return Err(Error::ArgNotValid { name: "handle" });
        }
        self.read_data(&image, map.as_deref(), at, canonical, buf)
    }

    /// The reference slot at `handle`, checked the way
    /// [`Self::next_reference`] checks it.
    ///
    /// Blocks while the generation is read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArgNotValid`] if `handle` is not a reference slot, its
    /// owner is gone or changed version, or the slot is empty, below the
    /// owner's minimum active order id or deleted by a ref-state.
    pub fn read_reference(&self, handle: Handle) -> Result<ReferenceInfo> {
        self.locate_reference(handle, true, true).map(|(info, _)| info)
    }

    /// Owner and order id of the reference slot at `handle`, whatever the
    /// slot holds.
    ///
    /// # Errors
    ///
    /// [`Error::WouldBlock`] when `block` is unset and the generation is not
    /// resident, [`Error::ArgNotValid`] if `handle` is not a reference slot of
    /// a current owner.
    pub fn reference_information(&self, handle: Handle, block: bool) -> Result<ReferenceOwner> {
        let (info, owner) = self.locate_reference(handle, block, false)?;
        Ok(ReferenceOwner { owner: owner.0, owner_type: owner.1, order_id: info.order_id })
    }

    fn locate_reference(
        &self,
        handle: Handle,
        block: bool,
        check: bool,
    ) -> Result<(ReferenceInfo, (Handle, DataType))> {
        let gen_id = handle.gen_id();
        if gen_id.is_mgmt() || gen_id.is_null() {
            return Err(Error::ArgNotValid { name: "handle" });
        }
        self.shared.check_resident(gen_id, block)?;
        let (image, map) = self.shared.load(gen_id)?;
        let offset = handle.offset();
        let granule =
            granule_start(image.header(), offset).ok_or(Error::ArgNotValid { name: "handle" })?;
        let at = match &map {
            Some(map) => map
                .resolve(image.header(), granule)
                .ok_or(Error::ArgNotValid { name: "handle" })?,
            None => granule,
        };
        let desc = image.descriptor(at).map_err(|_| Error::ArgNotValid { name: "handle" })?;
        if desc.data_type.base() != DataType::REFERENCES {
            return Err(Error::ArgNotValid { name: "handle" });
        }
        let chunk = ReferenceChunk::decode(image.payload(at)?)?;

        let slots_start = granule + (DESCRIPTOR_SIZE + REFERENCE_CHUNK_HEADER_SIZE) as u64;
        let rel = offset.checked_sub(slots_start).ok_or(Error::ArgNotValid { name: "handle" })?;
        if rel % REFERENCE_SIZE as u64 != 0 {
            return Err(Error::ArgNotValid { name: "handle" });
        }
        let position = rel / REFERENCE_SIZE as u64;
        let slot = if image.is_compacted() {
            let capacity = capacity_at(&image, granule)?;
            position.checked_sub(chunk.base_order_id % capacity)
        } else {
            Some(position)
        }
        .ok_or(Error::ArgNotValid { name: "handle" })?;
        let r = chunk.references.get(slot as usize).ok_or(Error::ArgNotValid { name: "handle" })?;
        let order_id = chunk.base_order_id + slot;

        let owner = self
            .shared
            .lock_started()?
            .index
            .owner(chunk.owner)
            .filter(|o| o.data_type.is_split_item() && o.item.version == chunk.owner_version)
            .cloned()
            .ok_or(Error::ArgNotValid { name: "owner" })?;
        let mut state = r.state;
        if check {
            if r.is_null() || order_id < owner.item.min_active_order_id {
                return Err(Error::ArgNotValid { name: "handle" });
            }
            match owner.ref_state(order_id) {
                Some(REFSTATE_DELETED) => return Err(Error::ArgNotValid { name: "handle" }),
                Some(REFSTATE_NOT_VALID) | None => {}
                Some(overridden) => state = overridden,
            }
        }
        let info = ReferenceInfo { handle, order_id, ref_handle: r.ref_handle, value: r.value, state };
        Ok((info, (chunk.owner, owner.data_type)))
    }
}

fn next_owner(
    cursor: &mut Option<OwnerCursor>,
    list: OwnerList,
    record_type: DataType,
    gen_id: GenId,
) -> Result<Handle> {
    let Some(c) = cursor.as_mut() else { return Err(Error::NoMoreEntries) };
    if !c.matches(list, record_type, gen_id) {
        return Err(Error::ArgNotValid { name: "cursor" });
    }
    match c.owners.get(c.position) {
        Some(&offset) => {
            c.position += 1;
            Ok(Handle::new(GenId::MGMT, offset))
        }
        None => {
            *cursor = None;
            Err(Error::NoMoreEntries)
        }
    }
}

/// Canonical offset of the granule containing `offset`.
fn granule_start(header: &GenHeader, offset: u64) -> Option<u64> {
    let pool = header.pools.iter().find(|p| offset >= p.offset && offset < p.end())?;
    let size = u64::from(pool.granule_size);
    Some(pool.offset + (offset - pool.offset) / size * size)
}

impl RecoveryShared {
    /// Fails with [`Error::WouldBlock`] when `gen_id` is not resident and
    /// the caller may not wait for a read.
    fn check_resident(&self, gen_id: GenId, block: bool) -> Result<()> {
        let t = self.lock_started()?;
        if gen_id.is_mgmt() {
            return Ok(());
        }
        if !t.gens.contains_key(&gen_id) {
            return Err(Error::ArgNotValid { name: "handle" });
        }
        if !block && t.cache.residency(gen_id) != Some(Residency::InMemory) {
            return Err(Error::WouldBlock { gen_id });
        }
        Ok(())
    }

    /// Image of `gen_id` with its granule map when compacted.
    ///
    /// The map comes from the cache when the cached image is the one
    /// returned; otherwise a private one is built.
    fn load(self: &Arc<Self>, gen_id: GenId) -> Result<(Arc<GenImage>, Option<Arc<GenMap>>)> {
        let image = self.get_generation(gen_id)?;
        if !image.is_compacted() {
            return Ok((image, None));
        }
        {
            let mut t = self.tables.lock();
            if t.cache.peek(gen_id).is_some_and(|cur| Arc::ptr_eq(&cur, &image)) {
                if let Some(map) = t.cache.map(gen_id)? {
                    return Ok((image, Some(map)));
                }
            }
        }
        let map = Arc::new(GenMap::build(&image)?);
        Ok((image, Some(map)))
    }
}
