//! Generation cache with a memory budget.
//!
//! Tracks every known generation's residency and charges the bytes of
//! resident images and their granule maps against one budget. When a new
//! reservation does not fit, least recently used generations are evicted:
//! granule maps first, then whole images.
//!
//! Images are handed out as `Arc<GenImage>`. A generation whose image (or
//! map) is still held outside the cache is in use and is never evicted.
//! Pinned generations are never evicted either. Releasing or cancelling a
//! generation while a reader still holds its image detaches the bytes: they
//! stay charged until the last outside holder drops them.
//!
//! The cache is not synchronized; the owner keeps it behind its own lock.

use std::{collections::BTreeMap, sync::Arc};

use genstore_types::{GenId, config::StoreConfig};

use crate::{
    error::{Error, Result},
    layout::{GenImage, GenMap},
};

/// Where a generation's bytes are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Residency {
    /// On disk; nothing loaded and no read pending.
    #[default]
    NotRequested,
    /// Memory reserved and a read is in flight.
    ReadRequested,
    /// Image resident.
    InMemory,
    /// Released after processing; further changes go to the file.
    OnDisk,
}

/// Per-generation cache entry.
#[derive(Debug, Default)]
struct GenEntry {
    residency: Residency,
    image: Option<Arc<GenImage>>,
    map: Option<Arc<GenMap>>,
    /// Bytes charged for the image (or its pending read).
    image_charge: u64,
    /// Bytes charged for the map.
    map_charge: u64,
    last_use: u64,
    pinned: bool,
}

impl GenEntry {
    fn image_in_use(&self) -> bool {
        self.image.as_ref().is_some_and(|img| Arc::strong_count(img) > 1)
    }

    fn map_in_use(&self) -> bool {
        self.map.as_ref().is_some_and(|map| Arc::strong_count(map) > 1)
    }

    fn evictable(&self) -> bool {
        self.residency == Residency::InMemory && !self.pinned && !self.image_in_use()
    }
}

/// Image and map memory dropped by the cache but still held by a reader.
#[derive(Debug)]
struct Detached {
    gen_id: GenId,
    image: Option<Arc<GenImage>>,
    map: Option<Arc<GenMap>>,
    charge: u64,
}

impl Detached {
    fn held(&self) -> bool {
        self.image.as_ref().is_some_and(|img| Arc::strong_count(img) > 1)
            || self.map.as_ref().is_some_and(|map| Arc::strong_count(map) > 1)
    }
}

/// Budget and usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Bytes charged.
    pub in_use: u64,
    /// Configured ceiling.
    pub budget: u64,
    /// Generations with a resident image.
    pub resident: usize,
    /// Images and maps freed to make room.
    pub evictions: u64,
    /// Lookups that found a resident image.
    pub hits: u64,
    /// Lookups that did not.
    pub misses: u64,
}

/// Memory-budgeted table of generations.
#[derive(Debug)]
pub struct GenCache {
    gens: BTreeMap<GenId, GenEntry>,
    detached: Vec<Detached>,
    budget: u64,
    read_ahead_headroom: u64,
    in_use: u64,
    clock: u64,
    evictions: u64,
    hits: u64,
    misses: u64,
}

impl GenCache {
    /// Creates an empty cache.
    pub fn new(budget: u64, read_ahead_headroom: u64) -> Self {
        Self {
            gens: BTreeMap::new(),
            detached: Vec::new(),
            budget,
            read_ahead_headroom,
            in_use: 0,
            clock: 0,
            evictions: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Creates an empty cache sized by the store configuration.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.memory_budget_bytes, config.read_ahead_headroom_bytes)
    }

    /// Makes `gen_id` known, not requested. Existing entries are untouched.
    pub fn register(&mut self, gen_id: GenId) {
        self.gens.entry(gen_id).or_default();
    }

    /// Returns `true` if `gen_id` is known.
    pub fn contains(&self, gen_id: GenId) -> bool {
        self.gens.contains_key(&gen_id)
    }

    /// Residency of `gen_id`, if known.
    pub fn residency(&self, gen_id: GenId) -> Option<Residency> {
        self.gens.get(&gen_id).map(|e| e.residency)
    }

    /// Sets the residency of a known generation without touching charges.
    pub fn set_residency(&mut self, gen_id: GenId, residency: Residency) {
        if let Some(entry) = self.gens.get_mut(&gen_id) {
            entry.residency = residency;
        }
    }

    /// Pins or unpins `gen_id`. Pinned generations are never evicted.
    pub fn set_pinned(&mut self, gen_id: GenId, pinned: bool) {
        self.gens.entry(gen_id).or_default().pinned = pinned;
    }

    /// Returns `true` if `gen_id` is pinned.
    pub fn is_pinned(&self, gen_id: GenId) -> bool {
        self.gens.get(&gen_id).is_some_and(|e| e.pinned)
    }

    /// Bytes charged.
    pub fn in_use(&self) -> u64 {
        self.in_use
    }

    /// Configured ceiling.
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Returns `true` while free budget covers the read-ahead headroom.
    pub fn has_read_ahead_room(&self) -> bool {
        self.budget.saturating_sub(self.in_use) >= self.read_ahead_headroom.max(1)
    }

    /// Returns `true` if `bytes` more would fit without eviction.
    pub fn fits(&self, bytes: u64) -> bool {
        self.in_use.saturating_add(bytes) <= self.budget
    }

    /// Records a use of `gen_id` for LRU ordering.
    pub fn touch(&mut self, gen_id: GenId) {
        self.clock += 1;
        let now = self.clock;
        if let Some(entry) = self.gens.get_mut(&gen_id) {
            entry.last_use = now;
        }
    }

    /// Reserves `bytes` for the image of `gen_id` and marks its read requested.
    ///
    /// Evicts least recently used generations as needed: granule maps
    /// first, then images. Only resident, unpinned generations whose image
    /// is not held elsewhere are candidates, and never `gen_id` itself.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocateError`] when the candidates run out before
    /// the reservation fits, unless `force` allows overcommitting.
    pub fn admit(&mut self, gen_id: GenId, bytes: u64, force: bool) -> Result<()> {
        self.reclaim();
        self.make_room(gen_id, bytes, force)?;
        let entry = self.gens.entry(gen_id).or_default();
        entry.image_charge += bytes;
        entry.residency = Residency::ReadRequested;
        self.in_use += bytes;
        Ok(())
    }

    fn make_room(&mut self, target: GenId, bytes: u64, force: bool) -> Result<()> {
        while !self.fits(bytes) {
            if let Some(victim) = self.lru(target, |e| e.map.is_some() && !e.map_in_use()) {
                self.free_map(victim);
                continue;
            }
            if let Some(victim) = self.lru(target, |_| true) {
                self.evict(victim);
                continue;
            }
            if force {
                tracing::debug!(
                    gen_id = %target,
                    bytes,
                    in_use = self.in_use,
                    budget = self.budget,
                    "Overcommitting memory budget"
                );
                return Ok(());
            }
            return Err(Error::AllocateError { gen_id: target, requested: bytes });
        }
        Ok(())
    }

    fn lru(&self, target: GenId, filter: impl Fn(&GenEntry) -> bool) -> Option<GenId> {
        self.gens
            .iter()
            .filter(|(id, e)| **id != target && e.evictable() && filter(e))
            .min_by_key(|(_, e)| e.last_use)
            .map(|(id, _)| *id)
    }

    fn free_map(&mut self, gen_id: GenId) {
        if let Some(entry) = self.gens.get_mut(&gen_id) {
            entry.map = None;
            self.in_use -= entry.map_charge;
            entry.map_charge = 0;
            self.evictions += 1;
            tracing::debug!(gen_id = %gen_id, in_use = self.in_use, "Evicted granule map");
        }
    }

    fn evict(&mut self, gen_id: GenId) {
        let freed = self.drop_bytes(gen_id, Residency::NotRequested);
        self.evictions += 1;
        tracing::debug!(gen_id = %gen_id, freed, in_use = self.in_use, "Evicted generation");
    }

    fn drop_bytes(&mut self, gen_id: GenId, residency: Residency) -> u64 {
        let Some(entry) = self.gens.get_mut(&gen_id) else { return 0 };
        let charge = entry.image_charge + entry.map_charge;
        let detached = Detached { gen_id, image: entry.image.take(), map: entry.map.take(), charge };
        entry.image_charge = 0;
        entry.map_charge = 0;
        entry.residency = residency;
        if detached.held() {
            tracing::debug!(gen_id = %gen_id, bytes = charge, "Generation still held; charge kept");
            self.detached.push(detached);
            return 0;
        }
        self.in_use -= charge;
        charge
    }

    /// Frees the charges of detached images and maps nobody holds any more.
    /// Returns the bytes freed.
    pub fn reclaim(&mut self) -> u64 {
        let mut freed = 0;
        self.detached.retain(|d| {
            if d.held() {
                return true;
            }
            tracing::debug!(gen_id = %d.gen_id, bytes = d.charge, "Reclaimed detached generation");
            freed += d.charge;
            false
        });
        self.in_use -= freed;
        freed
    }

    /// Bytes charged for images and maps the cache no longer tracks.
    pub fn detached_bytes(&self) -> u64 {
        self.detached.iter().map(|d| d.charge).sum()
    }

    /// Installs a freshly read or built image, replacing the reservation
    /// with the image's actual length.
    pub fn install(&mut self, image: GenImage) -> Arc<GenImage> {
        let gen_id = image.gen_id();
        let len = image.len() as u64;
        let image = Arc::new(image);
        let entry = self.gens.entry(gen_id).or_default();
        self.in_use = self.in_use - entry.image_charge + len;
        entry.image_charge = len;
        entry.image = Some(Arc::clone(&image));
        entry.residency = Residency::InMemory;
        self.touch(gen_id);
        image
    }

    /// Replaces a resident image (after in-memory compaction). The old map
    /// no longer applies and is dropped; an old image or map a reader still
    /// holds stays charged until released.
    pub fn replace(&mut self, image: GenImage) -> Arc<GenImage> {
        let gen_id = image.gen_id();
        let residency = self.residency(gen_id).unwrap_or_default();
        self.drop_bytes(gen_id, residency);
        self.install(image)
    }

    /// Drops a reservation whose read failed, or a generation being
    /// forgotten; the generation is not requested.
    pub fn cancel(&mut self, gen_id: GenId) {
        self.reclaim();
        self.drop_bytes(gen_id, Residency::NotRequested);
    }

    /// Releases the bytes of a processed generation. Pinned generations
    /// keep theirs. Returns the bytes freed.
    pub fn release(&mut self, gen_id: GenId) -> u64 {
        if self.is_pinned(gen_id) {
            return 0;
        }
        self.reclaim();
        let freed = self.drop_bytes(gen_id, Residency::OnDisk);
        if freed > 0 {
            tracing::debug!(gen_id = %gen_id, freed, in_use = self.in_use, "Released generation");
        }
        freed
    }

    /// Forgets every generation and frees all charges.
    pub fn clear(&mut self) {
        self.gens.clear();
        self.detached.clear();
        self.in_use = 0;
    }

    /// Resident image of `gen_id`, counting a hit or miss.
    pub fn get(&mut self, gen_id: GenId) -> Option<Arc<GenImage>> {
        let image = self.gens.get(&gen_id).and_then(|e| e.image.clone());
        if image.is_some() {
            self.hits += 1;
            self.touch(gen_id);
        } else {
            self.misses += 1;
        }
        image
    }

    /// Resident image of `gen_id` without touching counters or LRU order.
    pub fn peek(&self, gen_id: GenId) -> Option<Arc<GenImage>> {
        self.gens.get(&gen_id).and_then(|e| e.image.clone())
    }

    /// Granule map of a resident compacted generation, built on first use.
    ///
    /// Map memory may overcommit the budget when nothing can be evicted.
    /// Returns `Ok(None)` for an expanded or non-resident generation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the image's items do not map.
    pub fn map(&mut self, gen_id: GenId) -> Result<Option<Arc<GenMap>>> {
        let Some(entry) = self.gens.get(&gen_id) else { return Ok(None) };
        if let Some(map) = &entry.map {
            return Ok(Some(Arc::clone(map)));
        }
        let Some(image) = entry.image.clone() else { return Ok(None) };
        if !image.is_compacted() {
            return Ok(None);
        }
        let bytes = GenMap::byte_size_for(image.header());
        self.make_room(gen_id, bytes, true)?;
        let map = Arc::new(GenMap::build(&image)?);
        let charge = map.byte_size();
        if let Some(entry) = self.gens.get_mut(&gen_id) {
            entry.map = Some(Arc::clone(&map));
            entry.map_charge = charge;
            self.in_use += charge;
        }
        Ok(Some(map))
    }

    /// Known generations with their residency, ascending by id.
    pub fn entries(&self) -> impl Iterator<Item = (GenId, Residency)> + '_ {
        self.gens.iter().map(|(id, e)| (*id, e.residency))
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            in_use: self.in_use,
            budget: self.budget,
            resident: self.gens.values().filter(|e| e.image.is_some()).count(),
            evictions: self.evictions,
            hits: self.hits,
            misses: self.misses,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{
        bitmap::PoolBitmaps,
        compaction::{CompactionParams, deflate},
        layout::GenerationBuilder,
    };

    /// An expanded image of exactly `granules * 64 + 256` bytes.
    fn image(gen_id: u16, granules: u32) -> GenImage {
        GenerationBuilder::new(GenId(gen_id)).pool(64, granules).build().unwrap()
    }

    fn load(cache: &mut GenCache, gen_id: u16, granules: u32) -> Result<()> {
        let img = image(gen_id, granules);
        cache.admit(GenId(gen_id), img.len() as u64, false)?;
        cache.install(img);
        Ok(())
    }

    // =========================================================================
    // admission and eviction
    // =========================================================================

    #[test]
    fn test_admit_within_budget() {
        let mut cache = GenCache::new(4096, 0);
        load(&mut cache, 2, 12).unwrap();
        assert_eq!(cache.in_use(), 256 + 12 * 64);
        assert_eq!(cache.residency(GenId(2)), Some(Residency::InMemory));
        assert_eq!(cache.stats().resident, 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache = GenCache::new(3 * 1024, 0);
        load(&mut cache, 2, 12).unwrap(); // 1024
        load(&mut cache, 3, 12).unwrap();
        load(&mut cache, 4, 12).unwrap();
        cache.touch(GenId(2));

        load(&mut cache, 5, 12).unwrap();
        assert_eq!(cache.residency(GenId(3)), Some(Residency::NotRequested));
        assert_eq!(cache.residency(GenId(2)), Some(Residency::InMemory));
        assert!(cache.in_use() <= cache.budget());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_pinned_and_in_use_are_not_evicted() {
        let mut cache = GenCache::new(2 * 1024, 0);
        load(&mut cache, 2, 12).unwrap();
        load(&mut cache, 3, 12).unwrap();
        cache.set_pinned(GenId(2), true);
        let held = cache.get(GenId(3)).unwrap();

        let err = cache.admit(GenId(4), 1024, false).unwrap_err();
        assert!(matches!(err, Error::AllocateError { gen_id, requested: 1024 } if gen_id == GenId(4)));

        drop(held);
        cache.admit(GenId(4), 1024, false).unwrap();
        assert_eq!(cache.residency(GenId(3)), Some(Residency::NotRequested));
        assert_eq!(cache.residency(GenId(2)), Some(Residency::InMemory));
    }

    #[test]
    fn test_forced_admission_overcommits() {
        let mut cache = GenCache::new(1024, 0);
        cache.set_pinned(GenId(1), true);
        load(&mut cache, 1, 12).unwrap();
        cache.admit(GenId(2), 512, true).unwrap();
        assert_eq!(cache.in_use(), 1536);
        assert!(!cache.fits(0));
    }

    #[test]
    fn test_maps_are_freed_before_images() {
        let mut expanded = image(3, 64);
        let mut alloc = crate::layout::GranuleAllocator::scan(&expanded).unwrap();
        alloc
            .store(
                &mut expanded,
                crate::layout::NewItem {
                    data_type: crate::layout::DataType::MESSAGE,
                    attribute: 0,
                    state: 0,
                    payload: b"abc",
                },
            )
            .unwrap();
        let params = CompactionParams { disk_block_size: 512, trim_references: false };
        let compacted = deflate(&expanded, None::<&PoolBitmaps>, &params).unwrap();
        let map_size = GenMap::byte_size_for(compacted.header());
        let image_size = compacted.len() as u64;

        let mut cache = GenCache::new(image_size + map_size + 100, 0);
        cache.admit(GenId(3), image_size, false).unwrap();
        cache.install(compacted);
        assert!(cache.map(GenId(3)).unwrap().is_some());
        assert_eq!(cache.in_use(), image_size + map_size);

        cache.admit(GenId(4), 100 + map_size / 2, false).unwrap();
        assert_eq!(cache.residency(GenId(3)), Some(Residency::InMemory));
        assert_eq!(cache.in_use(), image_size + 100 + map_size / 2);
    }

    #[test]
    fn test_release_and_cancel() {
        let mut cache = GenCache::new(8192, 0);
        load(&mut cache, 2, 12).unwrap();
        assert_eq!(cache.release(GenId(2)), 1024);
        assert_eq!(cache.residency(GenId(2)), Some(Residency::OnDisk));
        assert_eq!(cache.in_use(), 0);

        cache.admit(GenId(3), 2000, false).unwrap();
        assert_eq!(cache.residency(GenId(3)), Some(Residency::ReadRequested));
        cache.cancel(GenId(3));
        assert_eq!(cache.residency(GenId(3)), Some(Residency::NotRequested));
        assert_eq!(cache.in_use(), 0);

        cache.set_pinned(GenId(4), true);
        load(&mut cache, 4, 12).unwrap();
        assert_eq!(cache.release(GenId(4)), 0);
    }

    #[test]
    fn test_release_keeps_charge_while_reader_holds_image() {
        let mut cache = GenCache::new(2 * 1024, 0);
        load(&mut cache, 2, 12).unwrap();
        let reader = cache.get(GenId(2)).unwrap();

        assert_eq!(cache.release(GenId(2)), 0);
        assert_eq!(cache.residency(GenId(2)), Some(Residency::OnDisk));
        assert_eq!(cache.in_use(), 1024);
        assert_eq!(cache.detached_bytes(), 1024);
        let err = cache.admit(GenId(3), 1024 + 1, false).unwrap_err();
        assert!(matches!(err, Error::AllocateError { .. }));

        drop(reader);
        cache.admit(GenId(3), 1024 + 1, false).unwrap();
        assert_eq!(cache.detached_bytes(), 0);
        assert_eq!(cache.in_use(), 1024 + 1);
    }

    #[test]
    fn test_replace_detaches_held_image() {
        let mut cache = GenCache::new(8192, 0);
        load(&mut cache, 2, 12).unwrap();
        let old = cache.get(GenId(2)).unwrap();
        let smaller = image(2, 4);
        let new_len = smaller.len() as u64;

        let installed = cache.replace(smaller);
        assert!(!Arc::ptr_eq(&installed, &old));
        assert_eq!(cache.in_use(), 1024 + new_len);
        drop(old);
        assert_eq!(cache.reclaim(), 1024);
        assert_eq!(cache.in_use(), new_len);
        assert_eq!(cache.residency(GenId(2)), Some(Residency::InMemory));
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let mut cache = GenCache::new(8192, 0);
        load(&mut cache, 2, 4).unwrap();
        assert!(cache.get(GenId(2)).is_some());
        assert!(cache.get(GenId(9)).is_none());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_read_ahead_room() {
        let mut cache = GenCache::new(4096, 2048);
        assert!(cache.has_read_ahead_room());
        load(&mut cache, 2, 28).unwrap(); // 2048
        assert!(cache.has_read_ahead_room());
        cache.admit(GenId(3), 1, false).unwrap();
        assert!(!cache.has_read_ahead_room());
    }

    // =========================================================================
    // budget invariant
    // =========================================================================

    #[derive(Debug, Clone)]
    enum Op {
        Load(u16, u32),
        Get(u16),
        Release(u16),
        Pin(u16, bool),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (2u16..10, 1u32..40).prop_map(|(g, n)| Op::Load(g, n)),
            (2u16..10).prop_map(Op::Get),
            (2u16..10).prop_map(Op::Release),
            (2u16..10, any::<bool>()).prop_map(|(g, p)| Op::Pin(g, p)),
        ]
    }

    proptest! {
        #[test]
        fn prop_unforced_use_stays_within_budget(ops in proptest::collection::vec(op(), 1..60)) {
            let mut cache = GenCache::new(4 * 1024, 0);
            let mut held = Vec::new();
            for op in ops {
                match op {
                    Op::Load(g, n) => {
                        if cache.residency(GenId(g)) != Some(Residency::InMemory) {
                            let _ = load(&mut cache, g, n);
                        }
                    }
                    Op::Get(g) => {
                        if let Some(img) = cache.get(GenId(g)) {
                            if held.len() < 2 {
                                held.push(img);
                            }
                        }
                    }
                    Op::Release(g) => {
                        held.retain(|img: &Arc<GenImage>| img.gen_id() != GenId(g));
                        cache.release(GenId(g));
                    }
                    Op::Pin(g, p) => cache.set_pinned(GenId(g), p),
                }
                prop_assert!(cache.in_use() <= cache.budget());
                let charged: u64 = cache
                    .entries()
                    .filter(|(_, r)| *r == Residency::InMemory)
                    .map(|(g, _)| cache.peek(g).map_or(0, |img| img.len() as u64))
                    .sum();
                prop_assert_eq!(charged, cache.in_use());
            }
        }
    }
}
