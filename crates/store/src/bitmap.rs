//! Live-granule bitmaps that drive compaction.
//!
//! One [`GranuleBitmap`] per pool; bit `i` set means granule `i` of that
//! pool still holds live data. Recovery sets bits as it visits records and
//! references; compaction keeps only chains whose head bit is set.

use crate::layout::{GenHeader, MAX_POOLS};

/// Number of bits per word in the backing store.
const BITS_PER_WORD: usize = 64;

/// Bitset over the granules of one pool.
///
/// Grows on demand when marking indexes past its current capacity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GranuleBitmap {
    /// Backing store: each u64 tracks 64 granule indexes.
    words: Vec<u64>,
}

impl GranuleBitmap {
    /// Create an empty bitmap.
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Mark a granule live.
    pub fn mark(&mut self, index: u32) {
        let word_idx = index as usize / BITS_PER_WORD;
        let bit_idx = index as usize % BITS_PER_WORD;

        if word_idx >= self.words.len() {
            self.words.resize(word_idx + 1, 0);
        }

        self.words[word_idx] |= 1u64 << bit_idx;
    }

    /// Check if a granule is marked.
    pub fn is_set(&self, index: u32) -> bool {
        let word_idx = index as usize / BITS_PER_WORD;
        let bit_idx = index as usize % BITS_PER_WORD;

        match self.words.get(word_idx) {
            Some(word) => (word & (1u64 << bit_idx)) != 0,
            None => false,
        }
    }

    /// Return all marked indexes in ascending order.
    pub fn set_ids(&self) -> Vec<u32> {
        let mut ids = Vec::new();
        for (word_idx, &word) in self.words.iter().enumerate() {
            let mut rest = word;
            while rest != 0 {
                let bit = rest.trailing_zeros() as usize;
                ids.push((word_idx * BITS_PER_WORD + bit) as u32);
                rest &= rest - 1;
            }
        }
        ids
    }

    /// Number of marked granules.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Clear all marks.
    pub fn clear(&mut self) {
        self.words.clear();
    }

    /// Add every mark of `other`.
    pub fn union_with(&mut self, other: &GranuleBitmap) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine |= theirs;
        }
    }

    /// Bytes held by the backing store.
    pub fn byte_size(&self) -> usize {
        self.words.len() * std::mem::size_of::<u64>()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.words.len() as u32).to_le_bytes());
        for &word in &self.words {
            buf.extend_from_slice(&word.to_le_bytes());
        }
    }

    fn decode_from(data: &[u8]) -> Option<(Self, &[u8])> {
        let (count, rest) = data.split_first_chunk::<4>()?;
        let word_count = u32::from_le_bytes(*count) as usize;
        if rest.len() / 8 < word_count {
            return None;
        }
        let (body, rest) = rest.split_at(word_count * 8);
        let words = body
            .chunks_exact(8)
            .map(|w| {
                let mut b = [0u8; 8];
                b.copy_from_slice(w);
                u64::from_le_bytes(b)
            })
            .collect();
        Some((Self { words }, rest))
    }
}

/// Live bitmaps for every pool of a generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolBitmaps {
    pools: Vec<GranuleBitmap>,
}

impl PoolBitmaps {
    /// Empty bitmaps for `pool_count` pools.
    pub fn new(pool_count: usize) -> Self {
        Self { pools: vec![GranuleBitmap::new(); pool_count] }
    }

    /// Empty bitmaps shaped for `header`.
    pub fn for_header(header: &GenHeader) -> Self {
        Self::new(header.pools.len())
    }

    /// Number of pools covered.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Bitmap of one pool.
    pub fn pool(&self, pool: usize) -> Option<&GranuleBitmap> {
        self.pools.get(pool)
    }

    /// Mark granule `index` of `pool`. Pools beyond the shape are added.
    pub fn mark(&mut self, pool: usize, index: u32) {
        if pool >= self.pools.len() {
            self.pools.resize(pool + 1, GranuleBitmap::new());
        }
        self.pools[pool].mark(index);
    }

    /// Check granule `index` of `pool`.
    pub fn is_set(&self, pool: usize, index: u32) -> bool {
        self.pools.get(pool).is_some_and(|b| b.is_set(index))
    }

    /// Total marked granules.
    pub fn count(&self) -> usize {
        self.pools.iter().map(GranuleBitmap::count).sum()
    }

    /// Returns `true` when nothing is marked.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Add every mark of `other`.
    pub fn union_with(&mut self, other: &PoolBitmaps) {
        if other.pools.len() > self.pools.len() {
            self.pools.resize(other.pools.len(), GranuleBitmap::new());
        }
        for (mine, theirs) in self.pools.iter_mut().zip(&other.pools) {
            mine.union_with(theirs);
        }
    }

    /// Mark the granule at a canonical item offset.
    ///
    /// Returns `false` if the offset is not a granule start.
    pub fn mark_item(&mut self, header: &GenHeader, offset: u64) -> bool {
        match header.locate(offset) {
            Some((pool, index)) => {
                self.mark(pool, index);
                true
            }
            None => false,
        }
    }

    /// Mark every granule overlapping `[offset, offset + len)` within the
    /// pool containing `offset`.
    pub fn mark_bytes(&mut self, header: &GenHeader, offset: u64, len: u64) {
        let Some((pool_id, pool)) =
            header.pools.iter().enumerate().find(|(_, p)| offset >= p.offset && offset < p.end())
        else {
            return;
        };
        let end = (offset + len.max(1)).min(pool.end());
        let first = ((offset - pool.offset) / pool.granule_size as u64) as u32;
        let last = ((end - 1 - pool.offset) / pool.granule_size as u64) as u32;
        for index in first..=last {
            self.mark(pool_id, index);
        }
    }

    /// Bytes held by the bitmaps.
    pub fn byte_size(&self) -> usize {
        self.pools.iter().map(GranuleBitmap::byte_size).sum()
    }

    /// Serialize as `[pool_count u8]` followed by `[word_count u32][words...]`
    /// per pool.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.pools.len() * 4 + self.byte_size());
        buf.push(self.pools.len() as u8);
        for pool in &self.pools {
            pool.encode_into(&mut buf);
        }
        buf
    }

    /// Deserialize bitmaps written by [`Self::to_bytes`].
    ///
    /// Returns `None` if the data is truncated or names more than
    /// [`MAX_POOLS`] pools.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let (&count, mut rest) = data.split_first()?;
        if count as usize > MAX_POOLS {
            return None;
        }
        let mut pools = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (pool, tail) = GranuleBitmap::decode_from(rest)?;
            pools.push(pool);
            rest = tail;
        }
        Some(Self { pools })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use genstore_types::GenId;
    use proptest::prelude::*;

    use super::*;
    use crate::layout::GenerationBuilder;

    #[test]
    fn test_empty_bitmap() {
        let bm = GranuleBitmap::new();
        assert_eq!(bm.count(), 0);
        assert!(bm.set_ids().is_empty());
        assert!(!bm.is_set(0));
        assert!(!bm.is_set(999));
    }

    #[test]
    fn test_mark_and_check() {
        let mut bm = GranuleBitmap::new();
        for i in [0, 5, 63, 64, 200] {
            bm.mark(i);
        }
        assert!(bm.is_set(63));
        assert!(bm.is_set(64));
        assert!(!bm.is_set(62));
        assert!(!bm.is_set(199));
        assert_eq!(bm.count(), 5);
        assert_eq!(bm.set_ids(), vec![0, 5, 63, 64, 200]);
    }

    #[test]
    fn test_clear() {
        let mut bm = GranuleBitmap::new();
        bm.mark(10);
        bm.clear();
        assert_eq!(bm.count(), 0);
        assert!(!bm.is_set(10));
    }

    #[test]
    fn test_union_grows_shorter_side() {
        let mut a = PoolBitmaps::new(1);
        a.mark(0, 1);
        let mut b = PoolBitmaps::new(2);
        b.mark(1, 300);
        b.mark(0, 2);
        a.union_with(&b);
        assert_eq!(a.pool_count(), 2);
        assert!(a.is_set(0, 1));
        assert!(a.is_set(0, 2));
        assert!(a.is_set(1, 300));
        assert_eq!(a.count(), 3);
    }

    #[test]
    fn test_mark_item_and_range() {
        let img = GenerationBuilder::new(GenId(4)).pool(64, 8).pool(128, 4).build().unwrap();
        let header = img.header();
        let mut live = PoolBitmaps::for_header(header);

        assert!(live.mark_item(header, header.pools[1].granule_offset(2)));
        assert!(!live.mark_item(header, header.pools[1].granule_offset(2) + 8));
        assert!(live.is_set(1, 2));

        // 100 bytes from granule 1 of pool 0 spans granules 1 and 2
        live.mark_bytes(header, header.pools[0].granule_offset(1), 100);
        assert_eq!(live.pool(0).unwrap().set_ids(), vec![1, 2]);

        // ranges are clipped to their pool
        live.mark_bytes(header, header.pools[0].granule_offset(7), 1000);
        assert_eq!(live.pool(0).unwrap().set_ids(), vec![1, 2, 7]);
        assert_eq!(live.pool(1).unwrap().set_ids(), vec![2]);
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut live = PoolBitmaps::new(3);
        live.mark(0, 0);
        live.mark(0, 130);
        live.mark(2, 7);
        let restored = PoolBitmaps::from_bytes(&live.to_bytes()).unwrap();
        assert_eq!(restored, live);
        assert_eq!(PoolBitmaps::from_bytes(&PoolBitmaps::new(0).to_bytes()).unwrap().count(), 0);
    }

    #[test]
    fn test_from_bytes_invalid() {
        assert!(PoolBitmaps::from_bytes(&[]).is_none());
        // one pool claiming two words but carrying one
        let mut data = vec![1u8];
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 8]);
        assert!(PoolBitmaps::from_bytes(&data).is_none());
        // too many pools
        assert!(PoolBitmaps::from_bytes(&[9u8]).is_none());
    }

    proptest! {
        #[test]
        fn prop_set_ids_match_marks(mut ids in proptest::collection::vec(0u32..4096, 0..64)) {
            let mut bm = GranuleBitmap::new();
            for &i in &ids {
                bm.mark(i);
            }
            ids.sort_unstable();
            ids.dedup();
            prop_assert_eq!(bm.count(), ids.len());
            prop_assert_eq!(bm.set_ids(), ids);
        }
    }
}
