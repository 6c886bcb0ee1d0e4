//! Test configuration helpers.
//!
//! Centralizes the small budgets and block sizes tests run with, and
//! describes synthetic generations so integration tests and benches build
//! the same data.

use std::{path::Path, time::Duration};

use genstore_types::config::StoreConfig;

/// Returns a store configuration suitable for tests rooted at `root`.
///
/// - `memory_budget_bytes`: 4 MiB
/// - `read_ahead_headroom_bytes`: 0 (read-ahead whenever anything is free)
/// - `disk_block_size`: 512, `transfer_block_size`: 4096 (many batches per image)
/// - `io_retry_backoff`: zero (no sleeping in retry tests)
///
/// # Panics
///
/// Panics if the values fail validation, which would be a bug here.
#[must_use]
#[allow(clippy::expect_used)]
pub fn test_store_config(root: &Path) -> StoreConfig {
    StoreConfig::builder()
        .root_path(root.to_path_buf())
        .memory_budget_bytes(4 * 1024 * 1024)
        .read_ahead_headroom_bytes(0)
        .disk_block_size(512)
        .transfer_block_size(4096)
        .io_retry_limit(16)
        .io_retry_backoff(Duration::ZERO)
        .build()
        .expect("test store config is valid")
}

/// Shape of a synthetic data generation.
///
/// Item `i` carries [`Self::payload`]`(i)` and is live when
/// [`Self::is_live`]`(i)`; both are deterministic for a given seed.
#[derive(Debug, Clone, bon::Builder)]
pub struct SyntheticGen {
    /// Granule size of the single pool.
    #[builder(default = 256)]
    pub granule_size: u32,
    /// Granules in the pool.
    #[builder(default = 64)]
    pub granule_count: u32,
    /// Items to store.
    #[builder(default = 32)]
    pub items: usize,
    /// Payload length of every item.
    #[builder(default = 100)]
    pub payload_len: usize,
    /// Share of items that stay live, in percent.
    #[builder(default = 60)]
    pub live_percent: u8,
    /// Seed for payload bytes and liveness.
    #[builder(default = 0x5eed)]
    pub seed: u64,
}

impl SyntheticGen {
    /// Payload bytes of item `index`.
    pub fn payload(&self, index: usize) -> Vec<u8> {
        let mut state = self.mix(index as u64);
        (0..self.payload_len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 56) as u8
            })
            .collect()
    }

    /// Returns `true` if item `index` stays live.
    ///
    /// Exactly `items * live_percent / 100` items (rounded down) are live:
    /// the ones whose rank in a seeded permutation falls below that count.
    pub fn is_live(&self, index: usize) -> bool {
        let rank = self.rank(index);
        rank < self.live_count()
    }

    /// Number of live items.
    pub fn live_count(&self) -> usize {
        self.items * usize::from(self.live_percent.min(100)) / 100
    }

    fn rank(&self, index: usize) -> usize {
        let key = self.mix(index as u64);
        (0..self.items)
            .filter(|&j| {
                let other = self.mix(j as u64);
                other < key || (other == key && j < index)
            })
            .count()
    }

    fn mix(&self, value: u64) -> u64 {
        let mut z = value.wrapping_add(self.seed).wrapping_add(0x9e37_79b9_7f4a_7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }
}
