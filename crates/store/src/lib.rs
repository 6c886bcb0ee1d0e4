//! genstore: a generation-based, handle-addressed record store.
//!
//! Records live in generations: self-describing byte images made of
//! granule pools. A 64-bit [`Handle`] names a generation and an offset in
//! it. Generations can be offloaded to disk, compacted to their live items
//! and read back during recovery under a memory budget.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Recovery                     │
//! │  (start, iterate generations/records/refs)  │
//! └──────────┬───────────────────┬──────────────┘
//!            │                   │
//! ┌──────────▼─────────┐ ┌───────▼──────────────┐
//! │   Generation cache  │ │    Disk scheduler    │
//! │  (budget, residency,│ │ (priorities, retry,  │
//! │   granule maps)     │ │  supersede, wipe)    │
//! └──────────┬─────────┘ └───────┬──────────────┘
//!            │                   │
//! ┌──────────▼───────────────────▼──────────────┐
//! │        Compaction (deflate / reflate)        │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │      Layout (header, descriptors, items)     │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use genstore::{DiskScheduler, Recovery, layout::DataType};
//! use genstore_types::config::StoreConfig;
//!
//! # fn demo(mgmt: genstore::GenImage) -> Result<(), Box<dyn std::error::Error>> {
//! let config = StoreConfig::builder().root_path("/var/lib/genstore".into()).build()?;
//! let disk = Arc::new(DiskScheduler::start(&config)?);
//! let recovery = Recovery::init(&config, disk, mgmt, Vec::new())?;
//! recovery.start()?;
//!
//! let mut gens = None;
//! let mut buf = vec![0u8; 64 * 1024];
//! while let Ok(gen_id) = recovery.next_generation(&mut gens) {
//!     let mut records = None;
//!     while let Ok(info) = recovery.next_record(&mut records, DataType::MESSAGE, gen_id, &mut buf) {
//!         println!("{}: {} bytes", info.handle, info.data_len);
//!     }
//!     recovery.compact_generation(gen_id).ok();
//! }
//! recovery.terminate();
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
// Test code style - allow field reassignment after default
#![cfg_attr(test, allow(clippy::field_reassign_with_default))]
// Granule arithmetic uses explicit bounds checking for clarity
#![allow(clippy::manual_range_contains)]

pub mod bitmap;
pub mod cache;
pub mod compaction;
pub mod disk;
pub mod error;
pub mod layout;
pub mod recovery;

// Re-export commonly used types
pub use bitmap::{GranuleBitmap, PoolBitmaps};
pub use cache::{CacheStats, GenCache, Residency};
pub use compaction::{CompactionParams, ItemContent};
pub use disk::{DiskJob, DiskScheduler, FileIo, JobOutcome, JobOutput, OsFileIo};
pub use error::{Error, ErrorKind, Result};
pub use genstore_types::{GenId, Handle};
pub use layout::{DataType, GenHeader, GenImage, GenMap};
pub use recovery::{Phase, Recovery};

/// Generation image format version.
pub const VERSION: u16 = layout::FORMAT_VERSION;
