//! Store root directories for tests.
//!
//! [`StoreDir`] is a temporary directory laid out the way the disk
//! scheduler expects: one `gNNNNNN` file per generation and `tid_` files
//! for writes in progress. Tests seed generation files, plant stale
//! temporaries and inspect what the scheduler left behind.

#![allow(clippy::expect_used)]

use std::{
    fs,
    path::{Path, PathBuf},
};

use genstore_types::GenId;
use tempfile::TempDir;

/// Prefix of in-progress write files.
const TEMP_PREFIX: &str = "tid_";

/// A temporary store root, removed on drop.
///
/// # Example
///
/// ```
/// use genstore_test_utils::StoreDir;
/// use genstore_types::GenId;
///
/// let dir = StoreDir::new();
/// dir.write_gen(GenId(5), b"image bytes");
/// assert_eq!(dir.gen_ids(), vec![GenId(5)]);
/// assert!(dir.gen_path(GenId(5)).ends_with("g000005"));
/// ```
pub struct StoreDir {
    root: TempDir,
}

impl StoreDir {
    /// Creates an empty store root.
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self { root: TempDir::new().expect("failed to create store root") }
    }

    /// The root to point `StoreConfig::root_path` at.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Path of the canonical file of `gen_id`.
    #[must_use]
    pub fn gen_path(&self, gen_id: GenId) -> PathBuf {
        self.root.path().join(format!("g{:06}", gen_id.0))
    }

    /// Writes `bytes` as the canonical file of `gen_id` and returns its path.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    pub fn write_gen(&self, gen_id: GenId, bytes: &[u8]) -> PathBuf {
        let path = self.gen_path(gen_id);
        fs::write(&path, bytes).expect("failed to write generation file");
        path
    }

    /// Leaves a stale in-progress write named `tid_<seq>` and returns its path.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    pub fn plant_temp(&self, seq: u64, bytes: &[u8]) -> PathBuf {
        let path = self.root.path().join(format!("{TEMP_PREFIX}{seq}"));
        fs::write(&path, bytes).expect("failed to write temp file");
        path
    }

    /// Generations with a canonical file, ascending.
    #[must_use]
    pub fn gen_ids(&self) -> Vec<GenId> {
        let mut ids: Vec<GenId> = self
            .names()
            .iter()
            .filter_map(|name| {
                let digits = name.strip_prefix('g').filter(|d| d.len() == 6)?;
                digits.parse::<u16>().ok().filter(|&id| id != 0).map(GenId)
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Names of in-progress write files still present.
    #[must_use]
    pub fn temp_files(&self) -> Vec<String> {
        self.names().into_iter().filter(|name| name.starts_with(TEMP_PREFIX)).collect()
    }

    fn names(&self) -> Vec<String> {
        fs::read_dir(self.root.path())
            .expect("failed to list store root")
            .filter_map(|entry| entry.ok()?.file_name().into_string().ok())
            .collect()
    }
}

impl Default for StoreDir {
    fn default() -> Self {
        Self::new()
    }
}
