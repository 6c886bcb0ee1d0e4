//! Generation files: naming, positional I/O with retry, atomic replacement.
//!
//! Every generation lives in `<root>/gNNNNNN`. Writes land in a
//! `tid_<n>` temporary first, which is truncated to length, synced and
//! renamed over the canonical name, so a reader never sees a partial image.

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::{
    collections::BTreeSet,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use genstore_types::{GenId, config::StoreConfig};

use super::job::GenFileInfo;
use crate::{
    error::{Error, Result},
    layout::{GenHeader, HEADER_SIZE},
};

/// Prefix of temporary files.
pub const TEMP_PREFIX: &str = "tid_";

/// Canonical file name of a generation: `g` plus six decimal digits.
pub fn gen_file_name(gen_id: GenId) -> String {
    format!("g{:06}", gen_id.0)
}

/// Generation named by a canonical file name.
pub fn parse_gen_file_name(name: &str) -> Option<GenId> {
    let digits = name.strip_prefix('g')?;
    if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let id: u16 = digits.parse().ok()?;
    (id != 0).then_some(GenId(id))
}

/// Returns `true` for names of temporary write files.
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX)
}

/// Positional file access.
///
/// The scheduler goes through this trait for every data transfer so tests
/// can inject short transfers and failures.
pub trait FileIo: Send + Sync {
    /// Reads into `buf` at `offset`, returning the bytes read.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn read_at(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Writes `buf` at `offset`, returning the bytes written.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn write_at(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<usize>;
}

/// [`FileIo`] backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileIo;

impl FileIo for OsFileIo {
    #[cfg(unix)]
    fn read_at(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        FileExt::read_at(file, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        file.seek_read(buf, offset)
    }

    #[cfg(unix)]
    fn write_at(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
        FileExt::write_at(file, buf, offset)
    }

    #[cfg(windows)]
    fn write_at(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
        file.seek_write(buf, offset)
    }
}

/// Bound on retries of partial or interrupted transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed beyond the first.
    pub limit: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Policy from the store configuration.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self { limit: config.io_retry_limit, backoff: config.io_retry_backoff }
    }
}

/// Outcome of a between-batches check.
pub(crate) type YieldCheck<'a> = &'a mut dyn FnMut() -> bool;

fn file_error(path: &Path, offset: u64, source: io::Error) -> Error {
    Error::FileIo { path: path.to_path_buf(), offset, source }
}

/// Access to the generation files under one directory.
pub(crate) struct GenFiles {
    root: PathBuf,
    io: Arc<dyn FileIo>,
    retry: RetryPolicy,
    transfer_block: usize,
    temp_seq: AtomicU64,
}

impl GenFiles {
    pub(crate) fn new(config: &StoreConfig, io: Arc<dyn FileIo>) -> Self {
        Self {
            root: config.root_path.clone(),
            io,
            retry: RetryPolicy::from_config(config),
            transfer_block: config.transfer_block_size.max(1),
            temp_seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn path_of(&self, gen_id: GenId) -> PathBuf {
        self.root.join(gen_file_name(gen_id))
    }

    /// Creates the directory and removes leftover temporary files.
    ///
    /// With `clear`, every generation file is removed too.
    pub(crate) fn prepare(&self, clear: bool) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| file_error(&self.root, 0, e))?;
        for entry in fs::read_dir(&self.root).map_err(|e| file_error(&self.root, 0, e))? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let stale = is_temp_name(name) || (clear && parse_gen_file_name(name).is_some());
            if stale {
                let path = entry.path();
                fs::remove_file(&path).map_err(|e| file_error(&path, 0, e))?;
                tracing::debug!(file = %path.display(), "Removed stale file");
            }
        }
        Ok(())
    }

    /// Ids of every generation file, ascending.
    pub(crate) fn gen_ids(&self) -> Result<Vec<GenId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| file_error(&self.root, 0, e))? {
            let entry = entry?;
            if let Some(gen_id) = entry.file_name().to_str().and_then(parse_gen_file_name) {
                ids.push(gen_id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// File length, 0 when the file does not exist.
    pub(crate) fn file_size(&self, gen_id: GenId) -> Result<u64> {
        let path = self.path_of(gen_id);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(file_error(&path, 0, e)),
        }
    }

    fn read_exact(&self, file: &File, path: &Path, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut done = 0;
        let mut retries = 0u32;
        while done < buf.len() {
            let at = offset + done as u64;
            match self.io.read_at(file, &mut buf[done..], at) {
                Ok(0) => {
                    return Err(file_error(
                        path,
                        at,
                        io::Error::new(io::ErrorKind::UnexpectedEof, "file ended early"),
                    ));
                }
                Ok(n) => {
                    done += n;
                    if done < buf.len() {
                        self.backoff(&mut retries, path, at, "short read")?;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.backoff(&mut retries, path, at, "interrupted read")?;
                }
                Err(e) => return Err(file_error(path, at, e)),
            }
        }
        Ok(())
    }

    fn write_all(&self, file: &File, path: &Path, data: &[u8], offset: u64) -> Result<()> {
        let mut done = 0;
        let mut retries = 0u32;
        while done < data.len() {
            let at = offset + done as u64;
            match self.io.write_at(file, &data[done..], at) {
                Ok(0) => {
                    return Err(file_error(
                        path,
                        at,
                        io::Error::new(io::ErrorKind::WriteZero, "no bytes written"),
                    ));
                }
                Ok(n) => {
                    done += n;
                    if done < data.len() {
                        self.backoff(&mut retries, path, at, "short write")?;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.backoff(&mut retries, path, at, "interrupted write")?;
                }
                Err(e) => return Err(file_error(path, at, e)),
            }
        }
        Ok(())
    }

    fn backoff(&self, retries: &mut u32, path: &Path, offset: u64, what: &str) -> Result<()> {
        *retries += 1;
        if *retries > self.retry.limit {
            return Err(file_error(
                path,
                offset,
                io::Error::new(io::ErrorKind::TimedOut, format!("{what}: retry limit reached")),
            ));
        }
        tracing::trace!(file = %path.display(), offset, retries = *retries, "{what}, retrying");
        if !self.retry.backoff.is_zero() {
            std::thread::sleep(self.retry.backoff);
        }
        Ok(())
    }

    /// Reads a whole generation file in transfer-sized batches.
    ///
    /// `check` runs between batches; returning `true` stops the read with
    /// [`Error::DiskTaskInterrupted`].
    pub(crate) fn read_image(&self, gen_id: GenId, check: YieldCheck<'_>) -> Result<Vec<u8>> {
        let path = self.path_of(gen_id);
        let file = File::open(&path).map_err(|e| file_error(&path, 0, e))?;
        let len = file.metadata().map_err(|e| file_error(&path, 0, e))?.len();
        let len = usize::try_from(len).map_err(|_| Error::corrupted("generation file too large"))?;
        let mut buf = vec![0u8; len];
        let mut at = 0;
        while at < len {
            if at > 0 && check() {
                return Err(Error::DiskTaskInterrupted);
            }
            let end = (at + self.transfer_block).min(len);
            self.read_exact(&file, &path, &mut buf[at..end], at as u64)?;
            at = end;
        }
        Ok(buf)
    }

    /// Reads and decodes the header of a generation file.
    pub(crate) fn read_header(&self, gen_id: GenId) -> Result<Option<GenHeader>> {
        let path = self.path_of(gen_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(file_error(&path, 0, e)),
        };
        let len = file.metadata().map_err(|e| file_error(&path, 0, e))?.len();
        if len == 0 {
            return Ok(None);
        }
        if len < HEADER_SIZE as u64 {
            return Err(Error::corrupted(format!(
                "{}: {len} bytes cannot hold a header",
                path.display()
            )));
        }
        let mut buf = vec![0u8; HEADER_SIZE];
        self.read_exact(&file, &path, &mut buf, 0)?;
        GenHeader::decode(&buf).map(Some)
    }

    /// Writes `data` as the image of `gen_id` through a temporary file.
    ///
    /// On interruption or failure the temporary file is removed and the
    /// canonical file is left as it was.
    pub(crate) fn write_image(&self, gen_id: GenId, data: &[u8], check: YieldCheck<'_>) -> Result<u64> {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        let temp = self.root.join(format!("{TEMP_PREFIX}{seq}"));
        let result = self.write_temp(&temp, data, check).and_then(|()| {
            let target = self.path_of(gen_id);
            fs::rename(&temp, &target).map_err(|e| file_error(&target, 0, e))?;
            self.sync_dir()
        });
        if result.is_err() {
            // Best effort; the next start removes leftovers anyway.
            let _ = fs::remove_file(&temp);
        }
        result.map(|()| data.len() as u64)
    }

    fn write_temp(&self, temp: &Path, data: &[u8], check: YieldCheck<'_>) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp)
            .map_err(|e| file_error(temp, 0, e))?;
        let mut at = 0;
        while at < data.len() {
            if at > 0 && check() {
                return Err(Error::DiskTaskInterrupted);
            }
            let end = (at + self.transfer_block).min(data.len());
            self.write_all(&file, temp, &data[at..end], at as u64)?;
            at = end;
        }
        file.set_len(data.len() as u64).map_err(|e| file_error(temp, data.len() as u64, e))?;
        file.sync_all().map_err(|e| file_error(temp, 0, e))?;
        Ok(())
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> Result<()> {
        let dir = File::open(&self.root).map_err(|e| file_error(&self.root, 0, e))?;
        dir.sync_all().map_err(|e| file_error(&self.root, 0, e))
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<()> {
        Ok(())
    }

    /// Removes the file of `gen_id`. A missing file is not an error.
    pub(crate) fn delete(&self, gen_id: GenId) -> Result<()> {
        let path = self.path_of(gen_id);
        match fs::remove_file(&path) {
            Ok(()) => self.sync_dir(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(file_error(&path, 0, e)),
        }
    }

    /// Headers of every non-empty generation file.
    pub(crate) fn list(&self, check: YieldCheck<'_>) -> Result<Vec<GenFileInfo>> {
        let mut infos = Vec::new();
        for gen_id in self.gen_ids()? {
            if !infos.is_empty() && check() {
                return Err(Error::DiskTaskInterrupted);
            }
            let file_size = self.file_size(gen_id)?;
            if let Some(header) = self.read_header(gen_id)? {
                infos.push(GenFileInfo { gen_id, file_size, header });
            }
        }
        Ok(infos)
    }

    /// Removes every generation file not in `keep`.
    pub(crate) fn wipe(&self, keep: &BTreeSet<GenId>) -> Result<Vec<GenId>> {
        let mut removed = Vec::new();
        for gen_id in self.gen_ids()? {
            if keep.contains(&gen_id) {
                continue;
            }
            self.delete(gen_id)?;
            tracing::info!(gen_id = %gen_id, "Removed orphan generation file");
            removed.push(gen_id);
        }
        Ok(removed)
    }
}
