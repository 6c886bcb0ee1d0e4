//! Disk jobs and their outcomes.
//!
//! A [`DiskJob`] names a generation, an operation and a completion callback.
//! The callback runs on the worker thread exactly once for every accepted
//! job, with the outcome of the run or the reason it did not run.

use std::{collections::BTreeSet, fmt, sync::Arc};

use genstore_types::GenId;

use crate::{
    bitmap::PoolBitmaps,
    compaction::CompactionParams,
    error::{Error, Result},
    layout::{GenHeader, GenImage},
};

/// Number of priority levels; 0 is the most urgent.
pub const PRIORITY_LEVELS: u8 = 3;

/// Completion callback of a job.
pub type Completion = Box<dyn FnOnce(JobOutcome) + Send>;

/// Produces the bytes of an alloc-write job when the worker gets to it.
///
/// Called again if the job is preempted and re-run.
pub type ImageProvider = Box<dyn Fn() -> Result<Vec<u8>> + Send>;

/// What a job does.
pub enum JobKind {
    /// Persist a caller-provided image.
    Write {
        /// Image bytes, written as-is.
        bytes: Arc<[u8]>,
    },
    /// Persist an image produced at execution time.
    AllocWrite {
        /// Source of the image bytes.
        provider: ImageProvider,
    },
    /// Read a whole generation file.
    Read,
    /// Remove a generation file.
    Delete,
    /// Compact a generation file in place.
    Compact {
        /// Granules to keep.
        live: PoolBitmaps,
        /// Compaction knobs.
        params: CompactionParams,
    },
    /// Read the header of every generation file.
    List,
    /// Remove every generation file not in `keep`.
    Wipe {
        /// Generations to leave alone.
        keep: BTreeSet<GenId>,
    },
    /// Stop the worker.
    Terminate,
}

impl JobKind {
    /// Tag naming this kind.
    pub fn tag(&self) -> JobTag {
        match self {
            JobKind::Write { .. } => JobTag::Write,
            JobKind::AllocWrite { .. } => JobTag::AllocWrite,
            JobKind::Read => JobTag::Read,
            JobKind::Delete => JobTag::Delete,
            JobKind::Compact { .. } => JobTag::Compact,
            JobKind::List => JobTag::List,
            JobKind::Wipe { .. } => JobTag::Wipe,
            JobKind::Terminate => JobTag::Terminate,
        }
    }
}

impl fmt::Debug for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Write { bytes } => f.debug_struct("Write").field("len", &bytes.len()).finish(),
            JobKind::Compact { live, params } => f
                .debug_struct("Compact")
                .field("live", &live.count())
                .field("params", params)
                .finish(),
            JobKind::Wipe { keep } => f.debug_struct("Wipe").field("keep", keep).finish(),
            other => write!(f, "{}", other.tag()),
        }
    }
}

/// Fieldless name of a [`JobKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobTag {
    /// [`JobKind::Write`]
    Write,
    /// [`JobKind::AllocWrite`]
    AllocWrite,
    /// [`JobKind::Read`]
    Read,
    /// [`JobKind::Delete`]
    Delete,
    /// [`JobKind::Compact`]
    Compact,
    /// [`JobKind::List`]
    List,
    /// [`JobKind::Wipe`]
    Wipe,
    /// [`JobKind::Terminate`]
    Terminate,
}

impl JobTag {
    /// Returns `true` for jobs that target one generation.
    pub fn targets_generation(self) -> bool {
        matches!(
            self,
            JobTag::Write | JobTag::AllocWrite | JobTag::Read | JobTag::Delete | JobTag::Compact
        )
    }
}

impl fmt::Display for JobTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobTag::Write => "write",
            JobTag::AllocWrite => "alloc-write",
            JobTag::Read => "read",
            JobTag::Delete => "delete",
            JobTag::Compact => "compact",
            JobTag::List => "list",
            JobTag::Wipe => "wipe",
            JobTag::Terminate => "terminate",
        };
        f.write_str(name)
    }
}

/// A header found by a list job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenFileInfo {
    /// Generation named by the file.
    pub gen_id: GenId,
    /// File length in bytes.
    pub file_size: u64,
    /// Decoded header.
    pub header: GenHeader,
}

/// Result payload of a successful job.
#[derive(Debug)]
pub enum JobOutput {
    /// The image is durable under its canonical name.
    Written {
        /// Bytes written.
        bytes: u64,
    },
    /// The generation image read from disk.
    Read(GenImage),
    /// The file is gone.
    Deleted,
    /// The file was compacted.
    Compacted {
        /// File length before.
        old_len: u64,
        /// File length after.
        new_len: u64,
        /// Chain-size standard deviation of the new image.
        std_dev: u64,
    },
    /// Headers of every generation file, by ascending id.
    Listed(Vec<GenFileInfo>),
    /// Generations whose files were removed.
    Wiped(Vec<GenId>),
    /// The worker has stopped.
    Terminated,
}

/// Delivered to a job's callback.
#[derive(Debug)]
pub struct JobOutcome {
    /// Target generation ([`GenId::NULL`] for list, wipe and terminate).
    pub gen_id: GenId,
    /// Kind of job.
    pub tag: JobTag,
    /// What happened.
    pub result: Result<JobOutput>,
}

/// One unit of work for the disk scheduler.
///
/// # Example
///
/// ```no_run
/// # use genstore::disk::{DiskJob, DiskScheduler};
/// # use genstore_types::GenId;
/// # fn demo(scheduler: &DiskScheduler) -> genstore::Result<()> {
/// scheduler.submit(
///     DiskJob::read(GenId(5))
///         .priority(1)
///         .cancel_on_terminate(true)
///         .on_complete(|outcome| println!("{:?}", outcome.result.is_ok())),
/// )?;
/// # Ok(())
/// # }
/// ```
pub struct DiskJob {
    pub(crate) gen_id: GenId,
    pub(crate) kind: JobKind,
    pub(crate) priority: u8,
    pub(crate) cancel_on_terminate: bool,
    pub(crate) callback: Option<Completion>,
}

impl DiskJob {
    fn new(gen_id: GenId, kind: JobKind) -> Self {
        Self { gen_id, kind, priority: 0, cancel_on_terminate: false, callback: None }
    }

    /// Writes `bytes` as the image of `gen_id`.
    pub fn write(gen_id: GenId, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::new(gen_id, JobKind::Write { bytes: bytes.into() })
    }

    /// Writes the image `provider` returns when the job runs.
    pub fn alloc_write(
        gen_id: GenId,
        provider: impl Fn() -> Result<Vec<u8>> + Send + 'static,
    ) -> Self {
        Self::new(gen_id, JobKind::AllocWrite { provider: Box::new(provider) })
    }

    /// Reads the image of `gen_id`.
    pub fn read(gen_id: GenId) -> Self {
        Self::new(gen_id, JobKind::Read)
    }

    /// Deletes the file of `gen_id`.
    pub fn delete(gen_id: GenId) -> Self {
        Self::new(gen_id, JobKind::Delete)
    }

    /// Compacts the file of `gen_id`, keeping the granules set in `live`.
    pub fn compact(gen_id: GenId, live: PoolBitmaps, params: CompactionParams) -> Self {
        Self::new(gen_id, JobKind::Compact { live, params })
    }

    /// Lists the headers of every generation file.
    pub fn list() -> Self {
        Self::new(GenId::NULL, JobKind::List)
    }

    /// Deletes every generation file whose id is not in `keep`.
    pub fn wipe(keep: BTreeSet<GenId>) -> Self {
        Self::new(GenId::NULL, JobKind::Wipe { keep })
    }

    /// Stops the worker once every more urgent job has run.
    pub fn terminate() -> Self {
        Self::new(GenId::NULL, JobKind::Terminate)
    }

    /// Sets the priority (0 is the most urgent).
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Cancel the job if a terminate job is accepted while it is queued.
    pub fn cancel_on_terminate(mut self, cancel: bool) -> Self {
        self.cancel_on_terminate = cancel;
        self
    }

    /// Sets the completion callback.
    pub fn on_complete(mut self, callback: impl FnOnce(JobOutcome) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Target generation.
    pub fn gen_id(&self) -> GenId {
        self.gen_id
    }

    /// Kind of job.
    pub fn tag(&self) -> JobTag {
        self.kind.tag()
    }

    /// Priority level.
    pub fn priority_level(&self) -> u8 {
        self.priority
    }

    /// Checks the job before it is queued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] for a priority outside
    /// `0..PRIORITY_LEVELS`, a null generation on a generation job, an
    /// empty write buffer or compact bitmaps without pools.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.priority >= PRIORITY_LEVELS {
            return Err(Error::bad_parameter(format!(
                "priority {} outside 0..{PRIORITY_LEVELS}",
                self.priority
            )));
        }
        if self.tag().targets_generation() && self.gen_id.is_null() {
            return Err(Error::bad_parameter(format!("{} job needs a generation id", self.tag())));
        }
        match &self.kind {
            JobKind::Write { bytes } if bytes.is_empty() => {
                Err(Error::bad_parameter("write job with an empty buffer"))
            }
            JobKind::Compact { live, .. } if live.pool_count() == 0 => {
                Err(Error::bad_parameter("compact job without live bitmaps"))
            }
            _ => Ok(()),
        }
    }

    /// Hands `result` to the callback, if any.
    pub(crate) fn complete(&mut self, result: Result<JobOutput>) {
        if let Some(callback) = self.callback.take() {
            callback(JobOutcome { gen_id: self.gen_id, tag: self.tag(), result });
        }
    }
}

impl fmt::Debug for DiskJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskJob")
            .field("gen_id", &self.gen_id)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("cancel_on_terminate", &self.cancel_on_terminate)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn test_validate_priority() {
        assert!(DiskJob::read(GenId(3)).priority(2).validate().is_ok());
        let err = DiskJob::read(GenId(3)).priority(3).validate().unwrap_err();
        assert!(matches!(err, Error::BadParameter { .. }));
    }

    #[test]
    fn test_validate_generation_jobs_need_an_id() {
        assert!(DiskJob::read(GenId::NULL).validate().is_err());
        assert!(DiskJob::delete(GenId::NULL).validate().is_err());
        assert!(DiskJob::list().validate().is_ok());
        assert!(DiskJob::terminate().validate().is_ok());
        assert!(DiskJob::wipe(BTreeSet::new()).validate().is_ok());
    }

    #[test]
    fn test_validate_buffers() {
        assert!(DiskJob::write(GenId(2), Vec::new()).validate().is_err());
        assert!(DiskJob::write(GenId(2), vec![1u8]).validate().is_ok());
        let params = CompactionParams::default();
        assert!(DiskJob::compact(GenId(2), PoolBitmaps::new(0), params).validate().is_err());
        assert!(DiskJob::compact(GenId(2), PoolBitmaps::new(2), params).validate().is_ok());
    }

    #[test]
    fn test_complete_runs_callback_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut job = DiskJob::delete(GenId(8))
            .on_complete(move |o| sink.lock().push((o.gen_id, o.tag, o.result.is_ok())));
        job.complete(Ok(JobOutput::Deleted));
        job.complete(Err(Error::DiskTaskCancelled));
        assert_eq!(*seen.lock(), vec![(GenId(8), JobTag::Delete, true)]);
    }

    #[test]
    fn test_tag_display() {
        assert_eq!(JobTag::AllocWrite.to_string(), "alloc-write");
        assert_eq!(DiskJob::list().tag().to_string(), "list");
        assert!(!JobTag::Wipe.targets_generation());
        assert!(JobTag::Compact.targets_generation());
    }
}
