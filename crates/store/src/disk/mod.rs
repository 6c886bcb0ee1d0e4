//! Asynchronous disk job scheduler.
//!
//! One worker thread performs all generation file I/O. Jobs are queued at
//! one of [`PRIORITY_LEVELS`] levels; the worker always takes the oldest
//! job of the most urgent non-empty level. Long jobs check between
//! transfer batches whether they were superseded or whether a more urgent
//! job is waiting, and in the latter case go back to the head of their
//! queue to be re-run later.
//!
//! ```text
//! submit ──► [admit: supersede / merge] ──► level 0 │ level 1 │ level 2
//!                                                   ▼
//!                                      worker: pop ─► run ─► callback
//! ```
//!
//! Callbacks run on the worker thread and must not block on the scheduler.

mod io;
mod job;
mod queue;
mod worker;

use std::{
    path::Path,
    sync::Arc,
    thread::{self, JoinHandle},
};

pub use io::{FileIo, OsFileIo, RetryPolicy, gen_file_name, is_temp_name, parse_gen_file_name};
pub use job::{
    Completion, DiskJob, GenFileInfo, ImageProvider, JobKind, JobOutcome, JobOutput, JobTag,
    PRIORITY_LEVELS,
};
use genstore_types::{GenId, config::StoreConfig};
use parking_lot::{Condvar, Mutex};

use self::{io::GenFiles, queue::JobQueue, worker::Shared};
use crate::{
    error::{Error, Result},
    layout::GenHeader,
};

/// Disk usage of the generation directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskStats {
    /// Generation files present.
    pub num_generations: usize,
    /// Sum of their lengths.
    pub used_bytes: u64,
}

/// Handle to the disk worker.
///
/// Dropping the scheduler stops the worker: the running job is interrupted
/// and every queued job is cancelled.
pub struct DiskScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DiskScheduler {
    /// Prepares the generation directory and starts the worker.
    ///
    /// Creates `root_path` if needed, removes leftover temporary files and,
    /// with `clear_on_start`, every generation file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] for an invalid configuration and
    /// [`Error::FileIo`] if the directory cannot be prepared.
    pub fn start(config: &StoreConfig) -> Result<Self> {
        Self::start_with_io(config, Arc::new(OsFileIo))
    }

    /// Like [`Self::start`] with a custom [`FileIo`] for data transfers.
    ///
    /// # Errors
    ///
    /// See [`Self::start`].
    pub fn start_with_io(config: &StoreConfig, io: Arc<dyn FileIo>) -> Result<Self> {
        config.validate().map_err(|e| Error::bad_parameter(e.to_string()))?;
        let files = GenFiles::new(config, io);
        files.prepare(config.clear_on_start)?;

        let shared =
            Arc::new(Shared { queue: Mutex::new(JobQueue::new()), wake: Condvar::new(), files });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("genstore-disk".into())
            .spawn(move || worker::run(worker_shared))?;

        tracing::info!(
            root = %config.root_path.display(),
            clear = config.clear_on_start,
            "Disk scheduler started"
        );
        Ok(Self { shared, worker: Mutex::new(Some(handle)) })
    }

    /// Queues a job.
    ///
    /// # Errors
    ///
    /// - [`Error::BadParameter`] if the job fails validation
    /// - [`Error::DiskIsNotOn`] once a terminate job has been accepted
    /// - [`Error::DiskTaskExists`] if an equivalent job already covers it
    ///
    /// A rejected job's callback is dropped without being called.
    pub fn submit(&self, job: DiskJob) -> Result<()> {
        job.validate()?;
        let mut queue = self.shared.queue.lock();
        queue.admit(job)?;
        drop(queue);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Queues a terminate job at `priority`.
    ///
    /// Jobs queued at more urgent levels still run; everything left when
    /// the terminate job executes is cancelled.
    ///
    /// # Errors
    ///
    /// Same as [`Self::submit`].
    pub fn terminate(&self, priority: u8) -> Result<()> {
        self.submit(DiskJob::terminate().priority(priority))
    }

    /// Waits for the worker to exit.
    ///
    /// Called from the worker itself (a callback dropping the last handle),
    /// it returns without waiting.
    pub fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("Disk worker panicked");
            }
        }
    }

    /// Returns `true` while jobs are being accepted.
    pub fn is_running(&self) -> bool {
        self.shared.queue.lock().is_accepting()
    }

    /// Directory holding the generation files.
    pub fn root_path(&self) -> &Path {
        self.shared.files.root()
    }

    /// Jobs waiting in the queues.
    pub fn queued_jobs(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Length of a generation's file; 0 when it has none.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileIo`] if the file cannot be inspected.
    pub fn generation_size(&self, gen_id: GenId) -> Result<u64> {
        self.shared.files.file_size(gen_id)
    }

    /// Header of a generation's file, if it has a non-empty one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileIo`] on read failure and [`Error::Corrupted`]
    /// if the header does not decode.
    pub fn generation_header(&self, gen_id: GenId) -> Result<Option<GenHeader>> {
        self.shared.files.read_header(gen_id)
    }

    /// Counts the generation files and their bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileIo`] if the directory cannot be read.
    pub fn statistics(&self) -> Result<DiskStats> {
        let files = &self.shared.files;
        let mut stats = DiskStats::default();
        for gen_id in files.gen_ids()? {
            stats.num_generations += 1;
            stats.used_bytes += files.file_size(gen_id)?;
        }
        Ok(stats)
    }

    /// Cancels every queued compact and alloc-write job; returns how many.
    pub fn remove_compact_tasks(&self) -> usize {
        let removed = self.shared.queue.lock().remove_compact_tasks();
        if removed > 0 {
            tracing::debug!(removed, "Removed queued compaction tasks");
        }
        removed
    }

    /// Compact jobs queued at `priority`.
    pub fn compact_tasks_count(&self, priority: u8) -> usize {
        self.shared.queue.lock().compact_tasks_count(priority)
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        self.shared.queue.lock().stop();
        self.shared.wake.notify_all();
        self.join();
    }
}

impl std::fmt::Debug for DiskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskScheduler")
            .field("root", &self.shared.files.root())
            .field("queued", &self.queued_jobs())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{sync::mpsc, time::Duration};

    use tempfile::tempdir;

    use super::*;
    use crate::layout::GenerationBuilder;

    fn config(root: &Path) -> StoreConfig {
        StoreConfig::builder()
            .root_path(root.to_path_buf())
            .memory_budget_bytes(1024 * 1024)
            .read_ahead_headroom_bytes(0)
            .io_retry_backoff(Duration::ZERO)
            .build()
            .unwrap()
    }

    fn outcome_channel() -> (mpsc::Sender<JobOutcome>, mpsc::Receiver<JobOutcome>) {
        mpsc::channel()
    }

    #[test]
    fn test_write_read_delete_cycle() {
        let dir = tempdir().unwrap();
        let scheduler = DiskScheduler::start(&config(dir.path())).unwrap();
        let image = GenerationBuilder::new(GenId(5)).pool(64, 16).build().unwrap();
        let (tx, rx) = outcome_channel();

        let t = tx.clone();
        scheduler
            .submit(DiskJob::write(GenId(5), image.as_bytes().to_vec()).on_complete(move |o| {
                t.send(o).unwrap();
            }))
            .unwrap();
        let written = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(written.result, Ok(JobOutput::Written { bytes }) if bytes == image.len() as u64));
        assert_eq!(scheduler.generation_size(GenId(5)).unwrap(), image.len() as u64);
        assert_eq!(scheduler.generation_header(GenId(5)).unwrap().unwrap(), *image.header());

        let t = tx.clone();
        scheduler.submit(DiskJob::read(GenId(5)).on_complete(move |o| t.send(o).unwrap())).unwrap();
        match rx.recv_timeout(Duration::from_secs(5)).unwrap().result {
            Ok(JobOutput::Read(read)) => assert_eq!(read, image),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let t = tx.clone();
        scheduler.submit(DiskJob::delete(GenId(5)).on_complete(move |o| t.send(o).unwrap())).unwrap();
        assert!(matches!(rx.recv_timeout(Duration::from_secs(5)).unwrap().result, Ok(JobOutput::Deleted)));
        assert_eq!(scheduler.generation_size(GenId(5)).unwrap(), 0);
        assert_eq!(scheduler.statistics().unwrap(), DiskStats::default());
    }

    #[test]
    fn test_submit_validation_is_synchronous() {
        let dir = tempdir().unwrap();
        let scheduler = DiskScheduler::start(&config(dir.path())).unwrap();
        assert!(matches!(
            scheduler.submit(DiskJob::read(GenId(2)).priority(7)),
            Err(Error::BadParameter { .. })
        ));
        assert!(matches!(scheduler.submit(DiskJob::read(GenId::NULL)), Err(Error::BadParameter { .. })));
    }

    #[test]
    fn test_terminate_stops_admission_and_worker() {
        let dir = tempdir().unwrap();
        let scheduler = DiskScheduler::start(&config(dir.path())).unwrap();
        let (tx, rx) = outcome_channel();
        scheduler
            .submit(DiskJob::terminate().priority(1).on_complete(move |o| tx.send(o).unwrap()))
            .unwrap();
        assert!(!scheduler.is_running());
        assert!(matches!(scheduler.submit(DiskJob::list()), Err(Error::DiskIsNotOn)));
        let done = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(done.result, Ok(JobOutput::Terminated)));
        scheduler.join();
    }

    #[test]
    fn test_read_of_missing_generation_fails_through_callback() {
        let dir = tempdir().unwrap();
        let scheduler = DiskScheduler::start(&config(dir.path())).unwrap();
        let (tx, rx) = outcome_channel();
        scheduler.submit(DiskJob::read(GenId(12)).on_complete(move |o| tx.send(o).unwrap())).unwrap();
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.gen_id, GenId(12));
        assert!(matches!(outcome.result, Err(Error::FileIo { .. })));
    }

    #[test]
    fn test_start_clears_generations_when_asked() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("g000004"), [0u8; 512]).unwrap();
        std::fs::write(dir.path().join("tid_0"), [0u8; 8]).unwrap();

        let scheduler = DiskScheduler::start(&config(dir.path())).unwrap();
        assert_eq!(scheduler.statistics().unwrap(), DiskStats { num_generations: 1, used_bytes: 512 });
        assert!(!dir.path().join("tid_0").exists());
        drop(scheduler);

        let mut cfg = config(dir.path());
        cfg.clear_on_start = true;
        let scheduler = DiskScheduler::start(&cfg).unwrap();
        assert_eq!(scheduler.statistics().unwrap().num_generations, 0);
    }
}
