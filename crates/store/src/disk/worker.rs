//! The disk worker thread.

use std::{sync::Arc, time::Instant};

use parking_lot::{Condvar, Mutex};

use super::{
    io::GenFiles,
    job::{DiskJob, JobKind, JobOutput, JobTag},
    queue::JobQueue,
};
use crate::{
    compaction,
    error::{Error, Result},
    layout::GenImage,
};

/// State shared between the scheduler handle and its worker.
pub(crate) struct Shared {
    pub(crate) queue: Mutex<JobQueue>,
    pub(crate) wake: Condvar,
    pub(crate) files: GenFiles,
}

/// Runs jobs until a terminate job executes or the scheduler stops, then
/// cancels whatever is still queued.
pub(crate) fn run(shared: Arc<Shared>) {
    tracing::debug!(root = %shared.files.root().display(), "Disk worker started");
    loop {
        let next = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.is_stopped() {
                    break None;
                }
                if let Some(job) = queue.pop() {
                    break Some(job);
                }
                shared.wake.wait(&mut queue);
            }
        };
        let Some(mut queued) = next else { break };
        let (gen_id, tag, priority) = (queued.job.gen_id, queued.job.tag(), queued.job.priority);

        if queued.dead {
            tracing::debug!(gen_id = %gen_id, tag = %tag, job_id = queued.id, "Disk job cancelled");
            shared.queue.lock().finish();
            queued.job.complete(Err(Error::DiskTaskCancelled));
            continue;
        }

        let started = Instant::now();
        let result = execute(&shared, &queued.job);

        let mut queue = shared.queue.lock();
        if matches!(result, Err(Error::DiskTaskInterrupted)) && queue.should_redo() {
            tracing::debug!(gen_id = %gen_id, tag = %tag, priority, "Disk job preempted, re-queued");
            queue.requeue_front(queued);
            continue;
        }
        if tag == JobTag::Terminate {
            queue.stop();
        }
        queue.finish();
        drop(queue);

        match &result {
            Ok(_) => tracing::debug!(
                gen_id = %gen_id,
                tag = %tag,
                priority,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Disk job completed"
            ),
            Err(e) if e.is_cancellation() => {
                tracing::debug!(gen_id = %gen_id, tag = %tag, "Disk job interrupted");
            }
            Err(e) => tracing::error!(gen_id = %gen_id, tag = %tag, error = %e, "Disk job failed"),
        }
        queued.job.complete(result);
    }

    let leftovers = shared.queue.lock().drain();
    if !leftovers.is_empty() {
        tracing::debug!(count = leftovers.len(), "Cancelling queued disk jobs");
    }
    for mut queued in leftovers {
        queued.job.complete(Err(Error::DiskTaskCancelled));
    }
    tracing::debug!("Disk worker stopped");
}

fn execute(shared: &Shared, job: &DiskJob) -> Result<JobOutput> {
    let files = &shared.files;
    let gen_id = job.gen_id;
    let mut check = || shared.queue.lock().should_yield();

    match &job.kind {
        JobKind::Write { bytes } => {
            files.write_image(gen_id, bytes, &mut check).map(|bytes| JobOutput::Written { bytes })
        }
        JobKind::AllocWrite { provider } => {
            let bytes = provider()?;
            if bytes.is_empty() {
                return Err(Error::bad_parameter("alloc-write produced no bytes"));
            }
            files.write_image(gen_id, &bytes, &mut check).map(|bytes| JobOutput::Written { bytes })
        }
        JobKind::Read => {
            let bytes = files.read_image(gen_id, &mut check)?;
            GenImage::from_bytes(bytes).map(JobOutput::Read)
        }
        JobKind::Delete => files.delete(gen_id).map(|()| JobOutput::Deleted),
        JobKind::Compact { live, params } => {
            let bytes = files.read_image(gen_id, &mut check)?;
            let old_len = bytes.len() as u64;
            let compacted = compaction::compact(GenImage::from_bytes(bytes)?, live, params)?;
            if check() {
                return Err(Error::DiskTaskInterrupted);
            }
            let std_dev = compacted.header().std_dev_bytes;
            let new_len = files.write_image(gen_id, compacted.as_bytes(), &mut check)?;
            Ok(JobOutput::Compacted { old_len, new_len, std_dev })
        }
        JobKind::List => files.list(&mut check).map(JobOutput::Listed),
        JobKind::Wipe { keep } => files.wipe(keep).map(JobOutput::Wiped),
        JobKind::Terminate => Ok(JobOutput::Terminated),
    }
}
