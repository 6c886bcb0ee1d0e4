//! Priority job queues with superseding rules.
//!
//! All state lives behind the scheduler's submission lock. Jobs that lose
//! to a newer submission are flagged dead and left in place; the worker
//! pops them like any other job and reports them cancelled.

use std::collections::VecDeque;

use genstore_types::GenId;

use super::job::{DiskJob, JobKind, JobTag, PRIORITY_LEVELS};
use crate::error::{Error, Result};

/// A job waiting in (or popped from) a priority queue.
#[derive(Debug)]
pub(crate) struct QueuedJob {
    pub(crate) id: u64,
    pub(crate) job: DiskJob,
    pub(crate) dead: bool,
}

/// What the queue remembers about the job the worker is running.
#[derive(Debug, Clone, Copy)]
struct RunningSlot {
    id: u64,
    gen_id: GenId,
    tag: JobTag,
    priority: u8,
    dead: bool,
}

/// FIFO queue per priority level plus the running slot.
#[derive(Debug)]
pub(crate) struct JobQueue {
    levels: [VecDeque<QueuedJob>; PRIORITY_LEVELS as usize],
    running: Option<RunningSlot>,
    accepting: bool,
    stopped: bool,
    next_id: u64,
}

impl JobQueue {
    pub(crate) fn new() -> Self {
        Self {
            levels: Default::default(),
            running: None,
            accepting: true,
            stopped: false,
            next_id: 1,
        }
    }

    /// Queues a validated job, applying the superseding rules.
    ///
    /// Returns the id assigned to the job.
    pub(crate) fn admit(&mut self, mut job: DiskJob) -> Result<u64> {
        if !self.accepting {
            return Err(Error::DiskIsNotOn);
        }
        let gen_id = job.gen_id;
        match job.tag() {
            JobTag::AllocWrite => {
                if self.running.is_some_and(|r| {
                    r.tag == JobTag::AllocWrite && r.gen_id == gen_id && !r.dead
                }) {
                    return Err(Error::DiskTaskExists { gen_id });
                }
                for queued in self.queued_mut().filter(|q| {
                    !q.dead && q.job.tag() == JobTag::AllocWrite && q.job.gen_id == gen_id
                }) {
                    queued.dead = true;
                    tracing::debug!(gen_id = %gen_id, job_id = queued.id, "Superseded queued alloc-write");
                }
            }
            JobTag::Compact => {
                let priority = job.priority;
                let existing = self.queued_mut().find(|q| {
                    !q.dead && q.job.tag() == JobTag::Compact && q.job.gen_id == gen_id
                });
                if let Some(old) = existing {
                    let (JobKind::Compact { live: old_live, .. }, JobKind::Compact { live: new_live, .. }) =
                        (&mut old.job.kind, &mut job.kind)
                    else {
                        return Err(Error::bad_parameter("compact job without bitmaps"));
                    };
                    if priority < old.job.priority {
                        new_live.union_with(old_live);
                        old.dead = true;
                        tracing::debug!(
                            gen_id = %gen_id,
                            job_id = old.id,
                            priority,
                            "Compact job absorbed by a more urgent one"
                        );
                    } else {
                        old_live.union_with(new_live);
                        tracing::debug!(gen_id = %gen_id, job_id = old.id, "Merged compact bitmaps");
                        return Err(Error::DiskTaskExists { gen_id });
                    }
                }
            }
            JobTag::Delete => {
                for queued in self.queued_mut().filter(|q| !q.dead && q.job.gen_id == gen_id) {
                    queued.dead = true;
                }
                if let Some(running) = self.running.as_mut().filter(|r| r.gen_id == gen_id) {
                    running.dead = true;
                }
            }
            JobTag::Terminate => {
                for queued in self.queued_mut().filter(|q| {
                    !q.dead && (q.job.tag() == JobTag::Terminate || q.job.cancel_on_terminate)
                }) {
                    queued.dead = true;
                }
                self.accepting = false;
            }
            JobTag::Write | JobTag::Read | JobTag::List | JobTag::Wipe => {}
        }

        let id = self.next_id;
        self.next_id += 1;
        tracing::debug!(
            gen_id = %gen_id,
            job_id = id,
            tag = %job.tag(),
            priority = job.priority,
            "Disk job queued"
        );
        self.levels[job.priority as usize].push_back(QueuedJob { id, job, dead: false });
        Ok(id)
    }

    fn queued_mut(&mut self) -> impl Iterator<Item = &mut QueuedJob> {
        self.levels.iter_mut().flat_map(|level| level.iter_mut())
    }

    /// Takes the oldest job of the most urgent non-empty level and marks it running.
    pub(crate) fn pop(&mut self) -> Option<QueuedJob> {
        let queued = self.levels.iter_mut().find_map(VecDeque::pop_front)?;
        self.running = Some(RunningSlot {
            id: queued.id,
            gen_id: queued.job.gen_id,
            tag: queued.job.tag(),
            priority: queued.job.priority,
            dead: queued.dead,
        });
        Some(queued)
    }

    /// Puts a preempted job back at the head of its level.
    pub(crate) fn requeue_front(&mut self, queued: QueuedJob) {
        self.running = None;
        let level = queued.job.priority as usize;
        self.levels[level].push_front(queued);
    }

    /// Clears the running slot.
    pub(crate) fn finish(&mut self) {
        self.running = None;
    }

    /// Returns `true` if a live job more urgent than `priority` is waiting.
    pub(crate) fn higher_waiting(&self, priority: u8) -> bool {
        self.levels[..priority as usize].iter().any(|level| level.iter().any(|q| !q.dead))
    }

    /// Returns `true` when the running job should stop at its next batch boundary.
    pub(crate) fn should_yield(&self) -> bool {
        match self.running {
            Some(r) => self.stopped || r.dead || self.higher_waiting(r.priority),
            None => self.stopped,
        }
    }

    /// Returns `true` when an interrupted running job should be re-run
    /// instead of reported.
    pub(crate) fn should_redo(&self) -> bool {
        self.running.is_some_and(|r| {
            self.accepting && !self.stopped && !r.dead && self.higher_waiting(r.priority)
        })
    }

    /// Returns `true` if the running job has been flagged dead.
    pub(crate) fn running_dead(&self) -> bool {
        self.running.is_some_and(|r| r.dead)
    }

    /// Id of the running job.
    pub(crate) fn running_id(&self) -> Option<u64> {
        self.running.map(|r| r.id)
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Closes admission and tells the worker to exit.
    pub(crate) fn stop(&mut self) {
        self.accepting = false;
        self.stopped = true;
    }

    /// Removes every queued job.
    pub(crate) fn drain(&mut self) -> Vec<QueuedJob> {
        self.levels.iter_mut().flat_map(|level| level.drain(..)).collect()
    }

    /// Flags queued compact and alloc-write jobs dead; returns how many.
    pub(crate) fn remove_compact_tasks(&mut self) -> usize {
        let mut removed = 0;
        for queued in self.queued_mut().filter(|q| {
            !q.dead && matches!(q.job.tag(), JobTag::Compact | JobTag::AllocWrite)
        }) {
            queued.dead = true;
            removed += 1;
        }
        removed
    }

    /// Live compact jobs queued at `priority`.
    pub(crate) fn compact_tasks_count(&self, priority: u8) -> usize {
        self.levels
            .get(priority as usize)
            .map_or(0, |level| {
                level.iter().filter(|q| !q.dead && q.job.tag() == JobTag::Compact).count()
            })
    }

    /// Queued jobs, dead ones included.
    pub(crate) fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }
}
