//! I/O fault injection for disk scheduler tests.
//!
//! An [`IoFaultInjector`] decides, transfer by transfer, whether a read or
//! write should be shortened, interrupted or failed. Tests wrap the real
//! file I/O in an adapter that consults the injector before each call:
//!
//! ```text
//! worker ──► adapter ──► injector.on_write(len) ──► Pass | Short(n) | Interrupt | Fail
//!                 │
//!                 └──► real write_at (with len or n)
//! ```
//!
//! The injector starts disarmed so setup I/O runs untouched.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

/// Transfers the injector interferes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// Reads return half of what was asked.
    ShortRead,
    /// Writes accept half of what was offered.
    ShortWrite,
    /// Reads fail with `ErrorKind::Interrupted`.
    InterruptedRead,
    /// Writes fail with `ErrorKind::Interrupted`.
    InterruptedWrite,
    /// Reads fail with a hard error.
    FailedRead,
    /// Writes fail with a hard error.
    FailedWrite,
}

/// What the adapter should do with one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoFault {
    /// Perform the transfer as asked.
    Pass,
    /// Transfer only this many bytes.
    Short(usize),
    /// Fail with `ErrorKind::Interrupted` without transferring.
    Interrupt,
    /// Fail with a hard error.
    Fail,
}

/// Counts transfers and injects faults at a configured point.
///
/// # Thread Safety
///
/// All state is atomic; share it between the test and the disk worker
/// through the returned `Arc`.
#[derive(Debug)]
pub struct IoFaultInjector {
    point: FaultPoint,
    /// Faults to inject before passing everything through again.
    budget: u32,
    reads: AtomicU32,
    writes: AtomicU32,
    injected: AtomicU32,
    armed: AtomicBool,
}

impl IoFaultInjector {
    /// Creates a disarmed injector that faults `times` transfers at `point`.
    pub fn new(point: FaultPoint, times: u32) -> Arc<Self> {
        Arc::new(Self {
            point,
            budget: times,
            reads: AtomicU32::new(0),
            writes: AtomicU32::new(0),
            injected: AtomicU32::new(0),
            armed: AtomicBool::new(false),
        })
    }

    /// Resets the counters and starts injecting.
    pub fn arm(&self) {
        self.reads.store(0, Ordering::SeqCst);
        self.writes.store(0, Ordering::SeqCst);
        self.injected.store(0, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Stops injecting.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Records a read of `len` bytes and decides its fate.
    pub fn on_read(&self, len: usize) -> IoFault {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match self.point {
            FaultPoint::ShortRead => self.inject(IoFault::Short(len / 2), len),
            FaultPoint::InterruptedRead => self.inject(IoFault::Interrupt, len),
            FaultPoint::FailedRead => self.inject(IoFault::Fail, len),
            _ => IoFault::Pass,
        }
    }

    /// Records a write of `len` bytes and decides its fate.
    pub fn on_write(&self, len: usize) -> IoFault {
        self.writes.fetch_add(1, Ordering::SeqCst);
        match self.point {
            FaultPoint::ShortWrite => self.inject(IoFault::Short(len / 2), len),
            FaultPoint::InterruptedWrite => self.inject(IoFault::Interrupt, len),
            FaultPoint::FailedWrite => self.inject(IoFault::Fail, len),
            _ => IoFault::Pass,
        }
    }

    fn inject(&self, fault: IoFault, len: usize) -> IoFault {
        if !self.armed.load(Ordering::SeqCst) || len == 0 {
            return IoFault::Pass;
        }
        let claimed = self
            .injected
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < self.budget).then_some(n + 1));
        if claimed.is_ok() { fault } else { IoFault::Pass }
    }

    /// Configured fault point.
    pub fn point(&self) -> FaultPoint {
        self.point
    }

    /// Faults injected since the last [`Self::arm`].
    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    /// Reads observed since the last [`Self::arm`].
    pub fn read_count(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Writes observed since the last [`Self::arm`].
    pub fn write_count(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }
}
