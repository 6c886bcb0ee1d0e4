//! Error types for the generation store.

use std::{io, path::PathBuf};

use genstore_types::GenId;
use snafu::Snafu;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during store operations.
#[derive(Debug, Snafu)]
pub enum Error {
    /// A parameter was malformed (bad priority, missing buffer, wrong length).
    #[snafu(display("Bad parameter: {reason}"))]
    BadParameter {
        /// What was wrong with the parameter.
        reason: String,
    },

    /// An argument does not name something the store knows about.
    #[snafu(display("Argument not valid: {name}"))]
    ArgNotValid {
        /// The offending argument.
        name: &'static str,
    },

    /// Memory could not be reserved within the configured budget.
    #[snafu(display("Cannot allocate {requested} bytes for generation {gen_id}"))]
    AllocateError {
        /// The generation the memory was for.
        gen_id: GenId,
        /// Bytes requested.
        requested: u64,
    },

    /// The disk scheduler is not accepting jobs.
    #[snafu(display("Disk scheduler is not running"))]
    DiskIsNotOn,

    /// An equivalent job is already queued or running.
    #[snafu(display("Disk task for generation {gen_id} already exists"))]
    DiskTaskExists {
        /// Target generation of the existing job.
        gen_id: GenId,
    },

    /// The job was cancelled before it ran.
    #[snafu(display("Disk task cancelled"))]
    DiskTaskCancelled,

    /// The job was stopped part way through.
    #[snafu(display("Disk task interrupted"))]
    DiskTaskInterrupted,

    /// I/O failure against a generation file.
    #[snafu(display("I/O error on {} at offset {offset}: {source}", path.display()))]
    FileIo {
        /// File being accessed.
        path: PathBuf,
        /// Byte offset of the failed transfer.
        offset: u64,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// I/O failure with no file context.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// An image or item failed a structural check.
    #[snafu(display("Corrupted generation image: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// The iterator is exhausted and has been released.
    #[snafu(display("No more entries"))]
    NoMoreEntries,

    /// The caller's buffer cannot hold the item.
    #[snafu(display("Buffer too small: {required} bytes required"))]
    BufferTooSmall {
        /// Bytes needed to hold the item.
        required: usize,
    },

    /// The operation is not available in the current phase.
    #[snafu(display("Store not available: {reason}"))]
    NotAvailable {
        /// Why the operation cannot run now.
        reason: &'static str,
    },

    /// The memory budget cannot hold the largest generation.
    #[snafu(display(
        "Memory budget {budget} bytes cannot hold generation {gen_id} ({required} bytes)"
    ))]
    BudgetTooSmall {
        /// The generation that does not fit.
        gen_id: GenId,
        /// Its size in bytes.
        required: u64,
        /// The configured budget.
        budget: u64,
    },

    /// A generation read failed; it is not retried automatically.
    #[snafu(display("Failed to read generation {gen_id}"))]
    ReadFailed {
        /// The generation whose read failed.
        gen_id: GenId,
    },

    /// A non-blocking call would have to wait for a generation read.
    #[snafu(display("Generation {gen_id} is not in memory"))]
    WouldBlock {
        /// The generation that is not resident.
        gen_id: GenId,
    },
}

// Provide automatic conversion from io::Error to Error::Io for ergonomic ? usage
impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

/// Broad classification of an [`Error`], used to decide how it propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Detected synchronously, returned immediately, never queued.
    Parameter,
    /// Allocation or budget failure; the caller may retry later.
    Resource,
    /// Disk failure; reported through job callbacks.
    Disk,
    /// Structural inconsistency in stored data.
    Consistency,
    /// Iterator and scheduler status codes.
    Status,
}

impl Error {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadParameter { .. } | Error::ArgNotValid { .. } => ErrorKind::Parameter,
            Error::AllocateError { .. } | Error::BudgetTooSmall { .. } => ErrorKind::Resource,
            Error::FileIo { .. } | Error::Io { .. } | Error::ReadFailed { .. } => ErrorKind::Disk,
            Error::Corrupted { .. } => ErrorKind::Consistency,
            Error::DiskIsNotOn
            | Error::DiskTaskExists { .. }
            | Error::DiskTaskCancelled
            | Error::DiskTaskInterrupted
            | Error::NoMoreEntries
            | Error::BufferTooSmall { .. }
            | Error::NotAvailable { .. }
            | Error::WouldBlock { .. } => ErrorKind::Status,
        }
    }

    /// Returns `true` when a job ended without running to completion.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::DiskTaskCancelled | Error::DiskTaskInterrupted)
    }

    pub(crate) fn corrupted(reason: impl Into<String>) -> Self {
        Error::Corrupted { reason: reason.into() }
    }

    pub(crate) fn bad_parameter(reason: impl Into<String>) -> Self {
        Error::BadParameter { reason: reason.into() }
    }
}
