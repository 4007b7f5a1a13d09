//! Crate-wide error taxonomy.
//!
//! rv6 itself gets away with bare `Result<T, ()>` or an outright panic,
//! since a kernel booting alone on hardware has nowhere else to report a
//! failure. A host-testable library needs callers (and logs) to be able to
//! tell the failures apart, so this follows spec.md §7's taxonomy directly:
//! one variant per row.

use std::fmt;

/// A failure from any of the storage/VM subsystems.
#[derive(Debug)]
pub enum Error {
    /// Frame, cache entry, or SPTE allocation failed because the relevant
    /// pool is exhausted.
    OutOfMemory,
    /// The free-map has no sectors left to satisfy a `create`/`expand`.
    DiskFull,
    /// The swap bitmap is full. Per spec.md §4.6 this is meant to be fatal;
    /// the function itself stays total so it is unit-testable, and the one
    /// caller that must escalate (`vm::frame`'s eviction path) panics on it.
    SwapExhausted,
    /// A user pointer failed validation at the syscall boundary.
    InvalidPointer,
    /// A write was attempted on an inode with a non-zero deny-write count.
    WriteDenied,
    /// `mmap` preconditions failed (bad fd, misaligned/overlapping addr).
    MmapPrecondition,
    /// The underlying block device failed a read or write.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "allocation failed: out of memory"),
            Error::DiskFull => write!(f, "free-map exhausted"),
            Error::SwapExhausted => write!(f, "swap disk is already full"),
            Error::InvalidPointer => write!(f, "invalid user pointer"),
            Error::WriteDenied => write!(f, "write denied on this inode"),
            Error::MmapPrecondition => write!(f, "mmap precondition failed"),
            Error::Io(msg) => write!(f, "device I/O failure: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
