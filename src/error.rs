//! Error kinds surfaced by every engine in this crate.
//!
//! Mirrors the error taxonomy used throughout the original filter tree
//! (`ABORT_ERR`, insufficient-point checks before hull/NN calls, the
//! "no core/bulk ions" messages in the cluster filter, and so on), but
//! as a single typed enum rather than small integer codes plus a
//! separate message table.

use thiserror::Error;

/// Every fallible entry point in this crate returns `Result<T, CoreError>`.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The cancellation callback returned `false` at a progress tick.
    #[error("operation aborted by caller")]
    Aborted,

    /// Not enough points for the requested operation (hull with `< DIM+1`
    /// points, NN search with `k >= N`, and so on).
    #[error("insufficient points for this operation: have {have}, need at least {need}")]
    InsufficientPoints { have: usize, need: usize },

    /// A required upstream stream or configuration flag is missing (bulk
    /// linking enabled with no bulk-capable species, clustering without
    /// range data, and so on).
    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(String),

    /// Degenerate geometric input (coplanar point set for a hull, a
    /// bounding box collapsed to zero thickness on some axis).
    #[error("degenerate input: {0}")]
    DegenerateInput(String),

    /// A numerical routine (hull construction, SVD) failed to converge or
    /// produced a result that fails a sanity check.
    #[error("numeric failure: {0}")]
    NumericFailure(String),

    /// A requested allocation would overflow `usize` or otherwise exceeds
    /// what this process can address. Checked explicitly before large
    /// allocations (voxel grids, KD-tree arrays) rather than relying on
    /// the allocator to abort.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Loader-side failure. This crate does not implement point-file or
    /// range-file loaders (see spec Non-goals); this variant exists so
    /// that host applications wiring an external loader into this crate's
    /// `RangeTable::from_intervals` etc. can propagate I/O failures
    /// through the same error type.
    #[error("I/O error: {0}")]
    Io(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
