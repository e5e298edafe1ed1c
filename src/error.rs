//! Error types for the `cosort` crate

use crate::device::BufferId;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while configuring, initialising or running a co-sort
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A sort was requested before [`crate::CoSorter::init`].
    #[error("sorter not initialised, call init() before sorting")]
    NotInitialized,

    /// The sorter was released and cannot be used anymore.
    #[error("sorter has been released")]
    Released,

    /// An engine rejected the requested capacity.
    ///
    /// No sort is attempted and no buffers stay allocated.
    #[error("capacity {capacity} is not supported by the {engine} engine: {reason}")]
    InvalidCapacity {
        /// Engine name
        engine:   &'static str,
        /// Requested capacity
        capacity: usize,
        /// Tiling constraint that failed
        reason:   String,
    },

    /// The network engine was handed a length that is not a multiple of its group size.
    #[error("length {len} is not a multiple of the group size {granularity}")]
    Misaligned {
        /// Physical length
        len:         usize,
        /// Minimum granularity
        granularity: usize,
    },

    /// Configuration values out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Keys and values of different lengths.
    #[error("got {keys} keys but {values} values")]
    LengthMismatch {
        /// Number of keys
        keys:   usize,
        /// Number of values
        values: usize,
    },

    /// The buffer handle does not belong to this device (or was released).
    #[error("unknown device buffer {0:?}")]
    UnknownBuffer(BufferId),

    /// A transfer or kernel range exceeds the buffer capacity.
    #[error("buffer {buffer:?} holds {capacity} words, {requested} requested")]
    BufferOverflow {
        /// Offending buffer
        buffer:    BufferId,
        /// Words allocated
        capacity:  usize,
        /// Words addressed
        requested: usize,
    },

    /// One buffer was bound twice in a single dispatch.
    #[error("buffer {0:?} bound more than once in one dispatch")]
    AliasedBuffers(BufferId),

    /// Accelerator or driver failure. Fatal for the job.
    #[error("device error: {0}")]
    Device(String),

    #[allow(missing_docs)]
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[allow(missing_docs)]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
