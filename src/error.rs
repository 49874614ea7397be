//! Error types for proxima.

use thiserror::Error;

/// Errors that can occur while building, querying, or persisting an index.
#[derive(Debug, Error)]
pub enum ProximaError {
    /// A vector component cannot be represented by the index's storage type.
    #[error(
        "value {value} at component {index} is outside the representable \
         range [{lo}, {hi}]"
    )]
    OutOfRange {
        /// Position of the offending component within the input vector.
        index: usize,
        /// The value that failed to encode.
        value: f32,
        /// Lower bound of the representable range.
        lo: f32,
        /// Upper bound of the representable range.
        hi: f32,
    },

    /// Input vector length disagrees with the index dimensionality.
    #[error("expected a vector with {expected} dimensions, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Insertion attempted beyond the current capacity. Recoverable: resize
    /// the index and retry.
    #[error("index is full ({max_elements} elements); resize to add more")]
    IndexFull { max_elements: usize },

    /// `resize` called with a target below the current element count.
    #[error("cannot shrink an index holding {current} elements to {requested}")]
    IndexCannotShrink { requested: usize, current: usize },

    /// The requested label is not present in the index.
    #[error("label {0} not found in index")]
    LabelNotFound(u64),

    /// Bulk add received an id list whose length does not match the number
    /// of vectors.
    #[error("got {ids} ids for {rows} vectors")]
    IdsLengthMismatch { ids: usize, rows: usize },

    /// A per-query `ef` override smaller than `k` was provided.
    #[error("query ef ({ef}) must be at least as large as k ({k})")]
    QueryEfTooSmall { ef: usize, k: usize },

    /// Graph traversal reached fewer than `k` non-deleted nodes.
    #[error(
        "fewer than expected results were retrieved; only found {found} of \
         {requested} requested neighbors"
    )]
    InsufficientResults { found: usize, requested: usize },

    /// The index file declares a format version this library cannot read.
    #[error("{}", unsupported_version_message(*.0))]
    UnsupportedVersion(i32),

    /// The index data violates a format or distance invariant.
    #[error("index data appears corrupt: {0}")]
    Corrupt(String),

    /// I/O on the underlying stream failed.
    #[error("stream failure: {0}")]
    StreamFailure(#[from] std::io::Error),
}

fn unsupported_version_message(version: i32) -> String {
    let guidance = if version < 20 {
        "a newer version of this library may be able to read it"
    } else {
        "the file may be corrupt (or not an index file)"
    };
    format!("unsupported index file version \"0x{version:x}\"; {guidance}")
}

/// Result type alias for proxima operations.
pub type Result<T> = std::result::Result<T, ProximaError>;
