//! Error type for recoverable dataset-construction failures.
//!
//! Invariant violations (zero-column datasets, missing expected page sources,
//! empty histogram cuts, malformed page files) are *not* represented here:
//! they abort the process with a descriptive panic, because a dataset that
//! cannot be fully characterized is not usable for training. `DataError`
//! covers the conditions a caller can meaningfully react to.

use thiserror::Error;

/// Recoverable errors surfaced while constructing or persisting a dataset.
#[derive(Debug, Error)]
pub enum DataError {
    /// Filesystem I/O failed while touching the page cache or metadata.
    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Dataset metadata could not be serialized or deserialized.
    #[error("metadata (de)serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The per-dataset worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}
