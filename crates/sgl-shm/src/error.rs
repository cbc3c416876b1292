use std::io;

use sgl_protocol::BoundsError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShmError>;

/// Failure to create, attach to or access a segment.
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("invalid shared memory name {name:?}")]
    InvalidName { name: String },

    #[error("failed to open shared memory object {name:?}: {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to size shared memory object {name:?}: {source}")]
    Resize {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to map shared memory object {name:?}: {source}")]
    Map {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("segment {name:?} size mismatch (expected {expected} bytes, found {found} bytes)")]
    SizeMismatch {
        name: String,
        expected: u64,
        found: u64,
    },

    #[error("shared memory object {name:?} is served by another host")]
    InUse { name: String },

    #[error("segment size {size} is below the minimum of {min} bytes")]
    TooSmall { size: usize, min: usize },

    #[error(transparent)]
    Bounds(#[from] BoundsError),
}
