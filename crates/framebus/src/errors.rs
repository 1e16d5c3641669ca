use crate::frame::FrameShape;
use crate::semaphore::SemaphoreError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Shared memory region {0} already exists")]
    AlreadyExists(String),

    #[error("Shared memory region {0} not found")]
    NotFound(String),

    #[error("Frame shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        expected: FrameShape,
        actual: FrameShape,
    },

    #[error("Buffer size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Invalid frame shape {0}")]
    InvalidShape(FrameShape),

    #[error("Invalid buffer name: {0:?}")]
    InvalidName(String),

    #[error("Semaphore error: {0}")]
    SemaphoreError(#[from] SemaphoreError),

    #[error("Timed out waiting for the lock on {0}")]
    LockTimeout(String),

    #[error("Buffer {0} is not registered")]
    UnknownBuffer(String),

    #[error("Buffer {0} is closed")]
    Closed(String),

    #[error("Metadata too large: {needed} bytes exceeds capacity of {capacity}")]
    MetadataOverflow { needed: usize, capacity: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resize failed: {0}")]
    Resize(String),
}

impl BufferError {
    /// True for the "segment does not exist (yet)" outcome that readers treat as no data.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BufferError::NotFound(_))
    }
}
