//! Error types for the bamflow engine.
//!
//! Every fatal condition that can stop a pipeline is a [`PipelineError`]. Resource exhaustion is
//! deliberately absent: an empty pool is ordinary control flow, not an error.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Fatal error raised anywhere in the engine.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Reading, writing or decompressing failed.
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        /// File or stream the error occurred on
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// A record failed validation.
    #[error("Invalid record #{record} in input {stream}: {reason}")]
    Validation {
        /// Index of the input stream
        stream: usize,
        /// Parse-order ordinal of the record within the stream
        record: u64,
        /// What was wrong with it
        reason: String,
    },

    /// The input header could not be parsed.
    #[error("Invalid header in input {stream}: {reason}")]
    Header {
        /// Index of the input stream
        stream: usize,
        /// What was wrong with it
        reason: String,
    },

    /// A configuration value is out of range.
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// Parameter name
        parameter: String,
        /// Why it was rejected
        reason: String,
    },

    /// An internal bookkeeping invariant was violated.
    #[error("Internal invariant violated: {0}")]
    Internal(String),

    /// A worker thread panicked while executing a work package.
    #[error("Worker thread panicked: {0}")]
    WorkerPanic(String),

    /// The pipeline was aborted because another stage failed.
    #[error("Pipeline aborted after a fatal error in another stage")]
    Aborted,
}

impl PipelineError {
    /// Attach a path to an I/O error.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io { path: path.as_ref().to_path_buf(), source }
    }

    /// Shorthand for [`PipelineError::Internal`].
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Short name of the error category, used when reporting a failed run.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io { .. } => "I/O",
            Self::Validation { .. } | Self::Header { .. } => "validation",
            Self::InvalidParameter { .. } => "configuration",
            Self::Internal(_) | Self::WorkerPanic(_) => "internal",
            Self::Aborted => "aborted",
        }
    }
}

/// Attach path context to `io::Result`s.
pub trait IoContext<T> {
    /// Convert an `io::Error` into [`PipelineError::Io`] for `path`.
    fn with_path(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn with_path(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| PipelineError::io(path, e))
    }
}
