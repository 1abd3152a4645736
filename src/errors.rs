// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the scan pipeline
//!
//! Every failure that leaves a stage, the chain or the bridge is a
//! [`PipelineError`]. The type is `Send` so a worker-side failure can be parked
//! in the bridge and re-raised on the polling thread.

use crate::pipelines::marker::{Marker, SequenceState};
use std::io;

/// Result type alias using PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Main pipeline error type
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// I/O failure on a pipe, file or source
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Helper process could not be started
    #[error("Failed to spawn helper '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Helper process ended badly (non-zero exit, signal, I/O breakdown)
    #[error("Helper '{command}' failed: {reason}")]
    HelperFailed { command: String, reason: String },

    /// Marker arrived in a state that does not accept it
    #[error("Protocol violation: {marker:?} not allowed in state {state:?}")]
    Protocol {
        marker: Marker,
        state: SequenceState,
    },

    /// Bridge saw a bucket it did not expect at this point of the sequence
    #[error("Unexpected bucket: {0}")]
    UnexpectedBucket(String),

    /// Allocation for a buffer of the given size failed
    #[error("Unable to allocate {0} bytes")]
    ResourceExhausted(usize),

    /// Acquisition source reported a failure
    #[error("Source error: {0}")]
    Source(String),

    /// Acquisition was cancelled before the image completed
    #[error("Operation cancelled")]
    Cancelled,

    /// The current sequence has no further images
    #[error("No more images in sequence")]
    NoMoreImages,

    /// A read was issued without an image in progress
    #[error("No image in progress")]
    NotScanning,

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether this error only reflects an ordinary end of acquisition
    pub fn is_benign(&self) -> bool {
        matches!(self, PipelineError::Cancelled | PipelineError::NoMoreImages)
    }

    /// Build an equivalent error, so one failure can be reported twice
    ///
    /// I/O errors keep their kind and message but lose any wrapped source.
    pub fn duplicate(&self) -> PipelineError {
        fn copy_io(err: &io::Error) -> io::Error {
            io::Error::new(err.kind(), err.to_string())
        }

        match self {
            PipelineError::Io(e) => PipelineError::Io(copy_io(e)),
            PipelineError::Spawn { command, source } => PipelineError::Spawn {
                command: command.clone(),
                source: copy_io(source),
            },
            PipelineError::HelperFailed { command, reason } => PipelineError::HelperFailed {
                command: command.clone(),
                reason: reason.clone(),
            },
            PipelineError::Protocol { marker, state } => PipelineError::Protocol {
                marker: *marker,
                state: *state,
            },
            PipelineError::UnexpectedBucket(msg) => PipelineError::UnexpectedBucket(msg.clone()),
            PipelineError::ResourceExhausted(size) => PipelineError::ResourceExhausted(*size),
            PipelineError::Source(msg) => PipelineError::Source(msg.clone()),
            PipelineError::Cancelled => PipelineError::Cancelled,
            PipelineError::NoMoreImages => PipelineError::NoMoreImages,
            PipelineError::NotScanning => PipelineError::NotScanning,
            PipelineError::Config(msg) => PipelineError::Config(msg.clone()),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Config(err.to_string())
    }
}
