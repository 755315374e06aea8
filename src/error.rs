//! Error taxonomy.
//!
//! Source failures (`SourceError`) are absorbed by the capture supervisor and
//! never reach request handlers. The only request-visible failure in normal
//! operation is `RequestError::NoFrameAvailable`. `ModelLoadError` is fatal at
//! startup. Text extraction has no error type: no text is a normal outcome.

use thiserror::Error;

/// Failures of the video source handle.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source could not be opened or configured. Recoverable by retrying.
    #[error("failed to open video source {source_name}: {reason}")]
    Open { source_name: String, reason: String },
    /// A read failed. The handle is unusable and must be discarded.
    #[error("failed to read frame from {source_name}: {reason}")]
    Read { source_name: String, reason: String },
}

impl SourceError {
    pub fn open(source_name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Open {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn read(source_name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Read {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failures surfaced to a request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The frame cache has never been populated, or the source is reconnecting.
    #[error("no frame available")]
    NoFrameAvailable,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
}

/// The detection model could not be loaded. Fatal at startup.
#[derive(Debug, Error)]
#[error("failed to load detection model {path}: {reason}")]
pub struct ModelLoadError {
    pub path: String,
    pub reason: String,
}

impl ModelLoadError {
    pub fn new(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
