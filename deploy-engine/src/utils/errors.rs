//! Error types for the deployment engine.

use crate::transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Mask(#[from] MaskError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Filter error: {0}")]
    Filter(String),
}

/// Failure of a before/after hook.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Invalid job '{0}'")]
    Invalid(String),

    #[error("Error in job {job}: {reason}")]
    Failed { job: String, reason: String },

    #[error("File {0} doesn't exist")]
    SourceMissing(String),

    #[error("File {0} already exists")]
    DestinationExists(String),
}

/// A stored manifest could not be decoded. Callers treat this as "no manifest".
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("manifest is not valid compressed data: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("manifest is not valid UTF-8")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("manifest compression failed: {0}")]
    Compress(#[source] std::io::Error),
}

/// A mask pattern could not be compiled.
#[derive(Error, Debug)]
#[error("failed to compile mask '{pattern}': {source}")]
pub struct MaskError {
    pattern: String,
    #[source]
    source: globset::Error,
}

impl MaskError {
    pub(crate) fn new(pattern: impl Into<String>, source: globset::Error) -> Self {
        Self {
            pattern: pattern.into(),
            source,
        }
    }

    /// Returns the offending pattern.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}
