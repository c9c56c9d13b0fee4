//! Utility modules for the deployment engine.

pub mod errors;
pub mod logger;

pub use errors::{DeployError, JobError, ManifestError, MaskError};
pub use logger::{Logger, Tone, TracingLogger};
