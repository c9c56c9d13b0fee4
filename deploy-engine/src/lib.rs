//! Deployment engine
//!
//! Synchronizes a local directory tree to an FTP, SFTP or local target by
//! diffing a content-hash manifest against the one stored remotely and
//! uploading only what changed.

pub mod deployer;
pub mod filter;
pub mod fs;
pub mod jobs;
pub mod manifest;
pub mod transfer;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use deployer::{DeployOptions, DeployOutcome, DeployReport, Deployer};
pub use manifest::{Manifest, ManifestEntry};
pub use transport::{Transport, TransportError};
pub use utils::errors::DeployError;
pub type Result<T> = std::result::Result<T, DeployError>;
