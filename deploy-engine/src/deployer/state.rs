use std::fmt;

/// Phase a [`Deployer`](super::Deployer) is in.
///
/// A run moves forward through these in declaration order, skipping the
/// phases it has nothing to do for; `Failed` can follow any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployState {
    Idle,
    Connected,
    ManifestLoaded,
    Scanned,
    /// Nothing differs.
    Synced,
    /// Changes were found.
    Diverged,
    /// Running before-jobs.
    Preparing,
    Uploading,
    Renaming,
    Deleting,
    Purging,
    /// Running after-jobs and removing the sentinel.
    Finalizing,
    Done,
    Failed,
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeployState::Idle => "idle",
            DeployState::Connected => "connected",
            DeployState::ManifestLoaded => "manifest loaded",
            DeployState::Scanned => "scanned",
            DeployState::Synced => "synced",
            DeployState::Diverged => "diverged",
            DeployState::Preparing => "preparing",
            DeployState::Uploading => "uploading",
            DeployState::Renaming => "renaming",
            DeployState::Deleting => "deleting",
            DeployState::Purging => "purging",
            DeployState::Finalizing => "finalizing",
            DeployState::Done => "done",
            DeployState::Failed => "failed",
        };
        f.write_str(name)
    }
}
