//! Deployment orchestration.
//!
//! A [`Deployer`] compares the local tree with the manifest stored on the
//! target and applies the difference:
//!
//! 1. changed files are uploaded under a temporary name;
//! 2. a `<manifest>.running` sentinel is created on the target;
//! 3. the temporary uploads are renamed into place, manifest last;
//! 4. remote-only paths are deleted and purge directories emptied;
//! 5. the sentinel is removed.
//!
//! A run that fails leaves the sentinel behind so the interrupted deployment
//! is visible on the server. Temporary uploads that were never renamed are
//! removed on every exit path.

pub mod cache;
pub mod state;

use crate::filter::{ContentFilter, ContentFilters};
use crate::fs::hash::hash_file;
use crate::fs::mask::MaskSet;
use crate::fs::walker::{scan_tree, ScanMasks};
use crate::jobs::{Job, JobContext, JobRunner};
use crate::manifest::{self, deployment_file_key, Compression, Manifest};
use crate::transfer::progress::{progress_line, shorten, TransferStats};
use crate::transport::Transport;
use crate::utils::errors::{DeployError, JobError};
use crate::utils::logger::{Logger, Tone};
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

pub use cache::{ScanCache, ScanKey};
pub use state::DeployState;

/// Suffix of files uploaded but not yet renamed into place.
pub const TEMP_SUFFIX: &str = ".deploytmp";

/// Suffix of the sentinel marking a deployment in progress.
pub const RUNNING_SUFFIX: &str = ".running";

pub const DEFAULT_DEPLOYMENT_FILE: &str = ".htdeployment";

/// Ignore masks every deployment starts with.
pub const DEFAULT_IGNORE_MASKS: &[&str] = &["*.bak", ".svn", ".git*", "Thumbs.db", ".DS_Store", ".idea"];

const PURGE_LABEL_WIDTH: usize = 60;

/// Deployment settings.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Name of the manifest stored in the remote root.
    pub deployment_file: String,

    pub ignore_masks: Vec<String>,

    /// When non-empty, only matching paths are deployed.
    pub include_masks: Vec<String>,

    /// Paths that content filters apply to.
    pub preprocess_masks: Vec<String>,

    /// Delete remote paths that no longer exist locally.
    pub allow_delete: bool,

    /// Report what would change without touching the target.
    pub test_mode: bool,

    /// Remote directories (relative to the root) emptied after uploading.
    pub to_purge: Vec<String>,

    /// Scratch space for manifests and filtered files.
    pub temp_dir: PathBuf,

    pub compression: Compression,

    pub run_before: Vec<Job>,
    pub run_after_upload: Vec<Job>,
    pub run_after: Vec<Job>,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            deployment_file: DEFAULT_DEPLOYMENT_FILE.to_string(),
            ignore_masks: DEFAULT_IGNORE_MASKS.iter().map(|m| m.to_string()).collect(),
            include_masks: Vec::new(),
            preprocess_masks: Vec::new(),
            allow_delete: true,
            test_mode: false,
            to_purge: Vec::new(),
            temp_dir: std::env::temp_dir().join("deployment"),
            compression: Compression::default(),
            run_before: Vec::new(),
            run_after_upload: Vec::new(),
            run_after: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    AlreadySynchronized,
    /// Test mode: nothing was changed, the report lists what would be.
    TestRun,
    Deployed,
}

/// Summary of a [`Deployer::deploy`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    pub outcome: DeployOutcome,
    /// Uploaded manifest paths, manifest last.
    pub uploaded: Vec<String>,
    pub deleted: Vec<String>,
    pub purged: Vec<String>,
    /// Bytes sent for uploaded files.
    pub bytes: u64,
}

impl DeployReport {
    fn new(outcome: DeployOutcome) -> Self {
        Self {
            outcome,
            uploaded: Vec::new(),
            deleted: Vec::new(),
            purged: Vec::new(),
            bytes: 0,
        }
    }
}

/// Artifacts that must not outlive a run.
#[derive(Default)]
struct Pending {
    /// Encoded local manifest waiting to be uploaded.
    manifest: Option<NamedTempFile>,
    /// Final remote paths whose temporary upload has not been renamed yet.
    uploads: VecDeque<String>,
}

pub struct Deployer {
    transport: Box<dyn Transport>,
    local: PathBuf,
    logger: Arc<dyn Logger>,
    options: DeployOptions,
    ignore: MaskSet,
    include: MaskSet,
    filters: ContentFilters,
    state: DeployState,
}

impl Deployer {
    /// Create a deployer for the local directory `local`.
    ///
    /// Fails when `local` does not exist or a mask does not compile.
    pub fn new(
        transport: Box<dyn Transport>,
        local: impl AsRef<Path>,
        logger: Arc<dyn Logger>,
        options: DeployOptions,
    ) -> crate::Result<Self> {
        let local = local.as_ref();
        let local = fs::canonicalize(local)
            .map_err(|_| DeployError::Config(format!("Directory {} not found.", local.display())))?;
        if !local.is_dir() {
            return Err(DeployError::Config(format!("{} is not a directory.", local.display())));
        }

        let ignore = MaskSet::new(&options.ignore_masks)?;
        let include = MaskSet::new(&options.include_masks)?;
        let filters = ContentFilters::new(
            MaskSet::new(&options.preprocess_masks)?,
            options.temp_dir.clone(),
        );

        Ok(Self {
            transport,
            local,
            logger,
            options,
            ignore,
            include,
            filters,
            state: DeployState::Idle,
        })
    }

    /// Register a content filter for files with `extension`.
    pub fn add_filter(&mut self, extension: &str, filter: Arc<dyn ContentFilter>, cached: bool) -> &mut Self {
        self.filters.add(extension, filter, cached);
        self
    }

    pub fn state(&self) -> DeployState {
        self.state
    }

    pub fn options(&self) -> &DeployOptions {
        &self.options
    }

    pub fn local_root(&self) -> &Path {
        &self.local
    }

    /// Key under which this deployer's scan can be shared.
    pub fn scan_key(&self) -> ScanKey {
        ScanKey {
            root: self.local.clone(),
            ignore: self.options.ignore_masks.clone(),
            include: self.options.include_masks.clone(),
            preprocess: self.options.preprocess_masks.clone(),
            filters: self.filters.identities(),
            deployment_file: self.options.deployment_file.clone(),
        }
    }

    /// Scan the local tree and hash every file, after filtering.
    pub fn collect_paths(&self) -> crate::Result<Manifest> {
        let masks = ScanMasks {
            ignore: &self.ignore,
            include: &self.include,
        };
        let filters = &self.filters;
        let manifest = scan_tree(&self.local, masks, self.logger.as_ref(), |path, relative| {
            let processed = filters.apply(path, relative)?;
            Ok(hash_file(processed.path())?)
        })?;
        self.logger.progress("");
        Ok(manifest)
    }

    /// Encode `manifest` into the file `dest`.
    pub fn write_deployment_file(&self, manifest: &Manifest, dest: &Path) -> crate::Result<()> {
        let encoded = manifest::encode(manifest, self.options.compression)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, encoded)?;
        Ok(())
    }

    /// Synchronize the target with the local tree.
    ///
    /// `cache` lets several deployers share one scan of the same tree.
    pub fn deploy(&mut self, cache: Option<&mut ScanCache>) -> crate::Result<DeployReport> {
        self.state = DeployState::Idle;
        let mut pending = Pending::default();
        let result = self.run(cache, &mut pending);
        self.clean_up(&mut pending);

        match result {
            Ok(report) => {
                self.state = DeployState::Done;
                Ok(report)
            }
            Err(error) => {
                warn!("Deployment failed while {}: {}", self.state, error);
                self.state = DeployState::Failed;
                Err(error)
            }
        }
    }

    fn run(&mut self, cache: Option<&mut ScanCache>, pending: &mut Pending) -> crate::Result<DeployReport> {
        self.logger.log("Connecting to server", Tone::Plain);
        self.transport.connect()?;
        let root = self.transport.root_dir()?;
        self.state = DeployState::Connected;

        let context = JobContext {
            local_root: self.local.clone(),
            remote_root: root.clone(),
            test_mode: self.options.test_mode,
        };
        let (local_before, remote_before): (Vec<Job>, Vec<Job>) =
            self.options.run_before.iter().cloned().partition(Job::is_local);
        if !local_before.is_empty() {
            self.logger.log("Local-jobs:", Tone::Highlight);
            self.run_jobs(&local_before, &context)?;
        }

        let mut remote = self.load_deployment_file(&root)?;
        self.state = DeployState::ManifestLoaded;

        self.logger
            .log(&format!("Scanning files in {}", self.local.display()), Tone::Plain);
        let mut local = self.scan(cache)?;
        let manifest_key = deployment_file_key(&self.options.deployment_file);
        local.remove(&manifest_key);
        remote.remove(&manifest_key);
        self.state = DeployState::Scanned;

        let mut diff = local.diff(&remote, self.options.allow_delete);
        if local != remote {
            pending.manifest = Some(self.encode_to_temp(&local)?);
            diff.to_upload.push(manifest_key.clone());
        }

        if diff.is_empty() {
            self.state = DeployState::Synced;
            self.logger.log("Already synchronized.", Tone::Highlight);
            let local_after: Vec<Job> = self.options.run_after.iter().filter(|j| j.is_local()).cloned().collect();
            if !local_after.is_empty() {
                self.logger.log("After-jobs:", Tone::Highlight);
                self.run_jobs(&local_after, &context)?;
            }
            return Ok(DeployReport::new(DeployOutcome::AlreadySynchronized));
        }
        self.state = DeployState::Diverged;

        if self.options.test_mode {
            self.logger
                .log(&format!("Uploading:\n{}", diff.to_upload.join("\n")), Tone::Upload);
            self.logger
                .log(&format!("Deleting:\n{}", diff.to_delete.join("\n")), Tone::Delete);
            let mut report = DeployReport::new(DeployOutcome::TestRun);
            report.uploaded = diff.to_upload;
            report.deleted = diff.to_delete;
            return Ok(report);
        }

        self.state = DeployState::Preparing;
        if !remote_before.is_empty() {
            self.logger.log("Before-jobs:", Tone::Highlight);
            self.run_jobs(&remote_before, &context)?;
        }

        self.state = DeployState::Uploading;
        let mut report = DeployReport::new(DeployOutcome::Deployed);
        if !diff.to_upload.is_empty() {
            self.logger.log("Uploading:", Tone::Highlight);
            report.bytes = self.upload_files(&root, &diff.to_upload, &manifest_key, pending)?;
        }

        let after_upload = self.options.run_after_upload.clone();
        if !after_upload.is_empty() {
            self.logger.log("After-upload-jobs:", Tone::Highlight);
            self.run_jobs(&after_upload, &context)?;
        }

        let running = format!("{root}/{}{RUNNING_SUFFIX}", self.options.deployment_file);
        self.logger.log(
            &format!("Creating remote file {}{RUNNING_SUFFIX}", self.options.deployment_file),
            Tone::Plain,
        );
        self.write_sentinel(&running)?;

        self.state = DeployState::Renaming;
        self.rename_uploads(pending)?;
        report.uploaded = diff.to_upload;

        self.state = DeployState::Deleting;
        if !diff.to_delete.is_empty() {
            self.logger.log("Deleting:", Tone::Highlight);
            report.deleted = self.delete_files(&root, diff.to_delete);
        }

        self.state = DeployState::Purging;
        for path in self.options.to_purge.clone() {
            self.logger.log(&format!("Cleaning {path}"), Tone::Highlight);
            let logger = Arc::clone(&self.logger);
            let target = format!("{root}/{}", path.trim_matches('/'));
            let mut counter = 0usize;
            self.transport.purge(&target, &mut |entry: &str| {
                let label = shorten(entry.strip_prefix(root.as_str()).unwrap_or(entry), PURGE_LABEL_WIDTH);
                logger.progress(&format!("{label} {}", ".".repeat(counter % 30)));
                counter += 1;
            })?;
            logger.progress("");
            report.purged.push(path);
        }

        self.state = DeployState::Finalizing;
        let after = self.options.run_after.clone();
        if !after.is_empty() {
            self.logger.log("After-jobs:", Tone::Highlight);
            self.run_jobs(&after, &context)?;
        }

        self.logger.log(
            &format!("Deleting remote file {}{RUNNING_SUFFIX}", self.options.deployment_file),
            Tone::Plain,
        );
        self.transport.remove_file(&running)?;

        Ok(report)
    }

    fn scan(&self, cache: Option<&mut ScanCache>) -> crate::Result<Manifest> {
        let Some(cache) = cache else {
            return self.collect_paths();
        };

        let key = self.scan_key();
        if let Some(manifest) = cache.get(&key) {
            debug!("Reusing scan of {}", self.local.display());
            return Ok(manifest.clone());
        }
        let manifest = self.collect_paths()?;
        cache.insert(key, manifest.clone());
        Ok(manifest)
    }

    /// Fetch and decode the remote manifest. Missing or unreadable manifests
    /// count as empty.
    fn load_deployment_file(&mut self, root: &str) -> crate::Result<Manifest> {
        let name = &self.options.deployment_file;
        fs::create_dir_all(&self.options.temp_dir)?;
        let temp = NamedTempFile::new_in(&self.options.temp_dir)?;

        if let Err(error) = self
            .transport
            .read_file_once(&format!("{root}/{name}"), temp.path())
        {
            debug!("Cannot read remote manifest: {}", error);
            self.logger.log(&format!("Remote {name} file not found"), Tone::Plain);
            return Ok(Manifest::new());
        }

        match manifest::decode(&fs::read(temp.path())?) {
            Ok(manifest) => {
                self.logger.log(&format!("Loaded remote {name} file"), Tone::Plain);
                Ok(manifest)
            }
            Err(error) => {
                self.logger.log(
                    &format!("Remote {name} file is corrupted ({error}), deploying everything"),
                    Tone::Failure,
                );
                Ok(Manifest::new())
            }
        }
    }

    fn encode_to_temp(&self, manifest: &Manifest) -> crate::Result<NamedTempFile> {
        fs::create_dir_all(&self.options.temp_dir)?;
        let mut temp = tempfile::Builder::new()
            .prefix("deploy")
            .tempfile_in(&self.options.temp_dir)?;
        let encoded = manifest::encode(manifest, self.options.compression)?;
        temp.write_all(&encoded)?;
        temp.flush()?;
        Ok(temp)
    }

    /// Upload `paths` under temporary names. Returns the bytes sent.
    fn upload_files(
        &mut self,
        root: &str,
        paths: &[String],
        manifest_key: &str,
        pending: &mut Pending,
    ) -> crate::Result<u64> {
        let total = paths.len();
        let mut stats = TransferStats::new();
        let mut previous_dir: Option<String> = None;

        for (index, path) in paths.iter().enumerate() {
            let remote = format!("{root}{path}");
            let is_dir = path.ends_with('/');
            let remote_dir = if is_dir {
                remote.trim_end_matches('/').to_string()
            } else {
                remote.rsplit_once('/').map(|(dir, _)| dir.to_string()).unwrap_or_default()
            };
            if previous_dir.as_deref() != Some(remote_dir.as_str()) {
                self.transport.create_dir(&remote_dir)?;
                previous_dir = Some(remote_dir);
            }

            if is_dir {
                self.logger.log(&progress_line(index + 1, total, path, None), Tone::Upload);
                continue;
            }

            let processed;
            let (source, label) = if path == manifest_key {
                let manifest = pending
                    .manifest
                    .as_ref()
                    .ok_or_else(|| DeployError::Config("local manifest was not prepared".to_string()))?;
                (manifest.path().to_path_buf(), path.clone())
            } else {
                processed = self
                    .filters
                    .apply(&self.local.join(path.trim_start_matches('/')), path)?;
                let label = if processed.is_filtered() {
                    format!("{path} (filters applied)")
                } else {
                    path.clone()
                };
                (processed.path().to_path_buf(), label)
            };

            pending.uploads.push_back(remote.clone());
            let logger = Arc::clone(&self.logger);
            self.transport.write_file(
                &source,
                &format!("{remote}{TEMP_SUFFIX}"),
                &mut |percent: f64| logger.progress(&progress_line(index + 1, total, &label, Some(percent))),
            )?;
            self.logger.log(&progress_line(index + 1, total, &label, None), Tone::Upload);
            stats.record(fs::metadata(&source)?.len());
        }

        debug!("Uploaded {} files in {:?}", stats.files(), stats.elapsed());
        Ok(stats.bytes())
    }

    fn write_sentinel(&mut self, running: &str) -> crate::Result<()> {
        if let Some((dir, _)) = running.rsplit_once('/') {
            self.transport.create_dir(dir)?;
        }
        fs::create_dir_all(&self.options.temp_dir)?;
        let empty = NamedTempFile::new_in(&self.options.temp_dir)?;
        self.transport.write_file(empty.path(), running, &mut |_: f64| {})?;
        Ok(())
    }

    fn rename_uploads(&mut self, pending: &mut Pending) -> crate::Result<()> {
        if pending.uploads.is_empty() {
            return Ok(());
        }

        self.logger.log("Renaming:", Tone::Highlight);
        let total = pending.uploads.len();
        let mut index = 0;
        while let Some(file) = pending.uploads.front() {
            index += 1;
            self.logger
                .log(&progress_line(index, total, &format!("Renaming {file}"), None), Tone::Rename);
            self.transport.rename_file(&format!("{file}{TEMP_SUFFIX}"), file)?;
            pending.uploads.pop_front();
        }
        Ok(())
    }

    /// Delete `paths`, deepest first. Failures are logged and skipped.
    fn delete_files(&mut self, root: &str, mut paths: Vec<String>) -> Vec<String> {
        paths.sort_unstable_by(|a, b| b.cmp(a));

        let total = paths.len();
        let mut deleted = Vec::with_capacity(total);
        for (index, path) in paths.into_iter().enumerate() {
            let remote = format!("{root}{path}");
            self.logger
                .log(&progress_line(index + 1, total, &format!("Deleting {path}"), None), Tone::Delete);
            let result = if path.ends_with('/') {
                self.transport.remove_dir(remote.trim_end_matches('/'))
            } else {
                self.transport.remove_file(&remote)
            };
            match result {
                Ok(()) => deleted.push(path),
                Err(error) => {
                    debug!("Delete of {} failed: {}", remote, error);
                    self.logger.log(&format!("Unable to delete {remote}"), Tone::Failure);
                }
            }
        }
        deleted
    }

    fn run_jobs(&mut self, jobs: &[Job], context: &JobContext) -> crate::Result<()> {
        let mut runner = JobRunner::new(self.transport.as_mut(), self.logger.as_ref(), context);
        for job in jobs {
            let failed = |reason: String| JobError::Failed {
                job: job.to_string(),
                reason,
            };
            let output = runner.run(job).map_err(|e| failed(e.to_string()))?;
            self.logger.log(
                &format!("{job}: {}", output.output.as_deref().unwrap_or_default()),
                Tone::Plain,
            );
            if let Some(reason) = output.error {
                return Err(failed(reason).into());
            }
        }
        Ok(())
    }

    fn clean_up(&mut self, pending: &mut Pending) {
        if let Some(manifest) = pending.manifest.take() {
            if let Err(error) = manifest.close() {
                warn!("Cannot remove temporary manifest: {}", error);
            }
        }

        while let Some(file) = pending.uploads.pop_front() {
            let temp = format!("{file}{TEMP_SUFFIX}");
            if let Err(error) = self.transport.remove_file(&temp) {
                self.logger
                    .log(&format!("Unable to remove {temp}: {error}"), Tone::Failure);
            }
        }
    }
}
