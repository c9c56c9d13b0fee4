//! Content filters applied to files before they are hashed and uploaded.
//!
//! Filters are registered per file extension and only run for paths matched
//! by the preprocess masks. A cached filter stores its output in the temp
//! directory under the MD5 of its identity and input, so unchanged files are
//! not filtered again on the next run.

use crate::fs::mask::MaskSet;
use crate::utils::errors::DeployError;
use md5::{Digest, Md5};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, error};

/// Transforms file content. `Ok(None)` leaves the content unchanged.
pub trait ContentFilter: Send + Sync {
    fn filter(&self, content: &[u8], source: &Path) -> crate::Result<Option<Vec<u8>>>;

    /// Identifies what the filter does. Filters with equal ids must produce
    /// equal output; the default is the address of the filter instance.
    fn id(&self) -> String {
        format!("{:p}", self as *const Self as *const ())
    }
}

impl<F> ContentFilter for F
where
    F: Fn(&[u8], &Path) -> crate::Result<Option<Vec<u8>>> + Send + Sync,
{
    fn filter(&self, content: &[u8], source: &Path) -> crate::Result<Option<Vec<u8>>> {
        self(content, source)
    }
}

/// Pipes content through an external command (stdin to stdout).
#[derive(Debug, Clone)]
pub struct CommandFilter {
    command: String,
}

impl CommandFilter {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl ContentFilter for CommandFilter {
    fn id(&self) -> String {
        format!("command:{}", self.command)
    }

    fn filter(&self, content: &[u8], source: &Path) -> crate::Result<Option<Vec<u8>>> {
        debug!("Filtering {} through {}", source.display(), self.command);
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DeployError::Filter(format!("cannot run '{}': {e}", self.command)))?;

        let stdin = child.stdin.take();
        let input = content.to_vec();
        let writer = std::thread::spawn(move || match stdin {
            Some(mut stdin) => stdin.write_all(&input),
            None => Ok(()),
        });
        let output = child.wait_with_output()?;
        let written = writer
            .join()
            .map_err(|_| DeployError::Filter("filter input thread panicked".to_string()))?;

        if !output.status.success() || written.is_err() {
            error!(
                "Filter '{}' failed for {}: {}",
                self.command,
                source.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(None);
        }
        Ok(Some(output.stdout))
    }
}

struct Registered {
    filter: Arc<dyn ContentFilter>,
    cached: bool,
}

/// File to hash or upload after filtering.
#[derive(Debug)]
pub enum Processed {
    /// No filter applied.
    Original(PathBuf),
    /// Filtered content, deleted on drop.
    Temporary(NamedTempFile),
    /// Filtered content kept in the filter cache.
    Cached(PathBuf),
}

impl Processed {
    pub fn path(&self) -> &Path {
        match self {
            Processed::Original(path) | Processed::Cached(path) => path,
            Processed::Temporary(file) => file.path(),
        }
    }

    pub fn is_filtered(&self) -> bool {
        !matches!(self, Processed::Original(_))
    }
}

/// Filters by extension.
pub struct ContentFilters {
    filters: BTreeMap<String, Vec<Registered>>,
    masks: MaskSet,
    temp_dir: PathBuf,
}

impl ContentFilters {
    /// `masks` select which files are filtered at all.
    pub fn new(masks: MaskSet, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            filters: BTreeMap::new(),
            masks,
            temp_dir: temp_dir.into(),
        }
    }

    /// Register `filter` for files ending in `.extension`. Filters for the same
    /// extension run in registration order.
    pub fn add(&mut self, extension: &str, filter: Arc<dyn ContentFilter>, cached: bool) {
        self.filters
            .entry(extension.trim_start_matches('.').to_ascii_lowercase())
            .or_default()
            .push(Registered { filter, cached });
    }

    /// `(extension, filter id, cached)` for every registered filter, in
    /// application order.
    pub fn identities(&self) -> Vec<(String, String, bool)> {
        self.filters
            .iter()
            .flat_map(|(extension, filters)| {
                filters
                    .iter()
                    .map(move |registered| (extension.clone(), registered.filter.id(), registered.cached))
            })
            .collect()
    }

    pub fn masks(&self) -> &MaskSet {
        &self.masks
    }

    /// Run the filters applying to `path` (with manifest path `relative`).
    pub fn apply(&self, path: &Path, relative: &str) -> crate::Result<Processed> {
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let filters = match self.filters.get(&extension) {
            Some(filters) if self.masks.matches(relative, false) => filters,
            _ => return Ok(Processed::Original(path.to_path_buf())),
        };

        let mut content = fs::read(path)?;
        let mut cache_file = None;
        for registered in filters {
            if registered.cached {
                let cached = self.temp_dir.join(cache_key(registered.filter.as_ref(), &content));
                if cached.is_file() {
                    content = fs::read(&cached)?;
                } else {
                    if let Some(filtered) = registered.filter.filter(&content, path)? {
                        content = filtered;
                    }
                    fs::create_dir_all(&self.temp_dir)?;
                    fs::write(&cached, &content)?;
                }
                cache_file = Some(cached);
            } else {
                if let Some(filtered) = registered.filter.filter(&content, path)? {
                    content = filtered;
                }
                cache_file = None;
            }
        }

        match cache_file {
            Some(cached) => Ok(Processed::Cached(cached)),
            None => {
                fs::create_dir_all(&self.temp_dir)?;
                let mut temp = tempfile::Builder::new()
                    .prefix("deploy")
                    .tempfile_in(&self.temp_dir)?;
                temp.write_all(&content)?;
                temp.flush()?;
                Ok(Processed::Temporary(temp))
            }
        }
    }
}

fn cache_key(filter: &dyn ContentFilter, content: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(filter.id().as_bytes());
    hasher.update([0u8]);
    hasher.update(content);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn uppercase(content: &[u8], _: &Path) -> crate::Result<Option<Vec<u8>>> {
        Ok(Some(content.to_ascii_uppercase()))
    }

    fn filters(temp: &Path, masks: &[&str]) -> ContentFilters {
        ContentFilters::new(MaskSet::new(masks).unwrap(), temp.join("cache"))
    }

    #[test]
    fn test_unmatched_files_are_untouched() -> crate::Result<()> {
        let dir = TempDir::new()?;
        let file = dir.path().join("page.html");
        fs::write(&file, b"hello")?;

        let mut filters = filters(dir.path(), &["*.js"]);
        filters.add("js", Arc::new(uppercase), false);

        let processed = filters.apply(&file, "/page.html")?;
        assert!(!processed.is_filtered());
        assert_eq!(processed.path(), file.as_path());
        Ok(())
    }

    #[test]
    fn test_filter_writes_temporary_file() -> crate::Result<()> {
        let dir = TempDir::new()?;
        let file = dir.path().join("app.JS");
        fs::write(&file, b"let a;")?;

        let mut filters = filters(dir.path(), &["*.js"]);
        filters.add(".js", Arc::new(uppercase), false);

        let processed = filters.apply(&file, "/app.JS")?;
        assert!(matches!(processed, Processed::Temporary(_)));
        assert_eq!(fs::read(processed.path())?, b"LET A;");
        assert_eq!(fs::read(&file)?, b"let a;");
        Ok(())
    }

    #[test]
    fn test_cached_filter_runs_once() -> crate::Result<()> {
        let dir = TempDir::new()?;
        let file = dir.path().join("site.css");
        fs::write(&file, b"body{}")?;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut filters = filters(dir.path(), &["*.css"]);
        filters.add(
            "css",
            Arc::new(move |content: &[u8], _: &Path| -> crate::Result<Option<Vec<u8>>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some(content.to_ascii_uppercase()))
            }),
            true,
        );

        let first = filters.apply(&file, "/site.css")?;
        let second = filters.apply(&file, "/site.css")?;

        assert!(matches!(first, Processed::Cached(_)));
        assert_eq!(first.path(), second.path());
        assert_eq!(fs::read(second.path())?, b"BODY{}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_cache_is_keyed_by_filter() -> crate::Result<()> {
        let dir = TempDir::new()?;
        let file = dir.path().join("site.css");
        fs::write(&file, b"body{}")?;

        let mut upper = filters(dir.path(), &["*.css"]);
        upper.add("css", Arc::new(CommandFilter::new("tr a-z A-Z")), true);
        let mut suffixed = filters(dir.path(), &["*.css"]);
        suffixed.add("css", Arc::new(CommandFilter::new("sed 's/$/x/'")), true);

        let first = upper.apply(&file, "/site.css")?;
        let second = suffixed.apply(&file, "/site.css")?;

        assert_ne!(first.path(), second.path());
        assert_eq!(fs::read(first.path())?, b"BODY{}");
        assert_eq!(fs::read(second.path())?, b"body{}x");
        Ok(())
    }

    #[test]
    fn test_identities() {
        let dir = TempDir::new().unwrap();
        let mut filters = filters(dir.path(), &["*.js"]);
        filters.add("js", Arc::new(CommandFilter::new("uglifyjs")), true);
        filters.add("css", Arc::new(CommandFilter::new("cleancss")), false);

        assert_eq!(
            filters.identities(),
            vec![
                ("css".to_string(), "command:cleancss".to_string(), false),
                ("js".to_string(), "command:uglifyjs".to_string(), true),
            ]
        );
    }

    #[test]
    fn test_default_id_differs_per_instance() {
        let a: Arc<dyn ContentFilter> = Arc::new(uppercase);
        let b: Arc<dyn ContentFilter> = Arc::new(uppercase);
        assert_eq!(a.id(), a.id());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_command_filter() -> crate::Result<()> {
        let filter = CommandFilter::new("tr a-z A-Z");
        let output = filter.filter(b"minify me", Path::new("/x.js"))?;
        assert_eq!(output.as_deref(), Some(&b"MINIFY ME"[..]));
        Ok(())
    }

    #[test]
    fn test_failing_command_leaves_content_unchanged() -> crate::Result<()> {
        let filter = CommandFilter::new("exit 1");
        assert_eq!(filter.filter(b"x", Path::new("/x.js"))?, None);
        Ok(())
    }
}
