//! Local tree scanning.
//!
//! Walks the local root in name order and builds the local [`Manifest`],
//! applying ignore and include masks on the way down.

use crate::fs::mask::MaskSet;
use crate::manifest::Manifest;
use crate::utils::logger::{Logger, Tone};
use std::path::Path;
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Masks applied while scanning.
#[derive(Debug, Clone, Copy)]
pub struct ScanMasks<'a> {
    /// Matching entries are skipped (and directories not descended).
    pub ignore: &'a MaskSet,

    /// When non-empty, only matching entries are kept.
    pub include: &'a MaskSet,
}

/// What the scan does with a single entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Ignored,
    NotIncluded,
    Included,
    /// Directory kept only because an include mask may match below it.
    Provisional,
}

fn classify(relative: &str, is_dir: bool, masks: &ScanMasks<'_>) -> Admission {
    if masks.ignore.matches(relative, is_dir) {
        return Admission::Ignored;
    }
    if masks.include.is_empty() || masks.include.matches(relative, is_dir) {
        return Admission::Included;
    }
    if is_dir && masks.include.may_contain(relative) {
        return Admission::Provisional;
    }
    Admission::NotIncluded
}

/// Relative manifest path of `path` below `root`, starting with `/`.
pub fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let mut key = String::new();
    for component in relative.components() {
        key.push('/');
        key.push_str(&component.as_os_str().to_string_lossy());
    }
    key
}

/// Walk `root` and build its manifest.
///
/// Directories are recorded as `/dir/` markers; files are recorded with the
/// value returned by `hash` for `(absolute path, relative path)`. Unreadable
/// entries are skipped with a warning.
///
/// # Example
/// ```no_run
/// use deploy_engine::fs::{hash::hash_file, mask::MaskSet, walker::{scan_tree, ScanMasks}};
/// use deploy_engine::utils::TracingLogger;
/// use std::path::Path;
///
/// let ignore = MaskSet::new(&["*.bak"]).unwrap();
/// let include = MaskSet::default();
/// let masks = ScanMasks { ignore: &ignore, include: &include };
/// let manifest = scan_tree(Path::new("/srv/www"), masks, &TracingLogger::new(false), |path, _| {
///     Ok(hash_file(path)?)
/// })
/// .unwrap();
/// println!("Found {} entries", manifest.len());
/// ```
pub fn scan_tree<F>(
    root: &Path,
    masks: ScanMasks<'_>,
    logger: &dyn Logger,
    mut hash: F,
) -> crate::Result<Manifest>
where
    F: FnMut(&Path, &str) -> crate::Result<String>,
{
    let mut manifest = Manifest::new();
    let mut provisional = Vec::new();
    let mut counter = 0usize;

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| admit(entry, root, &masks, logger));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };

        counter += 1;
        logger.progress(&".".repeat(counter % 40));

        let relative = relative_path(root, entry.path());
        if entry.file_type().is_dir() {
            let key = format!("{relative}/");
            if classify(&relative, true, &masks) == Admission::Provisional {
                provisional.push(key.clone());
            }
            manifest.insert_directory(key);
        } else if entry.file_type().is_file() {
            let digest = hash(entry.path(), &relative)?;
            manifest.insert_file(relative, digest);
        }
    }

    // Deepest first, so nested provisional directories are settled before their parents.
    for key in provisional.iter().rev() {
        if !manifest.has_descendants(key) {
            manifest.remove(key);
        }
    }

    Ok(manifest)
}

fn admit(entry: &DirEntry, root: &Path, masks: &ScanMasks<'_>, logger: &dyn Logger) -> bool {
    let relative = relative_path(root, entry.path());
    match classify(&relative, entry.file_type().is_dir(), masks) {
        Admission::Ignored => {
            logger.log(&format!("Ignoring .{relative}"), Tone::Muted);
            false
        }
        Admission::NotIncluded => {
            logger.log(&format!("Not included .{relative}"), Tone::Muted);
            false
        }
        Admission::Included | Admission::Provisional => true,
    }
}
