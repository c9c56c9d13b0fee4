//! Deployment manifest.
//!
//! A manifest records every deployed path with its content hash, or a
//! directory marker for directories. Paths start with `/` and directory
//! paths end with `/`. Entries are kept in byte order of their paths, which
//! places every directory before its children and keeps each subtree
//! contiguous. Byte order is not name order: `.` and `-` sort below `/`, so
//! `/b.txt` and `/b-x/` come before `/b/`. That only moves siblings around a
//! subtree and the walk stays pre-order.

pub mod codec;

use std::collections::BTreeMap;

pub use codec::{decode, encode, Compression};

/// Value stored for a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEntry {
    Directory,
    File(String),
}

impl ManifestEntry {
    pub fn is_directory(&self) -> bool {
        matches!(self, ManifestEntry::Directory)
    }
}

/// Ordered map of relative path to [`ManifestEntry`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

/// Paths that must change remotely to match a local manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// New or changed paths, in manifest order.
    pub to_upload: Vec<String>,
    /// Paths present remotely only; always empty when deleting is disabled.
    pub to_delete: Vec<String>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.to_upload.is_empty() && self.to_delete.is_empty()
    }
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, entry: ManifestEntry) {
        self.entries.insert(path.into(), entry);
    }

    pub fn insert_directory(&mut self, path: impl Into<String>) {
        self.insert(path, ManifestEntry::Directory);
    }

    pub fn insert_file(&mut self, path: impl Into<String>, hash: impl Into<String>) {
        self.insert(path, ManifestEntry::File(hash.into()));
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<ManifestEntry> {
        self.entries.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ManifestEntry)> {
        self.entries.iter().map(|(path, entry)| (path.as_str(), entry))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Returns whether any entry lives strictly below the directory `prefix`.
    pub fn has_descendants(&self, prefix: &str) -> bool {
        self.entries
            .range::<str, _>((std::ops::Bound::Excluded(prefix), std::ops::Bound::Unbounded))
            .next()
            .is_some_and(|(path, _)| path.starts_with(prefix))
    }

    /// Compare this (local) manifest against `remote`.
    ///
    /// `to_upload` lists local paths whose entry differs from, or is missing
    /// in, `remote`. `to_delete` lists remote-only paths when `allow_delete`.
    pub fn diff(&self, remote: &Manifest, allow_delete: bool) -> Diff {
        let to_upload = self
            .entries
            .iter()
            .filter(|(path, entry)| remote.get(path) != Some(*entry))
            .map(|(path, _)| path.clone())
            .collect();

        let to_delete = if allow_delete {
            remote
                .paths()
                .filter(|path| !self.contains(path))
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        Diff {
            to_upload,
            to_delete,
        }
    }
}

impl FromIterator<(String, ManifestEntry)> for Manifest {
    fn from_iter<I: IntoIterator<Item = (String, ManifestEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Manifest key for the deployment file itself, e.g. `/.htdeployment`.
pub fn deployment_file_key(deployment_file: &str) -> String {
    format!("/{}", deployment_file.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn file(hash: &str) -> ManifestEntry {
        ManifestEntry::File(hash.to_string())
    }

    #[test]
    fn test_diff_scenario() {
        let mut local = Manifest::new();
        local.insert_file("/a.txt", "h1");
        local.insert_directory("/b/");
        local.insert_file("/b/c.txt", "h2");

        let mut remote = Manifest::new();
        remote.insert_file("/a.txt", "h1");
        remote.insert_file("/old.txt", "h0");

        let diff = local.diff(&remote, true);
        assert_eq!(diff.to_upload, vec!["/b/", "/b/c.txt"]);
        assert_eq!(diff.to_delete, vec!["/old.txt"]);

        let diff = local.diff(&remote, false);
        assert!(diff.to_delete.is_empty());
    }

    #[test]
    fn test_changed_hash_is_uploaded() {
        let mut local = Manifest::new();
        local.insert_file("/index.html", "new");
        let mut remote = Manifest::new();
        remote.insert_file("/index.html", "old");

        assert_eq!(local.diff(&remote, true).to_upload, vec!["/index.html"]);
    }

    #[test]
    fn test_equality_ignores_insertion_order() {
        let mut a = Manifest::new();
        a.insert_file("/x", "1");
        a.insert_directory("/d/");
        let mut b = Manifest::new();
        b.insert_directory("/d/");
        b.insert_file("/x", "1");

        assert_eq!(a, b);
        assert!(a.diff(&b, true).is_empty());
    }

    #[test]
    fn test_directories_precede_children() {
        let mut manifest = Manifest::new();
        manifest.insert_file("/b/c.txt", "h");
        manifest.insert_file("/b.txt", "h");
        manifest.insert_directory("/b/");
        manifest.insert_file("/b/a/z.txt", "h");
        manifest.insert_directory("/b/a/");

        let paths: Vec<&str> = manifest.paths().collect();
        assert_eq!(paths, vec!["/b.txt", "/b/", "/b/a/", "/b/a/z.txt", "/b/c.txt"]);
    }

    #[test]
    fn test_sibling_prefix_does_not_split_subtree() {
        let mut manifest = Manifest::new();
        manifest.insert_directory("/b/");
        manifest.insert_file("/b/x", "h");
        manifest.insert_directory("/b-x/");
        manifest.insert_file("/b-x/y", "h");
        manifest.insert_file("/b.txt", "h");
        manifest.insert_file("/b0", "h");

        let paths: Vec<&str> = manifest.paths().collect();
        assert_eq!(paths, vec!["/b-x/", "/b-x/y", "/b.txt", "/b/", "/b/x", "/b0"]);
    }

    #[test]
    fn test_has_descendants() {
        let mut manifest = Manifest::new();
        manifest.insert_directory("/a/");
        manifest.insert_file("/a/x", "h");
        manifest.insert_directory("/ab/");

        assert!(manifest.has_descendants("/a/"));
        assert!(!manifest.has_descendants("/ab/"));
    }

    #[test]
    fn test_deployment_file_key() {
        assert_eq!(deployment_file_key(".htdeployment"), "/.htdeployment");
        assert_eq!(deployment_file_key("/.htdeployment"), "/.htdeployment");
    }

    fn arb_manifest() -> impl Strategy<Value = Manifest> {
        prop::collection::btree_map("/[a-d]{1,2}", prop::option::of("[0-2]"), 0..12).prop_map(|map| {
            map.into_iter()
                .map(|(path, hash)| match hash {
                    Some(hash) => (path, file(&hash)),
                    None => (format!("{path}/"), ManifestEntry::Directory),
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_upload_is_exactly_changed_keys(local in arb_manifest(), remote in arb_manifest()) {
            let diff = local.diff(&remote, true);
            for (path, entry) in local.iter() {
                let changed = remote.get(path) != Some(entry);
                prop_assert_eq!(diff.to_upload.iter().any(|p| p == path), changed);
            }
            prop_assert!(diff.to_upload.iter().all(|p| local.contains(p)));
        }

        #[test]
        fn prop_delete_is_remote_minus_local(local in arb_manifest(), remote in arb_manifest()) {
            let diff = local.diff(&remote, true);
            let expected: Vec<&str> = remote.paths().filter(|p| !local.contains(p)).collect();
            prop_assert_eq!(diff.to_delete.iter().map(String::as_str).collect::<Vec<_>>(), expected);
            prop_assert!(local.diff(&remote, false).to_delete.is_empty());
        }

        #[test]
        fn prop_self_diff_is_empty(manifest in arb_manifest()) {
            prop_assert!(manifest.diff(&manifest, true).is_empty());
        }
    }
}
