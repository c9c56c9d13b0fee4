//! Reuse of local scans between deployments of the same tree.
//!
//! Several configuration sections often deploy one local directory to
//! different targets. Scanning and hashing is the expensive part, so a scan is
//! reused whenever everything that influences its result is identical.

use crate::manifest::Manifest;
use std::collections::HashMap;
use std::path::PathBuf;

/// Everything that determines the outcome of a local scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanKey {
    pub root: PathBuf,
    pub ignore: Vec<String>,
    pub include: Vec<String>,
    pub preprocess: Vec<String>,
    /// `(extension, filter id, cached)` of every registered filter.
    pub filters: Vec<(String, String, bool)>,
    pub deployment_file: String,
}

#[derive(Debug, Default)]
pub struct ScanCache {
    scans: HashMap<ScanKey, Manifest>,
}

impl ScanCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ScanKey) -> Option<&Manifest> {
        self.scans.get(key)
    }

    pub fn insert(&mut self, key: ScanKey, manifest: Manifest) {
        self.scans.insert(key, manifest);
    }

    pub fn len(&self) -> usize {
        self.scans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ignore: &[&str]) -> ScanKey {
        ScanKey {
            root: PathBuf::from("/srv/site"),
            ignore: ignore.iter().map(|s| s.to_string()).collect(),
            include: Vec::new(),
            preprocess: Vec::new(),
            filters: Vec::new(),
            deployment_file: ".htdeployment".to_string(),
        }
    }

    #[test]
    fn test_lookup_requires_identical_key() {
        let mut manifest = Manifest::new();
        manifest.insert_file("/a.txt", "h");

        let mut cache = ScanCache::new();
        cache.insert(key(&["*.bak"]), manifest.clone());

        assert_eq!(cache.get(&key(&["*.bak"])), Some(&manifest));
        assert_eq!(cache.get(&key(&["*.bak", ".git*"])), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_filter_command_is_part_of_key() {
        let mut uglify = key(&[]);
        uglify.filters = vec![("js".to_string(), "command:uglifyjs".to_string(), true)];
        let mut terser = key(&[]);
        terser.filters = vec![("js".to_string(), "command:terser".to_string(), true)];

        let mut cache = ScanCache::new();
        cache.insert(uglify.clone(), Manifest::new());

        assert!(cache.get(&uglify).is_some());
        assert!(cache.get(&terser).is_none());
    }
}
