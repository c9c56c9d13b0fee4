//! Ignore/include masks.
//!
//! Masks follow a gitignore-flavoured syntax and the last matching pattern
//! wins, so a later `!pattern` re-includes what an earlier one excluded:
//!
//! - `*.bak` (no separator) matches the final path component anywhere;
//! - `/log` or `temp/*` (separator) match the leading path components;
//! - `vendor/` (trailing separator) matches everything below `vendor`
//!   but not `vendor` itself.
//!
//! Matching is case-insensitive and `*`/`?` never cross a `/`.

use crate::utils::errors::MaskError;
use globset::{GlobBuilder, GlobMatcher};

#[derive(Debug, Clone)]
struct Mask {
    negated: bool,
    kind: MaskKind,
}

#[derive(Debug, Clone)]
enum MaskKind {
    Basename(GlobMatcher),
    Path {
        directory_only: bool,
        /// `prefixes[k]` matches the first `k + 1` components of the pattern.
        prefixes: Vec<GlobMatcher>,
    },
}

/// Compiled list of mask patterns.
#[derive(Debug, Clone, Default)]
pub struct MaskSet {
    patterns: Vec<String>,
    masks: Vec<Mask>,
}

impl MaskSet {
    /// Compile `patterns` in order. Empty patterns are skipped.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, MaskError> {
        let mut masks = Vec::with_capacity(patterns.len());
        for raw in patterns {
            if let Some(mask) = compile_mask(raw.as_ref())? {
                masks.push(mask);
            }
        }

        Ok(Self {
            patterns: patterns.iter().map(|p| p.as_ref().to_string()).collect(),
            masks,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    /// Source patterns, as given.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Returns whether `path` (relative, `/`-rooted) is matched by the set.
    pub fn matches(&self, path: &str, is_dir: bool) -> bool {
        let normalized = path.replace('\\', "/");
        let components: Vec<&str> = normalized.trim_matches('/').split('/').collect();

        let mut result = false;
        for mask in &self.masks {
            match &mask.kind {
                MaskKind::Basename(glob) => {
                    let name = components.last().copied().unwrap_or_default();
                    if glob.is_match(name) {
                        result = !mask.negated;
                    }
                }
                MaskKind::Path {
                    directory_only,
                    prefixes,
                } => {
                    let depth = prefixes.len();
                    if *directory_only && components.len() <= depth {
                        continue;
                    }

                    // A negated pattern must not prune the directories leading to it.
                    let width = if mask.negated && is_dir {
                        depth.min(components.len())
                    } else {
                        depth
                    };
                    let subject = components[..depth.min(components.len())].join("/");
                    if prefixes[width - 1].is_match(&subject) {
                        result = !mask.negated;
                    }
                }
            }
        }

        result
    }

    /// Returns whether some non-negated pattern could match an entry below
    /// the directory `path`, even though it does not match `path` itself.
    pub fn may_contain(&self, path: &str) -> bool {
        let normalized = path.replace('\\', "/");
        let components: Vec<&str> = normalized.trim_matches('/').split('/').collect();

        self.masks.iter().filter(|mask| !mask.negated).any(|mask| match &mask.kind {
            MaskKind::Basename(_) => true,
            MaskKind::Path { prefixes, .. } => {
                components.len() < prefixes.len()
                    && prefixes[components.len() - 1].is_match(components.join("/"))
            }
        })
    }
}

/// Matches a single path against `patterns`, compiling them on the fly.
///
/// # Example
/// ```
/// use deploy_engine::fs::mask::match_mask;
///
/// assert!(!match_mask("/src/app.min.js", &["*.js", "!*.min.js"], false).unwrap());
/// assert!(match_mask("/vendor/x", &["vendor/"], true).unwrap());
/// ```
pub fn match_mask<S: AsRef<str>>(path: &str, patterns: &[S], is_dir: bool) -> Result<bool, MaskError> {
    Ok(MaskSet::new(patterns)?.matches(path, is_dir))
}

fn compile_mask(raw: &str) -> Result<Option<Mask>, MaskError> {
    let normalized = raw.trim().replace('\\', "/");
    let (negated, pattern) = match normalized.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, normalized.as_str()),
    };
    if pattern.is_empty() {
        return Ok(None);
    }

    if !pattern.contains('/') {
        return Ok(Some(Mask {
            negated,
            kind: MaskKind::Basename(compile_glob(pattern, raw)?),
        }));
    }

    let directory_only = pattern.ends_with('/');
    let core = if directory_only {
        pattern.trim_matches('/')
    } else {
        pattern.trim_start_matches('/')
    };
    if core.is_empty() {
        return Ok(None);
    }

    let parts: Vec<&str> = core.split('/').collect();
    let mut prefixes = Vec::with_capacity(parts.len());
    for width in 1..=parts.len() {
        prefixes.push(compile_glob(&parts[..width].join("/"), raw)?);
    }

    Ok(Some(Mask {
        negated,
        kind: MaskKind::Path {
            directory_only,
            prefixes,
        },
    }))
}

fn compile_glob(pattern: &str, original: &str) -> Result<GlobMatcher, MaskError> {
    let glob = GlobBuilder::new(pattern)
        .case_insensitive(true)
        .literal_separator(true)
        .build()
        .map_err(|error| MaskError::new(original, error))?;
    Ok(glob.compile_matcher())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(path: &str, patterns: &[&str], is_dir: bool) -> bool {
        match_mask(path, patterns, is_dir).unwrap()
    }

    #[test]
    fn test_later_negation_wins() {
        assert!(!matches("/src/app.min.js", &["*.js", "!*.min.js"], false));
        assert!(matches("/src/app.js", &["*.js", "!*.min.js"], false));
        assert!(matches("/src/app.min.js", &["!*.min.js", "*.js"], false));
    }

    #[test]
    fn test_directory_pattern_needs_children() {
        assert!(matches("/vendor/x", &["vendor/"], true));
        assert!(matches("/vendor/x", &["vendor/"], false));
        assert!(!matches("/vendor", &["vendor/"], true));
        assert!(!matches("/vendor", &["vendor/"], false));
    }

    #[test]
    fn test_basename_is_case_insensitive() {
        assert!(matches("/a/b/Thumbs.DB", &["thumbs.db"], false));
        assert!(matches("/.gitignore", &[".git*"], false));
        assert!(matches("/deep/dir/.git", &[".git*"], true));
    }

    #[test]
    fn test_path_pattern_is_anchored() {
        assert!(matches("/log", &["/log"], true));
        assert!(matches("/log/today.txt", &["/log"], false));
        assert!(!matches("/app/log", &["/log"], true));
    }

    #[test]
    fn test_star_does_not_cross_separator() {
        assert!(matches("/temp/cache", &["temp/*"], true));
        assert!(!matches("/temp", &["temp/*"], true));
        assert!(!matches("/a/b/c", &["a/*c"], false));
    }

    #[test]
    fn test_negated_file_keeps_parent_directory() {
        let masks = ["temp/*", "!temp/.htaccess"];
        assert!(!matches("/temp", &masks, true));
        assert!(matches("/temp/cache", &masks, true));
        assert!(!matches("/temp/.htaccess", &masks, false));
    }

    #[test]
    fn test_character_classes() {
        assert!(matches("/project.ppj", &["project.pp[jx]"], false));
        assert!(matches("/project.ppx", &["project.pp[jx]"], false));
        assert!(!matches("/project.ppz", &["project.pp[jx]"], false));
    }

    #[test]
    fn test_backslash_separators_are_normalized() {
        assert!(matches("\\temp\\cache", &["temp\\*"], true));
    }

    #[test]
    fn test_no_patterns_never_match() {
        let empty: [&str; 0] = [];
        assert!(!matches("/anything", &empty, false));
        assert!(MaskSet::new(&empty).unwrap().is_empty());
    }

    #[test]
    fn test_may_contain() {
        let set = MaskSet::new(&["app/*.js"]).unwrap();
        assert!(set.may_contain("/app"));
        assert!(!set.may_contain("/lib"));
        assert!(!set.may_contain("/app/sub"));

        let basename = MaskSet::new(&["*.css"]).unwrap();
        assert!(basename.may_contain("/anything"));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = MaskSet::new(&["[abc"]).unwrap_err();
        assert_eq!(err.pattern(), "[abc");
    }
}
