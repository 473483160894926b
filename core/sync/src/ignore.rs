//! Ignore predicates for local change events.

use glob::{MatchOptions, Pattern};
use std::path::Path;
use tracing::warn;

use remotesync_common::{Error, Result};

/// Decides whether a path relative to the local root is left out of sync.
///
/// Called for every filesystem event, so implementations must be cheap.
pub trait IgnorePredicate: Send + Sync {
    fn is_ignored(&self, relative: &Path) -> bool;
}

impl<F> IgnorePredicate for F
where
    F: Fn(&Path) -> bool + Send + Sync,
{
    fn is_ignored(&self, relative: &Path) -> bool {
        self(relative)
    }
}

/// Ignores nothing.
pub struct NoIgnore;

impl IgnorePredicate for NoIgnore {
    fn is_ignored(&self, _relative: &Path) -> bool {
        false
    }
}

/// Glob list matched against the whole relative path and each of its
/// components, so `node_modules` ignores that directory at any depth.
#[derive(Debug, Clone, Default)]
pub struct GlobIgnore {
    patterns: Vec<Pattern>,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl GlobIgnore {
    /// Compile the given globs.
    ///
    /// # Errors
    /// - `InvalidInput` naming the first pattern that does not compile
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                Pattern::new(p.trim_end_matches('/'))
                    .map_err(|e| Error::InvalidInput(format!("Bad ignore pattern '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Compile what compiles, logging the rest.
    pub fn lenient<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .filter_map(|p| match Pattern::new(p.as_ref().trim_end_matches('/')) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!("Skipping ignore pattern '{}': {}", p.as_ref(), e);
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl IgnorePredicate for GlobIgnore {
    fn is_ignored(&self, relative: &Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let whole = relative.to_string_lossy().replace('\\', "/");
        self.patterns.iter().any(|pattern| {
            pattern.matches_with(&whole, MATCH_OPTIONS)
                || relative
                    .components()
                    .any(|c| pattern.matches_with(&c.as_os_str().to_string_lossy(), MATCH_OPTIONS))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_and_full_path_matching() {
        let ignore = GlobIgnore::new([".git", "node_modules/", "*.tmp", "build/*.map"]).unwrap();
        assert!(ignore.is_ignored(Path::new(".git/HEAD")));
        assert!(ignore.is_ignored(Path::new("web/node_modules/react/index.js")));
        assert!(ignore.is_ignored(Path::new("docs/notes.tmp")));
        assert!(ignore.is_ignored(Path::new("build/app.js.map")));
        assert!(!ignore.is_ignored(Path::new("build/app.js")));
        assert!(!ignore.is_ignored(Path::new("src/main.rs")));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(GlobIgnore::new(["[unclosed"]), Err(Error::InvalidInput(_))));
        let lenient = GlobIgnore::lenient(["[unclosed", "*.log"]);
        assert!(lenient.is_ignored(Path::new("server.log")));
    }

    #[test]
    fn test_closure_predicate() {
        let predicate = |path: &Path| path.starts_with("private");
        assert!(predicate.is_ignored(Path::new("private/key.pem")));
        assert!(!NoIgnore.is_ignored(Path::new("private/key.pem")));
    }
}
