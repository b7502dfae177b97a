use regex::Regex;
use std::path::Path;

use crate::helpers;

/// Predicate over configured exclude patterns. Patterns are matched against
/// the forward-slash rendering of the path.
pub struct ExcludeFilter {
    patterns: Vec<Regex>,
}

impl ExcludeFilter {
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        let candidate = helpers::to_specifier(path);
        self.patterns.iter().any(|pattern| pattern.is_match(&candidate))
    }

    pub fn is_not_excluded(&self, path: &Path) -> bool {
        !self.is_excluded(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(patterns: &[&str]) -> ExcludeFilter {
        ExcludeFilter::new(patterns.iter().map(|p| Regex::new(p).unwrap()).collect())
    }

    #[test]
    fn matches_any_configured_pattern() {
        let filter = filter(&[r"\.test\.ts$", r"/fixtures/"]);
        assert!(filter.is_excluded(Path::new("/src/a.test.ts")));
        assert!(filter.is_excluded(Path::new("/src/fixtures/data.ts")));
        assert!(filter.is_not_excluded(Path::new("/src/a.ts")));
    }

    #[test]
    fn empty_filter_excludes_nothing() {
        let filter = filter(&[]);
        assert!(filter.is_not_excluded(Path::new("/src/anything.ts")));
    }
}
