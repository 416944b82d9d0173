//! `Filter`: a boolean criterion over `ArchivePath`.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::path::ArchivePath;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    Everything,
    Nothing,
    Prefix(String),
    /// Stored as the regex source; compiled lazily and cached by callers
    /// that evaluate it repeatedly (the regex itself isn't serializable).
    Regex(String),
}

impl Filter {
    pub fn matches(&self, path: &ArchivePath) -> bool {
        match self {
            Filter::Everything => true,
            Filter::Nothing => false,
            Filter::Prefix(prefix) => path.as_str().starts_with(prefix.as_str()),
            Filter::Regex(pattern) => Regex::new(pattern)
                .map(|re| re.is_match(path.as_str()))
                .unwrap_or(false),
        }
    }

    /// Filters are closed under intersection. `Nothing` absorbs everything;
    /// `Everything` is the identity.
    pub fn reduce(&self, other: &Filter) -> Filter {
        if self == other {
            return self.clone();
        }
        match (self, other) {
            (Filter::Nothing, _) | (_, Filter::Nothing) => Filter::Nothing,
            (Filter::Everything, f) | (f, Filter::Everything) => f.clone(),
            (Filter::Prefix(p1), Filter::Prefix(p2)) => {
                if p1.starts_with(p2.as_str()) {
                    Filter::Prefix(p1.clone())
                } else if p2.starts_with(p1.as_str()) {
                    Filter::Prefix(p2.clone())
                } else {
                    Filter::Nothing
                }
            }
            // Two different regexes (or a regex and a prefix) have no closed-form
            // intersection in this representation. Wrap each side in a
            // zero-width lookahead so both must hold at once, rather than
            // concatenating the patterns (which would test them against
            // disjoint parts of the string instead of ANDing them).
            (a, b) => Filter::Regex(format!(
                "(?=.*(?:{}))(?=.*(?:{}))",
                a.as_regex_source(),
                b.as_regex_source()
            )),
        }
    }

    /// A filter matching every path except `path` itself. Reducing a
    /// filter against this is how `Predicate::mark_satisfied` narrows a
    /// filter around one just-received file instead of retiring it.
    pub fn excluding(path: &ArchivePath) -> Filter {
        Filter::Regex(format!("^(?!{}$).*$", regex::escape(path.as_str())))
    }

    fn as_regex_source(&self) -> String {
        match self {
            Filter::Everything => ".*".to_string(),
            Filter::Nothing => "$.^".to_string(),
            Filter::Prefix(p) => format!("^{}", regex::escape(p)),
            Filter::Regex(r) => r.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> ArchivePath {
        ArchivePath::new(s).unwrap()
    }

    #[test]
    fn everything_and_nothing() {
        assert!(Filter::Everything.matches(&path("a/b")));
        assert!(!Filter::Nothing.matches(&path("a/b")));
    }

    #[test]
    fn prefix_matches() {
        let f = Filter::Prefix("a/".to_string());
        assert!(f.matches(&path("a/b.txt")));
        assert!(!f.matches(&path("c/b.txt")));
    }

    #[test]
    fn reduce_nothing_absorbs() {
        let f = Filter::Prefix("a/".to_string()).reduce(&Filter::Nothing);
        assert!(matches!(f, Filter::Nothing));
    }

    #[test]
    fn reduce_everything_is_identity() {
        let f = Filter::Everything.reduce(&Filter::Prefix("a/".to_string()));
        assert!(matches!(f, Filter::Prefix(p) if p == "a/"));
    }

    #[test]
    fn reduce_nested_prefixes_picks_the_narrower() {
        let f = Filter::Prefix("a/".to_string()).reduce(&Filter::Prefix("a/b/".to_string()));
        assert!(matches!(f, Filter::Prefix(p) if p == "a/b/"));
    }

    #[test]
    fn reduce_two_regexes_requires_both_not_either() {
        let f = Filter::Regex("^a/".to_string()).reduce(&Filter::Regex(r"\.txt$".to_string()));
        assert!(f.matches(&path("a/b.txt")));
        assert!(!f.matches(&path("a/b.bin")));
        assert!(!f.matches(&path("c/b.txt")));
    }

    #[test]
    fn excluding_blocks_only_the_named_path() {
        let f = Filter::excluding(&path("a/x"));
        assert!(!f.matches(&path("a/x")));
        assert!(f.matches(&path("a/y")));
    }

    #[test]
    fn reduce_narrows_prefix_around_excluded_path() {
        let f = Filter::Prefix("a/".to_string()).reduce(&Filter::excluding(&path("a/x")));
        assert!(!f.matches(&path("a/x")));
        assert!(f.matches(&path("a/y")));
        assert!(!f.matches(&path("b/y")));
    }
}
