//! `Predicate`: a node's declarative interest, a (possibly mutable)
//! collection of `Filter`s plus the set of filters already satisfied.
//! Owned by the `ClearingHouse`; handed over the wire at Peer handshake
//! time.

use serde::{Deserialize, Serialize};

use super::filter::Filter;
use super::path::ArchivePath;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Predicate {
    /// Filters narrow in place as matching files complete (see
    /// `mark_satisfied`) instead of being retired wholesale: a broad
    /// filter like `Everything` or `Prefix("a/")` keeps matching any
    /// other path under it once the file just received is excluded.
    filters: Vec<Filter>,
    /// Index `i` is `true` once narrowing has reduced `filters[i]` all
    /// the way down to `Filter::Nothing`, i.e. it can no longer match
    /// anything. `active_filters` skips such entries.
    satisfied: Vec<bool>,
}

impl Predicate {
    pub fn nothing() -> Self {
        Self {
            filters: vec![Filter::Nothing],
            satisfied: vec![false],
        }
    }

    pub fn everything() -> Self {
        Self {
            filters: vec![Filter::Everything],
            satisfied: vec![false],
        }
    }

    pub fn from_filters(filters: Vec<Filter>) -> Self {
        let satisfied = vec![false; filters.len()];
        Self { filters, satisfied }
    }

    pub fn is_nothing(&self) -> bool {
        self.active_filters().all(|f| matches!(f, Filter::Nothing))
    }

    fn active_filters(&self) -> impl Iterator<Item = &Filter> {
        self.filters
            .iter()
            .zip(self.satisfied.iter())
            .filter(|(_, sat)| !**sat)
            .map(|(f, _)| f)
    }

    /// True if `path` is still wanted: matches some not-yet-satisfied filter.
    pub fn matches(&self, path: &ArchivePath) -> bool {
        self.active_filters().any(|f| f.matches(path))
    }

    /// Narrows every currently-unsatisfied filter matching `path` around
    /// that one path, via `Filter::reduce`, instead of retiring it: a
    /// filter only becomes (and stays) satisfied once narrowing has
    /// reduced it to `Filter::Nothing`, so a broad filter keeps matching
    /// other not-yet-seen paths after this file is received.
    pub fn mark_satisfied(&mut self, path: &ArchivePath) {
        for (filter, sat) in self.filters.iter_mut().zip(self.satisfied.iter_mut()) {
            if *sat || !filter.matches(path) {
                continue;
            }
            let narrowed = filter.reduce(&Filter::excluding(path));
            *sat = matches!(narrowed, Filter::Nothing);
            *filter = narrowed;
        }
    }

    pub fn is_fully_satisfied(&self) -> bool {
        self.satisfied.iter().all(|s| *s)
    }
}
