//! Domain label sets with suffix matching.

use rustc_hash::FxHashSet;

/// Iterate over `name` and each of its parent domains.
///
/// A single trailing root dot is ignored. `"www.example.com"` yields
/// `"www.example.com"`, `"example.com"`, `"com"`.
pub fn suffixes(name: &str) -> Suffixes<'_> {
    let name = name.strip_suffix('.').unwrap_or(name);
    Suffixes {
        rest: (!name.is_empty()).then_some(name),
    }
}

/// Iterator returned by [`suffixes`].
#[derive(Debug, Clone)]
pub struct Suffixes<'a> {
    rest: Option<&'a str>,
}

impl<'a> Iterator for Suffixes<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let current = self.rest?;
        self.rest = current.find('.').map(|pos| &current[pos + 1..]);
        Some(current)
    }
}

/// A set of normalized domains for efficient suffix lookup.
#[derive(Debug, Clone, Default)]
pub struct DomainSet {
    domains: FxHashSet<String>,
}

impl DomainSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a domain, lowercased and without a trailing root dot.
    pub fn insert(&mut self, domain: &str) {
        let domain = domain.trim();
        let domain = domain.strip_suffix('.').unwrap_or(domain);
        if !domain.is_empty() {
            self.domains.insert(domain.to_lowercase());
        }
    }

    /// Check whether `name` or any parent domain is in the set.
    ///
    /// Performs exact match and subdomain matching (e.g., matches
    /// "ads.example.com" if "example.com" is in the set).
    pub fn matches(&self, name: &str) -> bool {
        !self.domains.is_empty() && suffixes(name).any(|suffix| self.domains.contains(suffix))
    }

    /// Returns the number of domains in the set.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for DomainSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl<S: AsRef<str>> Extend<S> for DomainSet {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        for domain in iter {
            self.insert(domain.as_ref());
        }
    }
}
