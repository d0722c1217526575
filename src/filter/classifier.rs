//! Domain classification against the four curated lists.

use std::sync::Arc;

use arc_swap::ArcSwap;

use super::domains::DomainSet;

/// The four named label sets.
#[derive(Debug, Clone, Default)]
pub struct DomainLists {
    /// Domains resolved through the circumvention path (gfwlist).
    pub circumvention: DomainSet,
    /// Domains exempt from the circumvention path only.
    pub escape: DomainSet,
    /// Domains answered with the block address.
    pub block: DomainSet,
    /// Domains resolved through the redirect DoH resolver.
    pub redirect: DomainSet,
}

/// Result of classifying one name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Classification {
    pub is_redirect: bool,
    pub is_blocked: bool,
    pub is_circumvention: bool,
    pub is_escaped: bool,
}

/// Classifies names against the current [`DomainLists`].
///
/// Lists are replaced as a whole on reload, so a classification never
/// observes a half-updated set.
pub struct Classifier {
    lists: ArcSwap<DomainLists>,
}

impl Classifier {
    pub fn new(lists: DomainLists) -> Self {
        Self {
            lists: ArcSwap::from_pointee(lists),
        }
    }

    /// Replace all lists at once.
    pub fn reload(&self, lists: DomainLists) {
        self.lists.store(Arc::new(lists));
    }

    /// Snapshot of the lists currently in use.
    pub fn lists(&self) -> Arc<DomainLists> {
        self.lists.load_full()
    }

    pub fn classify(&self, name: &str) -> Classification {
        let lists = self.lists.load();
        let is_escaped = lists.escape.matches(name);

        Classification {
            is_redirect: lists.redirect.matches(name),
            is_blocked: lists.block.matches(name),
            is_circumvention: !is_escaped && lists.circumvention.matches(name),
            is_escaped,
        }
    }

    pub fn match_redirect(&self, name: &str) -> bool {
        self.lists.load().redirect.matches(name)
    }

    pub fn match_blocked(&self, name: &str) -> bool {
        self.lists.load().block.matches(name)
    }

    /// Escape entries short-circuit; they do not affect redirect or block.
    pub fn match_circumvention(&self, name: &str) -> bool {
        let lists = self.lists.load();
        if lists.escape.matches(name) {
            return false;
        }
        lists.circumvention.matches(name)
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(DomainLists::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier(
        circumvention: &[&str],
        escape: &[&str],
        block: &[&str],
        redirect: &[&str],
    ) -> Classifier {
        Classifier::new(DomainLists {
            circumvention: circumvention.iter().collect(),
            escape: escape.iter().collect(),
            block: block.iter().collect(),
            redirect: redirect.iter().collect(),
        })
    }

    #[test]
    fn escape_suppresses_circumvention() {
        let c = classifier(&["apple.com", "google.com"], &["apple.com"], &[], &[]);

        let result = c.classify("www.apple.com");

        assert!(!result.is_circumvention);
        assert!(result.is_escaped);
        assert!(!c.match_circumvention("www.apple.com"));
    }

    #[test]
    fn circumvention_matches_subdomains() {
        let c = classifier(&["google.com"], &[], &[], &[]);

        assert!(c.classify("dev.google.com").is_circumvention);
        assert!(c.match_circumvention("www.google.com."));
        assert!(!c.match_circumvention("google.cn"));
    }

    #[test]
    fn escape_does_not_affect_block_or_redirect() {
        let c = classifier(&[], &["example.com"], &["example.com"], &["example.com"]);

        let result = c.classify("a.example.com");

        assert!(result.is_blocked);
        assert!(result.is_redirect);
        assert!(!result.is_circumvention);
    }

    #[test]
    fn name_in_block_and_circumvention_reports_both() {
        let c = classifier(&["both.com"], &[], &["both.com"], &[]);

        let result = c.classify("x.both.com");

        assert!(result.is_blocked);
        assert!(result.is_circumvention);
    }

    #[test]
    fn unmatched_name_is_all_false() {
        let c = classifier(&["a.com"], &["b.com"], &["c.com"], &["d.com"]);

        assert_eq!(c.classify("example.org"), Classification::default());
    }

    #[test]
    fn reload_replaces_every_list() {
        let c = classifier(&["old.com"], &[], &["old-ads.com"], &[]);
        assert!(c.match_circumvention("old.com"));

        c.reload(DomainLists {
            circumvention: ["new.com"].into_iter().collect(),
            ..DomainLists::default()
        });

        assert!(!c.match_circumvention("old.com"));
        assert!(!c.match_blocked("old-ads.com"));
        assert!(c.match_circumvention("new.com"));
        assert_eq!(c.lists().circumvention.len(), 1);
    }
}
