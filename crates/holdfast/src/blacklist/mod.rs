mod update;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

pub use update::{parse_hosts_text, run_refresher, update_blacklist, BLACKLIST_SOURCES};

/// Domain names (lower case) and their resolved IP addresses that should be
/// blocked. Name queries against them are answered with the black hole, and
/// the relay refuses to dial them. The whole set is replaced atomically on
/// rebuild; readers never observe a partial update.
#[derive(Default)]
pub struct Blacklist {
    entries: RwLock<HashSet<String>>,
    updating: AtomicBool,
}

impl Blacklist {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns true only if the name or IP is black listed. A sub-domain
    /// name matches when any of its parent suffixes is listed.
    pub fn contains(&self, name_or_ip: &str) -> bool {
        // An exceedingly long input is treated as if it were listed.
        if name_or_ip.len() > 255 {
            return true;
        }
        let name_or_ip = name_or_ip.trim().to_lowercase();

        // Starting from the full name, strip the leftmost label to produce
        // parent-suffix candidates. Stripping an IP address is meaningless
        // but does no harm.
        let mut candidates: Vec<&str> = Vec::with_capacity(4);
        candidates.push(&name_or_ip);
        let mut remaining = name_or_ip.as_str();
        loop {
            let Some(index) = remaining.find('.') else {
                break;
            };
            if index < 1 || index == remaining.len() - 1 {
                break;
            }
            remaining = &remaining[index + 1..];
            if remaining.len() < 4 {
                // No real domain name is shorter than 4 characters
                continue;
            }
            candidates.push(remaining);
        }

        let entries = self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        candidates.iter().any(|candidate| entries.contains(*candidate))
    }

    /// Swaps in a freshly built entry set.
    pub fn replace(&self, new_entries: HashSet<String>) {
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *entries = new_entries;
    }

    /// Inserts a single entry. Large rebuilds go through [`replace`].
    pub fn insert(&self, entry: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(entry.trim().to_lowercase());
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims the exclusive right to rebuild. A second concurrent caller
    /// observes false and returns immediately instead of blocking.
    pub fn begin_update(&self) -> bool {
        self.updating.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    pub fn finish_update(&self) {
        self.updating.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blacklist_of(entries: &[&str]) -> Blacklist {
        let blacklist = Blacklist::new();
        blacklist.replace(entries.iter().map(|s| s.to_string()).collect());
        blacklist
    }

    #[test]
    fn matches_exact_and_parent_suffixes() {
        let blacklist = blacklist_of(&["example.com"]);
        assert!(blacklist.contains("example.com"));
        assert!(blacklist.contains("a.b.c.example.com"));
        assert!(!blacklist.contains("example.org"));
        assert!(!blacklist.contains("anexample.com"));
    }

    #[test]
    fn sibling_subdomains_do_not_match() {
        let blacklist = blacklist_of(&["c.example.com"]);
        assert!(blacklist.contains("a.b.c.example.com"));
        assert!(!blacklist.contains("b.example.com"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let blacklist = blacklist_of(&["github.com"]);
        assert!(blacklist.contains("GiThUb.CoM"));
    }

    #[test]
    fn overlong_names_are_treated_as_listed() {
        let blacklist = Blacklist::new();
        assert!(blacklist.contains(&"a".repeat(256)));
    }

    #[test]
    fn ip_addresses_match_verbatim() {
        let blacklist = blacklist_of(&["203.0.113.4"]);
        assert!(blacklist.contains("203.0.113.4"));
        assert!(!blacklist.contains("203.0.113.5"));
    }

    #[test]
    fn update_claim_is_singleflight() {
        let blacklist = Blacklist::new();
        assert!(blacklist.begin_update());
        assert!(!blacklist.begin_update());
        blacklist.finish_update();
        assert!(blacklist.begin_update());
    }
}
