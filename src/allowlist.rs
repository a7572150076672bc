//! Merged domain allow-list
//!
//! The set of domains the gateway accepts mail and allocations for is the
//! union of the static list (boot-time environment) and the dynamic store
//! set `config:domains`. Static members can never be removed at runtime.

use std::collections::BTreeSet;

use crate::errors::{AppError, AppResult};

/// Union of static and dynamic allow-listed domains
///
/// Domains are held lower-cased; membership checks normalize their input
/// the same way. Rebuilt from the store on each ingestion cycle and on
/// each API read that needs it, so dynamic additions win without restart.
#[derive(Debug, Clone)]
pub struct AllowList {
    static_domains: BTreeSet<String>,
    dynamic_domains: BTreeSet<String>,
}

impl AllowList {
    /// Build from the static configuration list
    pub fn from_static(domains: &[String]) -> Self {
        Self {
            static_domains: domains.iter().map(|d| normalize(d)).collect(),
            dynamic_domains: BTreeSet::new(),
        }
    }

    /// Replace the dynamic layer with a fresh read of `config:domains`
    pub fn set_dynamic(&mut self, domains: impl IntoIterator<Item = String>) {
        self.dynamic_domains = domains.into_iter().map(|d| normalize(&d)).collect();
    }

    /// Whether a domain is on the merged list
    pub fn contains(&self, domain: &str) -> bool {
        let domain = normalize(domain);
        self.static_domains.contains(&domain) || self.dynamic_domains.contains(&domain)
    }

    /// Whether a domain belongs to the static (irremovable) layer
    pub fn is_static(&self, domain: &str) -> bool {
        self.static_domains.contains(&normalize(domain))
    }

    /// The merged list, sorted, for the `/domains` payload
    pub fn merged(&self) -> Vec<String> {
        self.static_domains
            .union(&self.dynamic_domains)
            .cloned()
            .collect()
    }

    /// Validate a domain for allocation, with a typed rejection
    pub fn require(&self, domain: &str) -> AppResult<String> {
        let normalized = normalize(domain);
        if normalized.is_empty() || !self.contains(&normalized) {
            return Err(AppError::InvalidInput(format!(
                "domain '{domain}' is not served here"
            )));
        }
        Ok(normalized)
    }
}

fn normalize(domain: &str) -> String {
    domain.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::AllowList;

    fn allow_list() -> AllowList {
        let mut list = AllowList::from_static(&["Catty.My.Id".to_owned()]);
        list.set_dynamic(["extra.example".to_owned()]);
        list
    }

    #[test]
    fn merges_static_and_dynamic_case_insensitively() {
        let list = allow_list();
        assert!(list.contains("catty.my.id"));
        assert!(list.contains("CATTY.MY.ID"));
        assert!(list.contains("extra.example"));
        assert!(!list.contains("evil.com"));
        assert_eq!(list.merged(), vec!["catty.my.id", "extra.example"]);
    }

    #[test]
    fn static_membership_survives_dynamic_replacement() {
        let mut list = allow_list();
        list.set_dynamic(std::iter::empty());
        assert!(list.contains("catty.my.id"));
        assert!(!list.contains("extra.example"));
        assert!(list.is_static("catty.my.id"));
        assert!(!list.is_static("extra.example"));
    }

    #[test]
    fn require_rejects_unknown_domains() {
        let list = allow_list();
        assert_eq!(list.require(" Catty.My.Id ").unwrap(), "catty.my.id");
        assert!(list.require("evil.com").is_err());
        assert!(list.require("").is_err());
    }
}
