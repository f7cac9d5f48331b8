//! Term registry: active grants ordered by expiry.
//!
//! The registry is a plain sorted `Vec` and does no locking or firewall
//! work of its own; [`TermKeeper`](crate::keeper::TermKeeper) guards it
//! with an async mutex and drives the native calls around it.
//!
//! Grants are coalesced per [`TermKey`]: there is at most one entry for a
//! tuple, carrying the latest expiry granted for it.

use crate::firewall::RuleHandle;
use crate::term::{Term, TermKey};

/// A granted term and the handle needed to revoke its native rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTerm {
    pub term: Term,
    pub handle: RuleHandle,
}

/// What happened to a term offered to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// New entry; a native rule was installed for it.
    Inserted,
    /// An entry for the tuple existed and now lasts until the new expiry.
    Extended { previous: i64 },
    /// An entry for the tuple already lasts at least as long.
    Covered { expires_at: i64 },
}

#[derive(Debug, Default)]
pub struct TermRegistry {
    entries: Vec<ActiveTerm>,
}

impl TermRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest expiry in the registry.
    pub fn next_expiry(&self) -> Option<i64> {
        self.entries.first().map(|e| e.term.expires_at)
    }

    pub fn lookup(&self, key: &TermKey) -> Option<&ActiveTerm> {
        self.entries.iter().find(|e| e.term.key() == *key)
    }

    /// Fold `term` into an existing entry for its tuple, if there is one.
    ///
    /// Returns `None` when the tuple has no entry and a native rule must be
    /// installed before calling [`insert`](Self::insert).
    pub fn coalesce(&mut self, term: &Term) -> Option<Admission> {
        let key = term.key();
        let pos = self.entries.iter().position(|e| e.term.key() == key)?;

        let previous = self.entries[pos].term.expires_at;
        if term.expires_at <= previous {
            return Some(Admission::Covered {
                expires_at: previous,
            });
        }

        let mut entry = self.entries.remove(pos);
        entry.term.expires_at = term.expires_at;
        entry.term.source_port = term.source_port;
        self.place(entry);
        Some(Admission::Extended { previous })
    }

    /// Add a term whose native rule has just been installed.
    pub fn insert(&mut self, term: Term, handle: RuleHandle) -> Admission {
        if let Some(admission) = self.coalesce(&term) {
            return admission;
        }
        self.place(ActiveTerm { term, handle });
        Admission::Inserted
    }

    /// Remove and return every entry with `expires_at <= now`, earliest first.
    pub fn pop_expired(&mut self, now: i64) -> Vec<ActiveTerm> {
        let split = self.entries.partition_point(|e| e.term.is_expired(now));
        self.entries.drain(..split).collect()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<ActiveTerm> {
        std::mem::take(&mut self.entries)
    }

    pub fn snapshot(&self) -> Vec<Term> {
        self.entries.iter().map(|e| e.term.clone()).collect()
    }

    /// Insert after every entry expiring no later, so equal expiries keep
    /// arrival order. Most grants share one ttl and land at the tail, so the
    /// tail is checked before searching.
    fn place(&mut self, entry: ActiveTerm) {
        let expires_at = entry.term.expires_at;
        match self.entries.last() {
            Some(last) if last.term.expires_at > expires_at => {
                let idx = self
                    .entries
                    .partition_point(|e| e.term.expires_at <= expires_at);
                self.entries.insert(idx, entry);
            }
            _ => self.entries.push(entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::{Protocol, RULE_COMMENT};
    use proptest::prelude::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn term(host: u8, expires_at: i64) -> Term {
        Term {
            source: IpAddr::V4(Ipv4Addr::new(192, 0, 2, host)),
            source_port: 40000,
            destination: "10.0.0.5".parse().unwrap(),
            destination_port: 443,
            protocol: Protocol::Tcp,
            expires_at,
            comment: RULE_COMMENT.to_string(),
        }
    }

    fn expiries(registry: &TermRegistry) -> Vec<i64> {
        registry.snapshot().iter().map(|t| t.expires_at).collect()
    }

    #[test]
    fn out_of_order_inserts_are_sorted() {
        let mut registry = TermRegistry::new();
        for (host, exp) in [(1, 30), (2, 10), (3, 20), (4, 40), (5, 5)] {
            assert_eq!(
                registry.insert(term(host, exp), RuleHandle::Matched),
                Admission::Inserted
            );
        }
        assert_eq!(expiries(&registry), vec![5, 10, 20, 30, 40]);
        assert_eq!(registry.next_expiry(), Some(5));
    }

    #[test]
    fn equal_expiries_keep_arrival_order() {
        let mut registry = TermRegistry::new();
        registry.insert(term(1, 10), RuleHandle::Matched);
        registry.insert(term(2, 20), RuleHandle::Matched);
        registry.insert(term(3, 10), RuleHandle::Matched);
        let sources: Vec<_> = registry.snapshot().iter().map(|t| t.source).collect();
        assert_eq!(
            sources,
            vec![
                term(1, 0).source,
                term(3, 0).source,
                term(2, 0).source
            ]
        );
    }

    #[test]
    fn later_grant_extends_existing_entry() {
        let mut registry = TermRegistry::new();
        registry.insert(term(1, 10), RuleHandle::Matched);
        registry.insert(term(2, 15), RuleHandle::Matched);

        assert_eq!(
            registry.coalesce(&term(1, 30)),
            Some(Admission::Extended { previous: 10 })
        );
        assert_eq!(registry.len(), 2);
        assert_eq!(expiries(&registry), vec![15, 30]);
    }

    #[test]
    fn earlier_grant_is_covered() {
        let mut registry = TermRegistry::new();
        registry.insert(term(1, 30), RuleHandle::Matched);
        assert_eq!(
            registry.insert(term(1, 20), RuleHandle::Matched),
            Admission::Covered { expires_at: 30 }
        );
        assert_eq!(expiries(&registry), vec![30]);
    }

    #[test]
    fn coalesce_without_entry_is_none() {
        let mut registry = TermRegistry::new();
        assert_eq!(registry.coalesce(&term(1, 30)), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn extension_keeps_original_handle() {
        let key = uuid::Uuid::new_v4();
        let mut registry = TermRegistry::new();
        registry.insert(term(1, 10), RuleHandle::Keyed(key));
        registry.coalesce(&term(1, 20));
        let entry = registry.lookup(&term(1, 0).key()).unwrap();
        assert_eq!(entry.handle, RuleHandle::Keyed(key));
        assert_eq!(entry.term.expires_at, 20);
    }

    #[test]
    fn pop_expired_is_inclusive_and_ordered() {
        let mut registry = TermRegistry::new();
        for (host, exp) in [(1, 12), (2, 10), (3, 11), (4, 20)] {
            registry.insert(term(host, exp), RuleHandle::Matched);
        }
        let popped: Vec<_> = registry
            .pop_expired(12)
            .into_iter()
            .map(|e| e.term.expires_at)
            .collect();
        assert_eq!(popped, vec![10, 11, 12]);
        assert_eq!(expiries(&registry), vec![20]);
        assert!(registry.pop_expired(12).is_empty());
    }

    #[test]
    fn drain_empties_registry() {
        let mut registry = TermRegistry::new();
        registry.insert(term(1, 10), RuleHandle::Matched);
        registry.insert(term(2, 20), RuleHandle::Matched);
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.next_expiry(), None);
    }

    proptest! {
        #[test]
        fn registry_stays_sorted(grants in prop::collection::vec((0u8..32, 0i64..1_000), 0..64)) {
            let mut registry = TermRegistry::new();
            for (host, exp) in &grants {
                registry.insert(term(*host, *exp), RuleHandle::Matched);
            }

            let got = expiries(&registry);
            prop_assert!(got.windows(2).all(|w| w[0] <= w[1]));

            // One entry per tuple, carrying its latest expiry.
            let mut latest = std::collections::HashMap::new();
            for (host, exp) in &grants {
                let e = latest.entry(*host).or_insert(*exp);
                *e = (*e).max(*exp);
            }
            prop_assert_eq!(registry.len(), latest.len());
            for (host, exp) in latest {
                let entry = registry.lookup(&term(host, 0).key()).unwrap();
                prop_assert_eq!(entry.term.expires_at, exp);
            }
        }

        #[test]
        fn pop_expired_leaves_only_live_entries(
            exps in prop::collection::vec(0i64..100, 0..40),
            now in 0i64..100,
        ) {
            let mut registry = TermRegistry::new();
            for (i, exp) in exps.iter().enumerate() {
                registry.insert(term(i as u8, *exp), RuleHandle::Matched);
            }
            let popped = registry.pop_expired(now);
            prop_assert!(popped.iter().all(|e| e.term.expires_at <= now));
            prop_assert!(registry.snapshot().iter().all(|t| t.expires_at > now));
            prop_assert_eq!(popped.len() + registry.len(), exps.len());
        }
    }
}
