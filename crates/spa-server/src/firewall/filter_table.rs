//! Filter-table binding: one match rule per tuple in a fixed table/chain.

use super::{FirewallBinding, RuleHandle};
use crate::term::Term;
use spa_core::{SpaError, SpaResult};
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, info};

/// A rule specification in iptables argument form, without the
/// table/chain/operation prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    /// Whether the rule belongs in the IPv6 table.
    pub ipv6: bool,
    pub args: Vec<String>,
}

impl RuleSpec {
    /// The allow-rule for a term: protocol, source, destination and
    /// destination port, jumping to `ACCEPT`.
    ///
    /// The comment is part of the match, so it must not vary between terms
    /// that share a key.
    pub fn for_term(term: &Term) -> SpaResult<Self> {
        if term.source.is_ipv6() != term.destination.is_ipv6() {
            return Err(SpaError::Firewall(format!(
                "address family mismatch: {} -> {}",
                term.source, term.destination
            )));
        }

        let args = vec![
            "--protocol".to_string(),
            term.protocol.to_string(),
            "--source".to_string(),
            term.source.to_string(),
            "--destination".to_string(),
            term.destination.to_string(),
            "--dport".to_string(),
            term.destination_port.to_string(),
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            term.comment.clone(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ];

        Ok(Self {
            ipv6: term.source.is_ipv6(),
            args,
        })
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args.join(" "))
    }
}

/// Native rule table operations.
pub trait RuleTable: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;
    fn exists(&self, table: &str, chain: &str, rule: &RuleSpec) -> SpaResult<bool>;
    fn append(&self, table: &str, chain: &str, rule: &RuleSpec) -> SpaResult<()>;
    fn delete(&self, table: &str, chain: &str, rule: &RuleSpec) -> SpaResult<()>;
}

/// [`FirewallBinding`] over a [`RuleTable`].
///
/// `grant` appends the rule only if it is absent and `revoke` deletes it only
/// if present; the check and the mutation happen under one lock so
/// concurrent callers cannot interleave between them.
pub struct FilterTableBinding<T> {
    rules: T,
    table: String,
    chain: String,
    lock: Mutex<()>,
}

impl<T: RuleTable> FilterTableBinding<T> {
    pub fn new(rules: T, table: &str, chain: &str) -> Self {
        Self {
            rules,
            table: table.to_string(),
            chain: chain.to_string(),
            lock: Mutex::new(()),
        }
    }

    /// The underlying table.
    pub fn rules(&self) -> &T {
        &self.rules
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        // The guarded data is `()`, so a poisoned lock carries no broken state.
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: RuleTable> FirewallBinding for FilterTableBinding<T> {
    fn name(&self) -> &'static str {
        self.rules.name()
    }

    fn grant(&self, term: &Term) -> SpaResult<RuleHandle> {
        let spec = RuleSpec::for_term(term)?;
        let _guard = self.guard();

        if self.rules.exists(&self.table, &self.chain, &spec)? {
            debug!(rule = %spec, "rule already present");
        } else {
            self.rules.append(&self.table, &self.chain, &spec)?;
            info!(table = %self.table, chain = %self.chain, rule = %spec, "rule appended");
        }
        Ok(RuleHandle::Matched)
    }

    fn revoke(&self, term: &Term, _handle: &RuleHandle) -> SpaResult<()> {
        let spec = RuleSpec::for_term(term)?;
        let _guard = self.guard();

        if self.rules.exists(&self.table, &self.chain, &spec)? {
            self.rules.delete(&self.table, &self.chain, &spec)?;
            info!(table = %self.table, chain = %self.chain, rule = %spec, "rule deleted");
        } else {
            debug!(rule = %spec, "rule already absent");
        }
        Ok(())
    }
}
