//! `RuleTable` backed by the `iptables` crate.
//!
//! The crate drives `iptables` / `ip6tables` and passes `--wait` whenever
//! the installed binary supports it, so concurrent callers (including other
//! tools on the host) wait for the xtables lock instead of failing.

use super::filter_table::{RuleSpec, RuleTable};
use spa_core::{SpaError, SpaResult};
use std::error::Error;
use std::sync::OnceLock;
use tracing::debug;

/// Per-family iptables handles, opened on first use.
///
/// Opening a handle runs the binary to query its version, so building
/// the table itself touches nothing on the host.
#[derive(Default)]
pub struct IptablesTable {
    ipv4: OnceLock<::iptables::IPTables>,
    ipv6: OnceLock<::iptables::IPTables>,
}

impl IptablesTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, ipv6: bool) -> SpaResult<&::iptables::IPTables> {
        let cell = if ipv6 { &self.ipv6 } else { &self.ipv4 };
        if let Some(handle) = cell.get() {
            return Ok(handle);
        }
        let opened = ::iptables::new(ipv6).map_err(|e| firewall_error(family(ipv6), "open", e))?;
        Ok(cell.get_or_init(|| opened))
    }

    #[cfg(test)]
    fn opened(&self) -> usize {
        usize::from(self.ipv4.get().is_some()) + usize::from(self.ipv6.get().is_some())
    }
}

fn family(ipv6: bool) -> &'static str {
    if ipv6 {
        "ip6tables"
    } else {
        "iptables"
    }
}

/// The crate reports errors as `Box<dyn Error>`, which is not `Send`; flatten
/// them before they cross the blocking pool.
fn firewall_error(program: &str, op: &str, e: Box<dyn Error>) -> SpaError {
    SpaError::Firewall(format!("{program} {op} failed: {e}"))
}

/// Render a rule the way the crate splits it: whitespace separates
/// arguments, so arguments holding whitespace are quoted.
fn rule_text(rule: &RuleSpec) -> String {
    rule.args
        .iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                format!("\"{}\"", arg.replace('"', "\\\""))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl RuleTable for IptablesTable {
    fn name(&self) -> &'static str {
        "iptables"
    }

    fn exists(&self, table: &str, chain: &str, rule: &RuleSpec) -> SpaResult<bool> {
        let program = family(rule.ipv6);
        debug!(program, table, chain, rule = %rule, "checking rule");
        self.handle(rule.ipv6)?
            .exists(table, chain, &rule_text(rule))
            .map_err(|e| firewall_error(program, "check", e))
    }

    fn append(&self, table: &str, chain: &str, rule: &RuleSpec) -> SpaResult<()> {
        let program = family(rule.ipv6);
        debug!(program, table, chain, rule = %rule, "appending rule");
        self.handle(rule.ipv6)?
            .append(table, chain, &rule_text(rule))
            .map_err(|e| firewall_error(program, "append", e))
    }

    fn delete(&self, table: &str, chain: &str, rule: &RuleSpec) -> SpaResult<()> {
        let program = family(rule.ipv6);
        debug!(program, table, chain, rule = %rule, "deleting rule");
        self.handle(rule.ipv6)?
            .delete(table, chain, &rule_text(rule))
            .map_err(|e| firewall_error(program, "delete", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(args: &[&str]) -> RuleSpec {
        RuleSpec {
            ipv6: false,
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn construction_opens_nothing() {
        let table = IptablesTable::new();
        assert_eq!(table.opened(), 0);
        assert_eq!(table.name(), "iptables");
    }

    #[test]
    fn family_picks_binary() {
        assert_eq!(family(false), "iptables");
        assert_eq!(family(true), "ip6tables");
    }

    #[test]
    fn plain_arguments_are_joined() {
        let rule = spec(&["--dport", "443", "--comment", "spa-gateway", "-j", "ACCEPT"]);
        assert_eq!(rule_text(&rule), "--dport 443 --comment spa-gateway -j ACCEPT");
    }

    #[test]
    fn arguments_with_spaces_are_quoted() {
        let rule = spec(&["--comment", "spa gateway", "-j", "ACCEPT"]);
        assert_eq!(rule_text(&rule), "--comment \"spa gateway\" -j ACCEPT");
    }

    #[test]
    fn crate_errors_become_firewall_errors() {
        let err = firewall_error("iptables", "append", "chain missing".into());
        assert!(matches!(&err, SpaError::Firewall(m) if m == "iptables append failed: chain missing"));
    }
}
