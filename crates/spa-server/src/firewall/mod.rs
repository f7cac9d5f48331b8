//! Firewall bindings: one grant/revoke contract over native firewalls.
//!
//! # Submodule Architecture
//!
//! - **[`filter_table`]**: [`FilterTableBinding`] maps a term to a single
//!   rule in a fixed table/chain. Grants are append-if-unique and revokes
//!   are delete-if-exists, so both are idempotent. The native table sits
//!   behind the [`RuleTable`](filter_table::RuleTable) seam.
//!
//! - **[`iptables`]**: [`IptablesTable`](iptables::IptablesTable), the
//!   `RuleTable` that drives `iptables` / `ip6tables` through the `iptables` crate.
//!
//! - **[`filter_engine`]**: [`FilterEngineBinding`] adds one filter per
//!   grant under a freshly generated key and deletes by that key. Grants
//!   are *not* idempotent: the key comes back as [`RuleHandle::Keyed`] and
//!   the registry keeps it next to the term. The native engine sits behind
//!   the [`FilterEngine`](filter_engine::FilterEngine) seam.
//!
//! - **`wfp`** (Windows only): the `FilterEngine` backed by the Windows
//!   Filtering Platform.
//!
//! - **[`memory`]**: in-memory `RuleTable` / `FilterEngine` used by the
//!   `dry-run` backend and by tests.
//!
//! Bindings hold no term state and are shared across tasks, so every
//! implementation is `Send + Sync`. Native calls block; callers run them on
//! the blocking pool.

pub mod filter_engine;
pub mod filter_table;
pub mod iptables;
pub mod memory;
#[cfg(windows)]
pub mod wfp;

pub use filter_engine::FilterEngineBinding;
pub use filter_table::FilterTableBinding;

use crate::config::FirewallConfig;
use crate::term::Term;
use serde::Deserialize;
use spa_core::{SpaError, SpaResult};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Which native firewall to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FirewallBackend {
    /// iptables on Linux, the Windows Filtering Platform on Windows.
    #[default]
    Auto,
    Iptables,
    Wfp,
    /// Record rules in memory and log them; touches no native firewall.
    DryRun,
}

/// How a granted native rule is addressed when it is revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleHandle {
    /// The rule is found again by its match specification. Every term with
    /// the same key maps to the same native rule.
    Matched,
    /// The rule is found by the key the binding generated when adding it.
    Keyed(Uuid),
}

impl RuleHandle {
    /// Whether other terms with the same key address the same native rule.
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Matched)
    }
}

/// Grant/revoke contract over a native firewall.
pub trait FirewallBinding: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Install a rule admitting the term's tuple.
    fn grant(&self, term: &Term) -> SpaResult<RuleHandle>;

    /// Remove the rule installed for `term`. Revoking a rule that no longer
    /// exists succeeds.
    fn revoke(&self, term: &Term, handle: &RuleHandle) -> SpaResult<()>;
}

/// Build the binding selected by configuration.
pub fn from_config(config: &FirewallConfig) -> SpaResult<Arc<dyn FirewallBinding>> {
    let binding: Arc<dyn FirewallBinding> = match native_backend(config.backend) {
        FirewallBackend::Iptables => Arc::new(FilterTableBinding::new(
            iptables::IptablesTable::new(),
            &config.table,
            &config.chain,
        )),
        FirewallBackend::DryRun => Arc::new(FilterTableBinding::new(
            memory::MemoryTable::new(),
            &config.table,
            &config.chain,
        )),
        FirewallBackend::Wfp => wfp_binding()?,
        FirewallBackend::Auto => {
            return Err(SpaError::ConfigInvalid(
                "no native firewall backend for this platform; set firewall.backend".into(),
            ))
        }
    };

    info!(backend = binding.name(), "firewall binding ready");
    Ok(binding)
}

/// Resolve `auto` to the platform's native backend; `auto` survives only
/// where there is none.
fn native_backend(backend: FirewallBackend) -> FirewallBackend {
    match backend {
        FirewallBackend::Auto if cfg!(windows) => FirewallBackend::Wfp,
        FirewallBackend::Auto if cfg!(target_os = "linux") => FirewallBackend::Iptables,
        other => other,
    }
}

#[cfg(windows)]
fn wfp_binding() -> SpaResult<Arc<dyn FirewallBinding>> {
    Ok(Arc::new(FilterEngineBinding::new(wfp::WfpEngine::new()?)))
}

#[cfg(not(windows))]
fn wfp_binding() -> SpaResult<Arc<dyn FirewallBinding>> {
    Err(SpaError::ConfigInvalid(
        "the wfp backend is only available on Windows".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backend: FirewallBackend) -> FirewallConfig {
        FirewallConfig {
            backend,
            table: "filter".into(),
            chain: "INPUT".into(),
        }
    }

    #[test]
    fn dry_run_is_available_everywhere() {
        let binding = from_config(&config(FirewallBackend::DryRun)).unwrap();
        assert_eq!(binding.name(), "dry-run");
    }

    #[cfg(not(windows))]
    #[test]
    fn wfp_is_rejected_off_windows() {
        assert!(matches!(
            from_config(&config(FirewallBackend::Wfp)),
            Err(SpaError::ConfigInvalid(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn auto_selects_iptables_on_linux() {
        let binding = from_config(&config(FirewallBackend::Auto)).unwrap();
        assert_eq!(binding.name(), "iptables");
    }

    #[test]
    fn only_matched_handles_are_shared() {
        assert!(RuleHandle::Matched.is_shared());
        assert!(!RuleHandle::Keyed(Uuid::new_v4()).is_shared());
    }
}
