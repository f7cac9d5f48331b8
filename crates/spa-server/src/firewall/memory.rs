//! In-memory firewall surfaces.
//!
//! [`MemoryTable`] backs the `dry-run` backend: rules are recorded and
//! logged but nothing on the host changes. [`MemoryEngine`] mirrors a
//! filtering engine keyed by filter GUID. Both are inspectable, which is
//! what the binding and registry tests rely on.

use super::filter_engine::{FilterEngine, FilterSpec};
use super::filter_table::{RuleSpec, RuleTable};
use spa_core::SpaResult;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::info;
use uuid::Uuid;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A rule as stored by [`MemoryTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRule {
    pub table: String,
    pub chain: String,
    pub spec: RuleSpec,
}

/// Rule table kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryTable {
    rules: Mutex<Vec<StoredRule>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current rules, in insertion order.
    pub fn snapshot(&self) -> Vec<StoredRule> {
        lock(&self.rules).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.rules).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RuleTable for MemoryTable {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    fn exists(&self, table: &str, chain: &str, rule: &RuleSpec) -> SpaResult<bool> {
        Ok(lock(&self.rules)
            .iter()
            .any(|r| r.table == table && r.chain == chain && r.spec == *rule))
    }

    fn append(&self, table: &str, chain: &str, rule: &RuleSpec) -> SpaResult<()> {
        info!(table, chain, rule = %rule, "dry-run: append");
        lock(&self.rules).push(StoredRule {
            table: table.to_string(),
            chain: chain.to_string(),
            spec: rule.clone(),
        });
        Ok(())
    }

    fn delete(&self, table: &str, chain: &str, rule: &RuleSpec) -> SpaResult<()> {
        info!(table, chain, rule = %rule, "dry-run: delete");
        let mut rules = lock(&self.rules);
        // Like iptables -D, remove only the first match.
        if let Some(pos) = rules
            .iter()
            .position(|r| r.table == table && r.chain == chain && r.spec == *rule)
        {
            rules.remove(pos);
        }
        Ok(())
    }
}

/// Filtering engine kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    filters: Mutex<HashMap<Uuid, FilterSpec>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Uuid) -> Option<FilterSpec> {
        lock(&self.filters).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.filters).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FilterEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory-engine"
    }

    fn add_filter(&self, filter: &FilterSpec) -> SpaResult<()> {
        lock(&self.filters).insert(filter.key, filter.clone());
        Ok(())
    }

    fn delete_filter(&self, key: &Uuid) -> SpaResult<bool> {
        Ok(lock(&self.filters).remove(key).is_some())
    }
}
