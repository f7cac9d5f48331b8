//! Filter-engine binding: one keyed filter per grant.

use super::{FirewallBinding, RuleHandle};
use crate::term::{Protocol, Term};
use spa_core::{SpaError, SpaResult};
use std::net::IpAddr;
use tracing::{debug, info};
use uuid::Uuid;

/// Sublayer every gateway filter is placed in.
pub const SUBLAYER_KEY: Uuid = Uuid::from_u128(0xb3cd_d441_af90_41ba_a745_7c60_08ff_2301);

/// Weight of gateway filters inside [`SUBLAYER_KEY`].
pub const FILTER_WEIGHT: u8 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Permit,
}

/// An inbound permit filter, in engine-neutral form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    pub key: Uuid,
    pub name: String,
    pub description: String,
    pub sublayer: Uuid,
    pub weight: u8,
    pub remote_address: IpAddr,
    pub local_port: u16,
    pub protocol: Protocol,
    pub action: FilterAction,
}

impl FilterSpec {
    pub fn for_term(key: Uuid, term: &Term) -> Self {
        Self {
            key,
            name: term.comment.clone(),
            description: term.to_string(),
            sublayer: SUBLAYER_KEY,
            weight: FILTER_WEIGHT,
            remote_address: term.source,
            local_port: term.destination_port,
            protocol: term.protocol,
            action: FilterAction::Permit,
        }
    }
}

/// Native filtering engine operations.
pub trait FilterEngine: Send + Sync {
    fn name(&self) -> &'static str;
    fn add_filter(&self, filter: &FilterSpec) -> SpaResult<()>;
    /// Delete a filter by key. `Ok(false)` when no such filter exists.
    fn delete_filter(&self, key: &Uuid) -> SpaResult<bool>;
}

/// [`FirewallBinding`] over a [`FilterEngine`].
///
/// Each grant adds a new filter under a fresh key, so two grants for the
/// same tuple yield two filters that are revoked independently.
pub struct FilterEngineBinding<E> {
    engine: E,
}

impl<E: FilterEngine> FilterEngineBinding<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }
}

impl<E: FilterEngine> FirewallBinding for FilterEngineBinding<E> {
    fn name(&self) -> &'static str {
        self.engine.name()
    }

    fn grant(&self, term: &Term) -> SpaResult<RuleHandle> {
        let key = Uuid::new_v4();
        let filter = FilterSpec::for_term(key, term);
        self.engine.add_filter(&filter)?;
        info!(%key, term = %term, "filter added");
        Ok(RuleHandle::Keyed(key))
    }

    fn revoke(&self, term: &Term, handle: &RuleHandle) -> SpaResult<()> {
        let RuleHandle::Keyed(key) = handle else {
            return Err(SpaError::Firewall(format!(
                "{} cannot revoke an unkeyed rule for {term}",
                self.engine.name()
            )));
        };
        if self.engine.delete_filter(key)? {
            info!(%key, term = %term, "filter deleted");
        } else {
            debug!(%key, "filter already absent");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::memory::MemoryEngine;
    use crate::term::RULE_COMMENT;

    fn term(expires_at: i64) -> Term {
        Term {
            source: "192.0.2.7".parse().unwrap(),
            source_port: 40000,
            destination: "10.0.0.5".parse().unwrap(),
            destination_port: 443,
            protocol: Protocol::Tcp,
            expires_at,
            comment: RULE_COMMENT.to_string(),
        }
    }

    #[test]
    fn grants_for_one_tuple_are_independent() {
        let binding = FilterEngineBinding::new(MemoryEngine::new());
        let first = binding.grant(&term(10)).unwrap();
        let second = binding.grant(&term(20)).unwrap();
        assert_ne!(first, second);
        assert_eq!(binding.engine().len(), 2);

        binding.revoke(&term(10), &first).unwrap();
        assert_eq!(binding.engine().len(), 1);
        let RuleHandle::Keyed(key) = second else {
            panic!("expected keyed handle");
        };
        assert!(binding.engine().get(&key).is_some());
    }

    #[test]
    fn filter_carries_tuple_and_sublayer() {
        let binding = FilterEngineBinding::new(MemoryEngine::new());
        let RuleHandle::Keyed(key) = binding.grant(&term(10)).unwrap() else {
            panic!("expected keyed handle");
        };
        let filter = binding.engine().get(&key).unwrap();
        assert_eq!(filter.sublayer, SUBLAYER_KEY);
        assert_eq!(filter.remote_address, "192.0.2.7".parse::<IpAddr>().unwrap());
        assert_eq!(filter.local_port, 443);
        assert_eq!(filter.name, RULE_COMMENT);
        assert_eq!(filter.action, FilterAction::Permit);
    }

    #[test]
    fn revoking_twice_is_not_an_error() {
        let binding = FilterEngineBinding::new(MemoryEngine::new());
        let handle = binding.grant(&term(10)).unwrap();
        binding.revoke(&term(10), &handle).unwrap();
        binding.revoke(&term(10), &handle).unwrap();
        assert!(binding.engine().is_empty());
    }

    #[test]
    fn matched_handle_is_rejected() {
        let binding = FilterEngineBinding::new(MemoryEngine::new());
        assert!(matches!(
            binding.revoke(&term(10), &RuleHandle::Matched),
            Err(SpaError::Firewall(_))
        ));
    }
}
