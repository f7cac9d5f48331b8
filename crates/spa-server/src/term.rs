//! Grant ("term") model.
//!
//! A [`Term`] records that one source address may reach the protected
//! service until `expires_at`. Terms are built once from a verified claim
//! set and never modified; the registry only ever inserts or removes them.

use crate::config::ServiceConfig;
use serde::Deserialize;
use spa_core::ClaimSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Provenance tag written into every native rule.
pub const RULE_COMMENT: &str = "spa-gateway";

/// Transport protocol of the protected service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timed grant of access from one source to the protected service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    pub source: IpAddr,
    /// Port the request came from. Informational only; rules match any source port.
    pub source_port: u16,
    pub destination: IpAddr,
    pub destination_port: u16,
    pub protocol: Protocol,
    /// Epoch seconds at which the grant lapses.
    pub expires_at: i64,
    pub comment: String,
}

/// The tuple a native rule matches on. Two terms with the same key are
/// indistinguishable to a filter-table firewall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TermKey {
    pub source: IpAddr,
    pub destination: IpAddr,
    pub destination_port: u16,
    pub protocol: Protocol,
}

impl Term {
    /// Build the grant for a verified request.
    ///
    /// The grant never outlives the credential nor the configured maximum
    /// lifetime: `expires_at = min(now + ttl, claims.expires_at)`.
    pub fn grant(source: SocketAddr, claims: &ClaimSet, service: &ServiceConfig, now: i64) -> Self {
        let ttl = i64::try_from(service.ttl).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl).min(claims.expires_at);
        Self {
            source: source.ip(),
            source_port: source.port(),
            destination: service.address,
            destination_port: service.port,
            protocol: service.protocol,
            expires_at,
            comment: RULE_COMMENT.to_string(),
        }
    }

    pub fn key(&self) -> TermKey {
        TermKey {
            source: self.source,
            destination: self.destination,
            destination_port: self.destination_port,
            protocol: self.protocol,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}:{} until {}",
            self.protocol,
            self.source,
            self.destination,
            self.destination_port,
            self.expires_at
        )
    }
}
