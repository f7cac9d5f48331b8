//! spa-server: Single Packet Authorization gateway.
//!
//! Listens for signed single-datagram access requests, replies with the
//! granted destination, and opens a timed firewall allowance for the
//! requester that is revoked once it lapses.

pub mod config;
pub mod firewall;
pub mod keeper;
pub mod registry;
pub mod server;
pub mod term;

pub use config::{ServerConfig, ServiceConfig};
pub use firewall::{FirewallBackend, FirewallBinding, RuleHandle};
pub use keeper::{KeeperOptions, TermKeeper};
pub use registry::{ActiveTerm, Admission, TermRegistry};
pub use server::SpaServer;
pub use term::{Protocol, Term, TermKey};
