//! Server configuration: TOML file + CLI overrides.
//!
//! The file is read once at startup and resolved into an immutable
//! [`ServerConfig`] that is passed by value (or behind an `Arc`) into every
//! component constructor. Any problem here is fatal.

use crate::firewall::FirewallBackend;
use crate::term::Protocol;
use serde::Deserialize;
use spa_core::{CredentialAlgorithm, JwtVerifier, SpaError, SpaResult};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    pub service: ServiceSection,
    pub verification: VerificationSection,
    #[serde(default)]
    pub firewall: FirewallSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
        }
    }
}

/// `[service]` section: the single destination this gateway protects.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSection {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_ttl")]
    pub ttl: u64,
}

/// `[verification]` section: how credentials are checked.
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationSection {
    pub algorithm: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub public_key_file: Option<String>,
}

/// `[firewall]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct FirewallSection {
    #[serde(default)]
    pub backend: FirewallBackend,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_chain")]
    pub chain: String,
}

impl Default for FirewallSection {
    fn default() -> Self {
        Self {
            backend: FirewallBackend::default(),
            table: default_table(),
            chain: default_chain(),
        }
    }
}

fn default_listen_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_listen_port() -> u16 {
    1337
}
fn default_ttl() -> u64 {
    60
}
fn default_table() -> String {
    "filter".to_string()
}
fn default_chain() -> String {
    "INPUT".to_string()
}

/// The protected destination, resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Host as written in the config; echoed back to clients.
    pub host: String,
    /// Address used in firewall rules.
    pub address: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    /// Maximum grant lifetime in seconds.
    pub ttl: u64,
}

impl ServiceConfig {
    /// `host:port` as reported to clients.
    pub fn socket(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Key material for credential verification.
#[derive(Clone)]
pub enum VerificationConfig {
    Hs256 { secret: String },
    Rs256 { public_key_file: PathBuf, public_key: Vec<u8> },
}

impl VerificationConfig {
    /// Build the verifier described by this configuration.
    pub fn verifier(&self) -> SpaResult<JwtVerifier> {
        match self {
            Self::Hs256 { secret } => JwtVerifier::hs256(secret.as_bytes()),
            Self::Rs256 { public_key, .. } => JwtVerifier::rs256(public_key),
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for VerificationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hs256 { .. } => f
                .debug_struct("Hs256")
                .field("secret", &"<redacted>")
                .finish(),
            Self::Rs256 {
                public_key_file, ..
            } => f
                .debug_struct("Rs256")
                .field("public_key_file", public_key_file)
                .finish(),
        }
    }
}

/// Firewall backend selection and placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallConfig {
    pub backend: FirewallBackend,
    pub table: String,
    pub chain: String,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub service: ServiceConfig,
    pub verification: VerificationConfig,
    pub firewall: FirewallConfig,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: &Path,
        cli_listen_addr: Option<IpAddr>,
        cli_listen_port: Option<u16>,
    ) -> SpaResult<Self> {
        let expanded = expand_tilde(config_path);
        info!(path = %expanded.display(), "loading config file");
        let content = std::fs::read_to_string(&expanded).map_err(|e| {
            SpaError::ConfigInvalid(format!("cannot read {}: {e}", expanded.display()))
        })?;
        Self::parse(&content, cli_listen_addr, cli_listen_port)
    }

    /// Parse and validate config text.
    pub fn parse(
        content: &str,
        cli_listen_addr: Option<IpAddr>,
        cli_listen_port: Option<u16>,
    ) -> SpaResult<Self> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| SpaError::ConfigInvalid(format!("config parse error: {e}")))?;

        let listen = SocketAddr::new(
            cli_listen_addr.unwrap_or(file.server.listen_addr),
            cli_listen_port.unwrap_or(file.server.listen_port),
        );

        let config = Self {
            listen,
            service: resolve_service(file.service)?,
            verification: resolve_verification(file.verification)?,
            firewall: FirewallConfig {
                backend: file.firewall.backend,
                table: file.firewall.table,
                chain: file.firewall.chain,
            },
        };

        // Surface key problems now rather than on the first request.
        config.verification.verifier()?;
        Ok(config)
    }
}

fn resolve_service(section: ServiceSection) -> SpaResult<ServiceConfig> {
    if section.host.is_empty() || section.port == 0 || section.ttl == 0 {
        return Err(SpaError::ConfigInvalid(format!(
            "service definition is invalid: host={:?} port={} ttl={}",
            section.host, section.port, section.ttl
        )));
    }
    if section.ttl > i64::MAX as u64 {
        return Err(SpaError::ConfigInvalid(format!("ttl out of range: {}", section.ttl)));
    }

    let address = match section.host.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => (section.host.as_str(), section.port)
            .to_socket_addrs()
            .map_err(|e| {
                SpaError::ConfigInvalid(format!("cannot resolve {}: {e}", section.host))
            })?
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| {
                SpaError::ConfigInvalid(format!("{} resolved to no addresses", section.host))
            })?,
    };

    Ok(ServiceConfig {
        host: section.host,
        address,
        port: section.port,
        protocol: section.protocol,
        ttl: section.ttl,
    })
}

fn resolve_verification(section: VerificationSection) -> SpaResult<VerificationConfig> {
    let algorithm: CredentialAlgorithm = section.algorithm.parse()?;
    match algorithm {
        CredentialAlgorithm::Hs256 => match section.secret {
            Some(secret) if !secret.is_empty() => Ok(VerificationConfig::Hs256 { secret }),
            _ => Err(SpaError::ConfigInvalid(
                "algorithm hs256 requires `secret` to be set".into(),
            )),
        },
        CredentialAlgorithm::Rs256 => {
            let path = section
                .public_key_file
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    SpaError::ConfigInvalid(
                        "algorithm rs256 requires `public_key_file` to be set".into(),
                    )
                })?;
            let public_key_file = expand_tilde_str(&path);
            let public_key = std::fs::read(&public_key_file).map_err(|e| {
                SpaError::ConfigInvalid(format!(
                    "cannot read public key {}: {e}",
                    public_key_file.display()
                ))
            })?;
            Ok(VerificationConfig::Rs256 {
                public_key_file,
                public_key,
            })
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
