//! Client configuration at `~/.spa/config.toml`.
//!
//! Supplies the default gateway and the credential used to mint tokens.
//! CLI flags always override config file values.

use anyhow::{Context, Result};
use serde::Deserialize;
use spa_core::CredentialAlgorithm;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default: DefaultConfig,

    #[serde(default)]
    pub credential: CredentialConfig,
}

/// Default gateway settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultConfig {
    /// Gateway host (empty = none).
    #[serde(default)]
    pub server: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds to wait for a reply.
    #[serde(default = "default_deadline")]
    pub deadline: u64,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: default_port(),
            deadline: default_deadline(),
        }
    }
}

/// How to mint a token when none is given on the command line.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: CredentialAlgorithm,

    /// Shared secret for `hs256`.
    #[serde(default)]
    pub secret: Option<String>,

    /// PEM private key for `rs256`.
    #[serde(default)]
    pub private_key_file: Option<String>,

    /// Token lifetime in seconds.
    #[serde(default = "default_duration")]
    pub duration: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            secret: None,
            private_key_file: None,
            duration: default_duration(),
        }
    }
}

fn default_port() -> u16 {
    1337
}

fn default_deadline() -> u64 {
    5
}

fn default_algorithm() -> CredentialAlgorithm {
    CredentialAlgorithm::Hs256
}

fn default_duration() -> u64 {
    30
}

/// `~/.spa/config.toml`, or a relative fallback without a home directory.
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".spa")
        .join("config.toml")
}

/// Expand a leading `~/` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().unwrap_or_default().join(rest),
        None => PathBuf::from(path),
    }
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = Config::default();
        assert!(cfg.default.server.is_empty());
        assert_eq!(cfg.default.port, 1337);
        assert_eq!(cfg.default.deadline, 5);
        assert_eq!(cfg.credential.algorithm, CredentialAlgorithm::Hs256);
        assert_eq!(cfg.credential.duration, 30);
        assert!(cfg.credential.secret.is_none());
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[default]
server = "gw.example.com"
port = 4000
deadline = 2

[credential]
algorithm = "rs256"
private_key_file = "~/.spa/key.pem"
duration = 10
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.default.server, "gw.example.com");
        assert_eq!(cfg.default.port, 4000);
        assert_eq!(cfg.default.deadline, 2);
        assert_eq!(cfg.credential.algorithm, CredentialAlgorithm::Rs256);
        assert_eq!(cfg.credential.private_key_file.as_deref(), Some("~/.spa/key.pem"));
        assert_eq!(cfg.credential.duration, 10);
    }

    #[test]
    fn parse_partial_toml_config() {
        let cfg: Config = toml::from_str("[credential]\nsecret = \"s3cret\"\n").unwrap();
        assert_eq!(cfg.default.port, 1337); // default
        assert_eq!(cfg.credential.secret.as_deref(), Some("s3cret"));
        assert_eq!(cfg.credential.algorithm, CredentialAlgorithm::Hs256); // default
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.default.port, 1337);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[default\nport = ").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn tilde_expands_to_home() {
        let expanded = expand_tilde("~/x.pem");
        assert!(expanded.ends_with("x.pem"));
        assert_eq!(expand_tilde("/etc/x.pem"), PathBuf::from("/etc/x.pem"));
    }
}
