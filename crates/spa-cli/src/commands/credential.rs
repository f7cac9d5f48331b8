//! Token selection: a supplied token wins, otherwise one is minted from
//! the configured algorithm and key.

use crate::config::{expand_tilde, CredentialConfig};
use anyhow::{bail, Context, Result};
use spa_core::{mint_token, unix_now, CredentialAlgorithm};
use tracing::debug;

/// Credential flags; each overrides the matching `[credential]` setting.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct CredentialArgs {
    /// Signing algorithm for minted tokens (hs256, rs256)
    #[arg(long = "jwt-algo", global = true)]
    pub algorithm: Option<CredentialAlgorithm>,

    /// Shared secret for hs256
    #[arg(long = "jwt-secret", global = true)]
    pub secret: Option<String>,

    /// PEM private key file for rs256
    #[arg(long = "jwt-key-file", global = true)]
    pub key_file: Option<String>,

    /// Lifetime of minted tokens in seconds
    #[arg(long = "jwt-duration", global = true)]
    pub duration: Option<u64>,
}

/// Mint a token from flags layered over the config file.
pub fn mint(args: &CredentialArgs, cfg: &CredentialConfig) -> Result<String> {
    let algorithm = args.algorithm.unwrap_or(cfg.algorithm);
    let duration = args.duration.unwrap_or(cfg.duration);
    if duration == 0 {
        bail!("token duration must be positive");
    }

    let key = match algorithm {
        CredentialAlgorithm::Hs256 => args
            .secret
            .clone()
            .or_else(|| cfg.secret.clone())
            .context("hs256 needs a secret (--jwt-secret or [credential] secret)")?
            .into_bytes(),
        CredentialAlgorithm::Rs256 => {
            let file = args
                .key_file
                .as_deref()
                .or(cfg.private_key_file.as_deref())
                .context("rs256 needs a private key (--jwt-key-file or [credential] private_key_file)")?;
            let path = expand_tilde(file);
            std::fs::read(&path)
                .with_context(|| format!("failed to read private key {}", path.display()))?
        }
    };

    let duration = i64::try_from(duration).context("token duration out of range")?;
    let expires_at = unix_now().saturating_add(duration);
    debug!(%algorithm, expires_at, "minting token");
    mint_token(algorithm, &key, expires_at).map_err(|e| anyhow::anyhow!("{e}"))
}

/// The token to send: `token` if given, else a freshly minted one.
pub fn resolve(token: Option<&str>, args: &CredentialArgs, cfg: &CredentialConfig) -> Result<String> {
    match token {
        Some(t) if !t.is_empty() => Ok(t.to_string()),
        Some(_) => bail!("token must not be empty"),
        None => mint(args, cfg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spa_core::{JwtVerifier, Verifier};

    fn secret_args(secret: &str) -> CredentialArgs {
        CredentialArgs {
            secret: Some(secret.into()),
            ..CredentialArgs::default()
        }
    }

    #[test]
    fn supplied_token_wins() {
        let token = resolve(Some("abc"), &secret_args("s"), &CredentialConfig::default()).unwrap();
        assert_eq!(token, "abc");
    }

    #[test]
    fn empty_token_is_rejected() {
        assert!(resolve(Some(""), &secret_args("s"), &CredentialConfig::default()).is_err());
    }

    #[test]
    fn minted_token_verifies_with_duration() {
        let args = CredentialArgs {
            duration: Some(120),
            ..secret_args("s3cret")
        };
        let before = unix_now();
        let token = resolve(None, &args, &CredentialConfig::default()).unwrap();
        let claims = JwtVerifier::hs256(b"s3cret").unwrap().verify(&token).unwrap();
        assert!(claims.expires_at >= before + 120);
        assert!(claims.expires_at <= unix_now() + 120);
    }

    #[test]
    fn config_secret_is_used_when_flag_absent() {
        let cfg = CredentialConfig {
            secret: Some("from-config".into()),
            ..CredentialConfig::default()
        };
        let token = mint(&CredentialArgs::default(), &cfg).unwrap();
        assert!(JwtVerifier::hs256(b"from-config").unwrap().verify(&token).is_ok());
    }

    #[test]
    fn missing_secret_is_an_error() {
        let err = mint(&CredentialArgs::default(), &CredentialConfig::default()).unwrap_err();
        assert!(err.to_string().contains("secret"));
    }

    #[test]
    fn rs256_needs_key_file() {
        let args = CredentialArgs {
            algorithm: Some(CredentialAlgorithm::Rs256),
            ..CredentialArgs::default()
        };
        assert!(mint(&args, &CredentialConfig::default()).is_err());
    }

    #[test]
    fn zero_duration_is_rejected() {
        let args = CredentialArgs {
            duration: Some(0),
            ..secret_args("s")
        };
        assert!(mint(&args, &CredentialConfig::default()).is_err());
    }
}
