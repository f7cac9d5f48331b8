//! Credential claims, verification and minting.
//!
//! The gateway treats a credential as an opaque string handed to a
//! [`Verifier`]. The shipped verifier checks a JWT signed with one
//! configured algorithm and requires an `exp` claim; signing secrets and
//! keys are supplied by the caller.

use crate::error::{SpaError, SpaResult};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in epoch seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Claims extracted from a verified credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimSet {
    /// Credential expiry, epoch seconds.
    pub expires_at: i64,
}

/// Checks a credential and yields its claims, or rejects it.
///
/// Implementations must be cheap enough to call from a request task and
/// safe to share across tasks.
pub trait Verifier: Send + Sync {
    fn verify(&self, token: &str) -> SpaResult<ClaimSet>;
}

/// Signature algorithms accepted for credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialAlgorithm {
    /// HMAC-SHA256 with a shared secret.
    Hs256,
    /// RSASSA-PKCS1-v1_5 SHA-256 with a PEM key pair.
    Rs256,
}

impl CredentialAlgorithm {
    fn jwt_algorithm(self) -> Algorithm {
        match self {
            Self::Hs256 => Algorithm::HS256,
            Self::Rs256 => Algorithm::RS256,
        }
    }
}

impl FromStr for CredentialAlgorithm {
    type Err = SpaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hs256" => Ok(Self::Hs256),
            "rs256" => Ok(Self::Rs256),
            other => Err(SpaError::ConfigInvalid(format!(
                "unsupported algorithm: {other} (expected hs256 or rs256)"
            ))),
        }
    }
}

impl fmt::Display for CredentialAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hs256 => f.write_str("hs256"),
            Self::Rs256 => f.write_str("rs256"),
        }
    }
}

/// JWT claims read and written by this crate. Other claims are ignored.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    exp: i64,
}

/// JWT verifier pinned to a single algorithm and key.
pub struct JwtVerifier {
    algorithm: CredentialAlgorithm,
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Verifier for `hs256` credentials signed with `secret`.
    pub fn hs256(secret: &[u8]) -> SpaResult<Self> {
        if secret.is_empty() {
            return Err(SpaError::ConfigInvalid(
                "hs256 requires a non-empty secret".into(),
            ));
        }
        Ok(Self::with_key(
            CredentialAlgorithm::Hs256,
            DecodingKey::from_secret(secret),
        ))
    }

    /// Verifier for `rs256` credentials, given a PEM-encoded RSA public key.
    pub fn rs256(public_key_pem: &[u8]) -> SpaResult<Self> {
        let key = DecodingKey::from_rsa_pem(public_key_pem)
            .map_err(|e| SpaError::ConfigInvalid(format!("invalid rs256 public key: {e}")))?;
        Ok(Self::with_key(CredentialAlgorithm::Rs256, key))
    }

    fn with_key(algorithm: CredentialAlgorithm, key: DecodingKey) -> Self {
        let mut validation = Validation::new(algorithm.jwt_algorithm());
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);
        Self {
            algorithm,
            key,
            validation,
        }
    }

    pub fn algorithm(&self) -> CredentialAlgorithm {
        self.algorithm
    }
}

impl Verifier for JwtVerifier {
    fn verify(&self, token: &str) -> SpaResult<ClaimSet> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |e| {
                let reason = match e.kind() {
                    ErrorKind::InvalidSignature => "bad signature".to_string(),
                    ErrorKind::InvalidAlgorithm => {
                        format!("wrong algorithm (expected {})", self.algorithm)
                    }
                    ErrorKind::ExpiredSignature => "credential expired".to_string(),
                    ErrorKind::MissingRequiredClaim(claim) => format!("missing claim: {claim}"),
                    _ => e.to_string(),
                };
                SpaError::CredentialInvalid(reason)
            },
        )?;

        let expires_at = data.claims.exp;
        if expires_at <= unix_now() {
            return Err(SpaError::CredentialInvalid("credential expired".into()));
        }
        Ok(ClaimSet { expires_at })
    }
}

/// Mint a credential that expires at `expires_at` (epoch seconds).
///
/// `key` is the shared secret for `hs256`, or a PEM-encoded RSA private key
/// for `rs256`.
pub fn mint_token(algorithm: CredentialAlgorithm, key: &[u8], expires_at: i64) -> SpaResult<String> {
    let encoding_key = match algorithm {
        CredentialAlgorithm::Hs256 => {
            if key.is_empty() {
                return Err(SpaError::ConfigInvalid(
                    "hs256 requires a non-empty secret".into(),
                ));
            }
            EncodingKey::from_secret(key)
        }
        CredentialAlgorithm::Rs256 => EncodingKey::from_rsa_pem(key)
            .map_err(|e| SpaError::ConfigInvalid(format!("invalid rs256 private key: {e}")))?,
    };

    let claims = Claims { exp: expires_at };
    jsonwebtoken::encode(&Header::new(algorithm.jwt_algorithm()), &claims, &encoding_key)
        .map_err(|e| SpaError::Other(format!("failed to sign credential: {e}")))
}
