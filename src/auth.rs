//! Device credentials and connection tokens
//!
//! The broker ignores the MQTT username and authenticates the device by the
//! password, which must be a JWT signed with the device's RSA key. The token
//! asserts the project as audience and is valid for 60 minutes.
//!
//! A token belongs to exactly one transport session. A new one is issued
//! whenever a session is built and it is never refreshed in place.

use crate::config::ConfigError;
use crate::error::{BridgeError, BridgeResult};
use crate::identity::DeviceIdentity;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

pub use secrecy::ExposeSecret;

/// Validity window of every issued token
pub const TOKEN_LIFETIME_MINUTES: i64 = 60;

/// Signing algorithm the broker expects for RSA device keys
pub const TOKEN_ALGORITHM: Algorithm = Algorithm::RS256;

/// DER tag opening every X.509 certificate (ASN.1 SEQUENCE)
const DER_SEQUENCE_TAG: u8 = 0x30;

/// RSA private key used to sign tokens. Debug output is redacted.
#[derive(Clone)]
pub struct SigningKey(EncodingKey);

impl SigningKey {
    pub fn from_rsa_pem(pem: &[u8]) -> Result<Self, ConfigError> {
        EncodingKey::from_rsa_pem(pem)
            .map(Self)
            .map_err(|e| ConfigError::KeyMaterial(format!("private key is not an RSA PEM key: {e}")))
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey([REDACTED])")
    }
}

/// Key material loaded once when the client is built
#[derive(Debug, Clone)]
pub struct Credential {
    signing_key: SigningKey,
    ca_bundle: Vec<u8>,
}

impl Credential {
    /// Read the private key and CA bundle from disk
    pub fn load(private_key_path: &Path, ca_cert_path: &Path) -> Result<Self, ConfigError> {
        let key_pem = std::fs::read(private_key_path).map_err(|e| {
            ConfigError::KeyMaterial(format!(
                "cannot read private key {}: {e}",
                private_key_path.display()
            ))
        })?;
        let ca_pem = std::fs::read(ca_cert_path).map_err(|e| {
            ConfigError::KeyMaterial(format!(
                "cannot read CA bundle {}: {e}",
                ca_cert_path.display()
            ))
        })?;

        Self::from_pem(&key_pem, ca_pem)
    }

    pub fn from_pem(private_key_pem: &[u8], ca_bundle_pem: Vec<u8>) -> Result<Self, ConfigError> {
        let signing_key = SigningKey::from_rsa_pem(private_key_pem)?;

        validate_ca_bundle(&ca_bundle_pem)?;

        Ok(Self {
            signing_key,
            ca_bundle: ca_bundle_pem,
        })
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// PEM trust bundle for verifying the broker
    pub fn ca_bundle(&self) -> &[u8] {
        &self.ca_bundle
    }
}

/// Decode every certificate in a PEM trust bundle
fn validate_ca_bundle(pem: &[u8]) -> Result<(), ConfigError> {
    let mut reader = pem;
    let mut count = 0usize;

    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert
            .map_err(|e| ConfigError::KeyMaterial(format!("CA bundle is not valid PEM: {e}")))?;
        if cert.first() != Some(&DER_SEQUENCE_TAG) {
            return Err(ConfigError::KeyMaterial(format!(
                "CA bundle certificate {} is not DER encoded",
                count + 1
            )));
        }
        count += 1;
    }

    if count == 0 {
        return Err(ConfigError::KeyMaterial(
            "CA bundle contains no PEM certificate".to_string(),
        ));
    }

    Ok(())
}

/// Registered JWT claims carried by a connection token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
}

/// Signed, time-bounded connection token
#[derive(Debug, Clone)]
pub struct AuthToken {
    jwt: SecretString,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    audience: String,
}

impl AuthToken {
    /// The encoded JWT, sent as the MQTT password
    pub fn jwt(&self) -> &SecretString {
        &self.jwt
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn validity(&self) -> Duration {
        self.expires_at - self.issued_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Issues connection tokens. Stateless: no caching, no retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenIssuer;

impl TokenIssuer {
    pub fn new() -> Self {
        Self
    }

    /// Issue a token valid from now for [`TOKEN_LIFETIME_MINUTES`]
    pub fn issue(&self, identity: &DeviceIdentity, key: &SigningKey) -> BridgeResult<AuthToken> {
        self.issue_at(identity, key, Utc::now())
    }

    /// Issue a token as of `now`
    pub fn issue_at(
        &self,
        identity: &DeviceIdentity,
        key: &SigningKey,
        now: DateTime<Utc>,
    ) -> BridgeResult<AuthToken> {
        // JWT timestamps have second resolution
        let issued_at = DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now);
        let expires_at = issued_at + Duration::minutes(TOKEN_LIFETIME_MINUTES);

        let claims = Claims {
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            aud: identity.project_id().to_string(),
        };

        let jwt = jsonwebtoken::encode(&Header::new(TOKEN_ALGORITHM), &claims, &key.0)
            .map_err(BridgeError::TokenSigning)?;

        Ok(AuthToken {
            jwt: SecretString::from(jwt),
            issued_at,
            expires_at,
            audience: claims.aud,
        })
    }
}
