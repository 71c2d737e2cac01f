//! App authentication via short-lived signed assertions
//!
//! The app holds a long-lived RSA private key and proves identity by
//! minting RS256-signed assertions with a fixed claim set: issued-at,
//! expires-at (ten minutes), and the app id as issuer. Assertions are
//! cached and reused until shortly before expiry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ErrorKind, MeshError, Result};

use super::CredentialProvider;

/// Assertion validity window.
const ASSERTION_TTL: Duration = Duration::from_secs(600);

/// Refresh margin: mint a new assertion once fewer than this many seconds
/// of validity remain.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Claims carried by the signed assertion. Nothing else goes in.
#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug)]
struct CachedAssertion {
    token: String,
    expires_at: i64,
}

/// Credential provider minting RS256 assertions from an app private key.
pub struct AppAuthProvider {
    app_id: String,
    installation_id: Option<String>,
    key: EncodingKey,
    cached: RwLock<Option<CachedAssertion>>,
}

impl std::fmt::Debug for AppAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppAuthProvider")
            .field("app_id", &self.app_id)
            .field("installation_id", &self.installation_id)
            .field("key", &"<redacted>")
            .field("cached", &self.cached)
            .finish()
    }
}

impl AppAuthProvider {
    /// Builds a provider from a PEM-encoded RSA private key.
    pub fn new(
        app_id: impl Into<String>,
        installation_id: Option<String>,
        private_key_pem: &str,
    ) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes()).map_err(|e| {
            MeshError::new(ErrorKind::InvalidAuth, format!("invalid app private key: {}", e))
        })?;

        Ok(Self {
            app_id: app_id.into(),
            installation_id,
            key,
            cached: RwLock::new(None),
        })
    }

    pub fn installation_id(&self) -> Option<&str> {
        self.installation_id.as_deref()
    }

    /// Returns a currently-valid assertion, minting a fresh one when the
    /// cached assertion is within the refresh margin of expiry.
    pub async fn assertion(&self) -> Result<String> {
        let now = Utc::now().timestamp();

        {
            let cached = self.cached.read().await;
            if let Some(entry) = cached.as_ref() {
                if entry.expires_at - now > REFRESH_MARGIN.as_secs() as i64 {
                    return Ok(entry.token.clone());
                }
            }
        }

        let mut cached = self.cached.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(entry) = cached.as_ref() {
            if entry.expires_at - now > REFRESH_MARGIN.as_secs() as i64 {
                return Ok(entry.token.clone());
            }
        }

        let claims = AssertionClaims {
            iat: now,
            exp: now + ASSERTION_TTL.as_secs() as i64,
            iss: self.app_id.clone(),
        };

        let token = encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| {
                MeshError::new(
                    ErrorKind::InvalidAuth,
                    format!("assertion signing failed: {}", e),
                )
                .with_context("app_id", &self.app_id)
            })?;

        debug!(app_id = %self.app_id, exp = claims.exp, "Minted app assertion");

        *cached = Some(CachedAssertion {
            token: token.clone(),
            expires_at: claims.exp,
        });

        Ok(token)
    }
}

#[async_trait]
impl CredentialProvider for AppAuthProvider {
    async fn attach(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let assertion = self.assertion().await?;
        Ok(request.bearer_auth(assertion))
    }

    async fn token(&self) -> Result<Option<String>> {
        Ok(Some(self.assertion().await?))
    }

    fn kind(&self) -> &'static str {
        "app"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};

    // 2048-bit RSA test key; generated for these tests only.
    const TEST_KEY: &str = include_str!("testdata/test_app_key.pem");
    const TEST_PUB: &str = include_str!("testdata/test_app_key.pub.pem");

    #[tokio::test]
    async fn test_assertion_claims() {
        let provider = AppAuthProvider::new("12345", None, TEST_KEY).unwrap();
        let assertion = provider.assertion().await.unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&["12345"]);
        validation.validate_exp = true;

        let decoded = decode::<AssertionClaims>(
            &assertion,
            &DecodingKey::from_rsa_pem(TEST_PUB.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();

        assert_eq!(decoded.claims.iss, "12345");
        assert_eq!(decoded.claims.exp - decoded.claims.iat, 600);
    }

    #[tokio::test]
    async fn test_assertion_is_cached() {
        let provider = AppAuthProvider::new("12345", None, TEST_KEY).unwrap();
        let first = provider.assertion().await.unwrap();
        let second = provider.assertion().await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejects_garbage_key() {
        let err = AppAuthProvider::new("12345", None, "not a pem").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidAuth);
    }
}
