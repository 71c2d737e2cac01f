//! Authentication Providers
//!
//! A [`CredentialProvider`] attaches credentials to outbound requests and
//! exposes the current bearer for callers that build requests themselves.
//! Variants: static token, OAuth bearer, app (signed assertion),
//! passthrough (bearer captured from the request context), and anonymous.
//!
//! Credentials are immutable per call; rotation means constructing a new
//! provider, never mutating one in place.

pub mod app;
pub mod context;

use async_trait::async_trait;
use reqwest::RequestBuilder;

use crate::error::Result;

pub use app::AppAuthProvider;
pub use context::{ContextAwareProvider, RequestContext};

/// Polymorphic credential source.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Attaches authentication to an outbound request.
    async fn attach(&self, request: RequestBuilder) -> Result<RequestBuilder>;

    /// Current bearer token, if the provider has one.
    async fn token(&self) -> Result<Option<String>>;

    /// Short label for logs and metrics.
    fn kind(&self) -> &'static str;
}

/// Static personal-access-token credentials.
pub struct TokenProvider {
    token: String,
}

impl TokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl CredentialProvider for TokenProvider {
    async fn attach(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        Ok(request.bearer_auth(&self.token))
    }

    async fn token(&self) -> Result<Option<String>> {
        Ok(Some(self.token.clone()))
    }

    fn kind(&self) -> &'static str {
        "token"
    }
}

/// OAuth bearer credentials obtained out of band.
pub struct OAuthProvider {
    bearer: String,
}

impl OAuthProvider {
    pub fn new(bearer: impl Into<String>) -> Self {
        Self {
            bearer: bearer.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for OAuthProvider {
    async fn attach(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        Ok(request.bearer_auth(&self.bearer))
    }

    async fn token(&self) -> Result<Option<String>> {
        Ok(Some(self.bearer.clone()))
    }

    fn kind(&self) -> &'static str {
        "oauth"
    }
}

/// Bearer captured from the ambient request context. Never refreshed.
pub struct PassthroughProvider {
    bearer: String,
}

impl PassthroughProvider {
    pub fn new(bearer: impl Into<String>) -> Self {
        Self {
            bearer: bearer.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for PassthroughProvider {
    async fn attach(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        Ok(request.bearer_auth(&self.bearer))
    }

    async fn token(&self) -> Result<Option<String>> {
        Ok(Some(self.bearer.clone()))
    }

    fn kind(&self) -> &'static str {
        "passthrough"
    }
}

/// No credentials. Public endpoints only.
pub struct AnonymousProvider;

#[async_trait]
impl CredentialProvider for AnonymousProvider {
    async fn attach(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        Ok(request)
    }

    async fn token(&self) -> Result<Option<String>> {
        Ok(None)
    }

    fn kind(&self) -> &'static str {
        "anonymous"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_provider_exposes_token() {
        let provider = TokenProvider::new("ghp_abc123");
        assert_eq!(provider.token().await.unwrap().as_deref(), Some("ghp_abc123"));
        assert_eq!(provider.kind(), "token");
    }

    #[tokio::test]
    async fn test_anonymous_has_no_token() {
        let provider = AnonymousProvider;
        assert!(provider.token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_attach_sets_bearer_header() {
        let client = reqwest::Client::new();
        let provider = TokenProvider::new("secret");
        let request = provider
            .attach(client.get("https://example.com"))
            .await
            .unwrap()
            .build()
            .unwrap();
        let auth = request.headers().get("authorization").unwrap();
        assert_eq!(auth.to_str().unwrap(), "Bearer secret");
    }
}
