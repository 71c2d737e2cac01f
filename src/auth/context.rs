//! Context-aware credential resolution
//!
//! Multi-tenant calls may carry their own credentials: a tenant-scoped
//! tool credential wins, then a passthrough bearer from the inbound
//! request, and only then the provider the adapter was constructed with.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::RequestBuilder;
use uuid::Uuid;

use crate::error::Result;

use super::{CredentialProvider, PassthroughProvider, TokenProvider};

/// Ambient context for a single adapter call.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Tenant on whose behalf the call runs.
    pub tenant_id: Option<Uuid>,
    /// Tenant-scoped tool credential (priority 1).
    pub tool_credential: Option<String>,
    /// Bearer forwarded from the inbound request (priority 2).
    pub passthrough_bearer: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_tenant(tenant_id: Uuid) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Default::default()
        }
    }

    pub fn with_tool_credential(mut self, credential: impl Into<String>) -> Self {
        self.tool_credential = Some(credential.into());
        self
    }

    pub fn with_passthrough_bearer(mut self, bearer: impl Into<String>) -> Self {
        self.passthrough_bearer = Some(bearer.into());
        self
    }
}

/// Wraps a construction-time provider and overrides it per call from the
/// request context.
pub struct ContextAwareProvider {
    fallback: Arc<dyn CredentialProvider>,
}

impl ContextAwareProvider {
    pub fn new(fallback: Arc<dyn CredentialProvider>) -> Self {
        Self { fallback }
    }

    /// Resolves the effective provider for a call.
    pub fn resolve(&self, ctx: &RequestContext) -> Arc<dyn CredentialProvider> {
        if let Some(credential) = &ctx.tool_credential {
            return Arc::new(TokenProvider::new(credential.clone()));
        }
        if let Some(bearer) = &ctx.passthrough_bearer {
            return Arc::new(PassthroughProvider::new(bearer.clone()));
        }
        self.fallback.clone()
    }

    /// Attaches the effective credential for `ctx` to a request.
    pub async fn attach_for(
        &self,
        ctx: &RequestContext,
        request: RequestBuilder,
    ) -> Result<RequestBuilder> {
        self.resolve(ctx).attach(request).await
    }
}

#[async_trait]
impl CredentialProvider for ContextAwareProvider {
    async fn attach(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        self.fallback.attach(request).await
    }

    async fn token(&self) -> Result<Option<String>> {
        self.fallback.token().await
    }

    fn kind(&self) -> &'static str {
        "context-aware"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AnonymousProvider;

    fn provider() -> ContextAwareProvider {
        ContextAwareProvider::new(Arc::new(TokenProvider::new("fallback-token")))
    }

    #[tokio::test]
    async fn test_tool_credential_wins() {
        let p = provider();
        let ctx = RequestContext::new()
            .with_tool_credential("tenant-cred")
            .with_passthrough_bearer("forwarded");

        let effective = p.resolve(&ctx);
        assert_eq!(effective.token().await.unwrap().as_deref(), Some("tenant-cred"));
        assert_eq!(effective.kind(), "token");
    }

    #[tokio::test]
    async fn test_passthrough_second() {
        let p = provider();
        let ctx = RequestContext::new().with_passthrough_bearer("forwarded");

        let effective = p.resolve(&ctx);
        assert_eq!(effective.token().await.unwrap().as_deref(), Some("forwarded"));
        assert_eq!(effective.kind(), "passthrough");
    }

    #[tokio::test]
    async fn test_falls_back_to_constructed_provider() {
        let p = provider();
        let ctx = RequestContext::new();

        let effective = p.resolve(&ctx);
        assert_eq!(
            effective.token().await.unwrap().as_deref(),
            Some("fallback-token")
        );
    }

    #[tokio::test]
    async fn test_anonymous_fallback() {
        let p = ContextAwareProvider::new(Arc::new(AnonymousProvider));
        let effective = p.resolve(&RequestContext::new());
        assert!(effective.token().await.unwrap().is_none());
    }
}
