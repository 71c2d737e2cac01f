//! Webhook delivery validation
//!
//! Three gates, in order: HMAC-SHA256 signature over the raw payload with
//! the shared secret, replay suppression on the delivery-id, and an
//! optional source-IP allow-list.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::{ErrorKind, MeshError, Result};

use super::replay::ReplayGuard;
use super::WebhookEvent;

type HmacSha256 = Hmac<Sha256>;

/// Configuration for webhook validation
#[derive(Debug, Clone)]
pub struct WebhookValidatorConfig {
    /// Shared secret for HMAC verification
    pub secret: String,
    /// Source IPs allowed to deliver; empty disables the check
    pub allowed_ips: Vec<String>,
}

/// Validates inbound deliveries before they reach the queue.
pub struct WebhookValidator {
    secret: Vec<u8>,
    replay: Arc<ReplayGuard>,
    allowed_ips: Option<HashSet<IpAddr>>,
}

impl WebhookValidator {
    pub fn new(config: WebhookValidatorConfig, replay: Arc<ReplayGuard>) -> Self {
        let allowed_ips = if config.allowed_ips.is_empty() {
            None
        } else {
            Some(
                config
                    .allowed_ips
                    .iter()
                    .filter_map(|ip| ip.parse().ok())
                    .collect(),
            )
        };

        Self {
            secret: config.secret.into_bytes(),
            replay,
            allowed_ips,
        }
    }

    /// Runs all gates for a delivery. `signature` is the signature header
    /// value; a `sha256=` prefix is tolerated.
    pub async fn validate(
        &self,
        event: &WebhookEvent,
        signature: &str,
        remote_addr: Option<IpAddr>,
    ) -> Result<()> {
        self.verify_source(event, remote_addr)?;
        self.verify_signature(&event.payload, signature)?;

        if self.replay.check_and_mark(&event.delivery_id).await {
            warn!(
                delivery_id = %event.delivery_id,
                event = %event.event_kind,
                "Replayed delivery rejected"
            );
            return Err(MeshError::new(
                ErrorKind::ReplayDetected,
                format!("delivery {} already seen", event.delivery_id),
            )
            .with_context("delivery_id", &event.delivery_id));
        }

        debug!(
            delivery_id = %event.delivery_id,
            event = %event.event_kind,
            "Delivery validated"
        );
        Ok(())
    }

    /// Constant-time HMAC comparison via the Mac verifier.
    pub fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<()> {
        let hex_sig = signature.strip_prefix("sha256=").unwrap_or(signature);
        let expected = hex::decode(hex_sig).map_err(|_| {
            MeshError::new(ErrorKind::InvalidSignature, "signature is not valid hex")
        })?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| MeshError::internal(format!("hmac init failed: {}", e)))?;
        mac.update(payload);

        mac.verify_slice(&expected).map_err(|_| {
            warn!("Webhook signature mismatch");
            MeshError::new(ErrorKind::InvalidSignature, "signature mismatch")
        })
    }

    fn verify_source(&self, event: &WebhookEvent, remote_addr: Option<IpAddr>) -> Result<()> {
        let Some(allowed) = &self.allowed_ips else {
            return Ok(());
        };

        match remote_addr {
            Some(addr) if allowed.contains(&addr) => Ok(()),
            Some(addr) => {
                warn!(
                    delivery_id = %event.delivery_id,
                    remote = %addr,
                    "Delivery from disallowed source"
                );
                Err(MeshError::new(
                    ErrorKind::InvalidSource,
                    format!("source {} is not allow-listed", addr),
                )
                .with_context("remote_addr", addr))
            }
            None => Err(MeshError::new(
                ErrorKind::InvalidSource,
                "source address required by allow-list but missing",
            )),
        }
    }
}

/// Computes the signature header value for a payload. Used by tests and by
/// outbound delivery mirroring.
pub fn sign_payload(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn validator(allowed_ips: Vec<String>) -> WebhookValidator {
        WebhookValidator::new(
            WebhookValidatorConfig {
                secret: "shhh".to_string(),
                allowed_ips,
            },
            Arc::new(ReplayGuard::new(Duration::from_secs(60), 100)),
        )
    }

    #[tokio::test]
    async fn test_valid_signature_accepted() {
        let v = validator(vec![]);
        let payload = br#"{"action": "opened"}"#;
        let sig = sign_payload(b"shhh", payload);

        let event = WebhookEvent::new("pull_request", "D1", payload.to_vec());
        v.validate(&event, &sig, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let v = validator(vec![]);
        let payload = b"payload";
        let sig = sign_payload(b"wrong-secret", payload);

        let event = WebhookEvent::new("push", "D1", payload.to_vec());
        let err = v.validate(&event, &sig, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidSignature);
    }

    #[tokio::test]
    async fn test_signature_without_prefix_accepted() {
        let v = validator(vec![]);
        let payload = b"data";
        let sig = sign_payload(b"shhh", payload);
        let bare = sig.strip_prefix("sha256=").unwrap();

        v.verify_signature(payload, bare).unwrap();
    }

    #[tokio::test]
    async fn test_replay_rejected() {
        let v = validator(vec![]);
        let payload = b"payload";
        let sig = sign_payload(b"shhh", payload);

        let event = WebhookEvent::new("push", "D1", payload.to_vec());
        v.validate(&event, &sig, None).await.unwrap();

        let again = WebhookEvent::new("push", "D1", payload.to_vec());
        let err = v.validate(&again, &sig, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ReplayDetected);
    }

    #[tokio::test]
    async fn test_source_allow_list() {
        let v = validator(vec!["10.0.0.1".to_string()]);
        let payload = b"payload";
        let sig = sign_payload(b"shhh", payload);

        let event = WebhookEvent::new("push", "D1", payload.to_vec());
        v.validate(&event, &sig, Some("10.0.0.1".parse().unwrap()))
            .await
            .unwrap();

        let event = WebhookEvent::new("push", "D2", payload.to_vec());
        let err = v
            .validate(&event, &sig, Some("10.9.9.9".parse().unwrap()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidSource);

        let event = WebhookEvent::new("push", "D3", payload.to_vec());
        let err = v.validate(&event, &sig, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidSource);
    }
}
