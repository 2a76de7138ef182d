//! Best-effort outbound webhook delivery.
//!
//! Delivery failure is logged and swallowed; the monitoring loop never
//! fails because a downstream listener is unreachable.

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-liquidityguard-signature";

/// Notification payloads, one case per transition kind.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "payload")]
pub enum WebhookEvent {
    #[serde(rename = "DEPEG_START")]
    DepegStart {
        risk_id: String,
        timestamp: i64,
        r_bps: i64,
        snapshot_id: String,
    },
    #[serde(rename = "DEPEG_END")]
    DepegEnd {
        risk_id: String,
        timestamp: i64,
        severity_bps: i64,
        snapshot_id: String,
    },
    #[serde(rename = "DEPEG_LIQ")]
    DepegLiq {
        risk_id: String,
        timestamp: i64,
        transaction_hash: String,
        snapshot_id: String,
    },
}

pub struct WebhookEmitter {
    client: reqwest::Client,
    url: Option<String>,
    secret: Option<String>,
}

impl WebhookEmitter {
    pub fn new(url: Option<String>, secret: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, url, secret }
    }

    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    fn sign_body(&self, body: &[u8]) -> Option<String> {
        let secret = self.secret.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
        mac.update(body);
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    /// Deliver an event. Never fails from the caller's perspective.
    pub async fn emit(&self, event: &WebhookEvent) {
        let Some(url) = &self.url else {
            debug!("webhook delivery disabled, dropping event");
            return;
        };

        let body = match serde_json::to_vec(event) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to serialize webhook event");
                return;
            }
        };

        let mut request = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .body(body.clone());
        if let Some(signature) = self.sign_body(&body) {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %url, "webhook delivered");
            }
            Ok(response) => {
                warn!(url = %url, status = %response.status(), "webhook rejected");
            }
            Err(e) => {
                warn!(url = %url, error = %e, "webhook delivery failed");
            }
        }
    }
}
