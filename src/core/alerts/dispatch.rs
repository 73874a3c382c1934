use anyhow::Result;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use tracing::{error, warn};

use crate::core::live::LiveHub;
use crate::core::model::{AlertAction, AlertFiring, AlertRule, DispatchOutcome};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hivewatch-signature";

/// `sha256=<hex>` over the exact request body.
pub fn sign_body(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Executes a firing's actions. Failures are reported as outcomes and
/// never undo the firing.
pub struct Dispatcher {
    http: reqwest::Client,
    hub: LiveHub,
}

impl Dispatcher {
    pub fn new(hub: LiveHub, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("hivewatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, hub })
    }

    pub async fn dispatch(&self, rule: &AlertRule, firing: &AlertFiring) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::with_capacity(rule.actions.len());
        for action in &rule.actions {
            let result = match action {
                AlertAction::Webhook { url, secret } => {
                    self.post_webhook(url, secret.as_deref(), firing).await
                }
                AlertAction::Notify => {
                    self.hub.notify_alert(firing).await;
                    Ok(None)
                }
                AlertAction::Log => {
                    warn!(
                        "Alert '{}' fired for tenant {}: {}",
                        firing.rule_name, firing.tenant_id, firing.condition_snapshot
                    );
                    Ok(None)
                }
            };

            let outcome = match result {
                Ok(detail) => DispatchOutcome {
                    action: action.type_name().to_string(),
                    ok: true,
                    detail,
                    recorded_at: Utc::now(),
                },
                Err(e) => {
                    error!(
                        "Alert '{}' {} dispatch failed: {}",
                        firing.rule_name,
                        action.type_name(),
                        e
                    );
                    DispatchOutcome {
                        action: action.type_name().to_string(),
                        ok: false,
                        detail: Some(e.to_string()),
                        recorded_at: Utc::now(),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn post_webhook(
        &self,
        url: &str,
        secret: Option<&str>,
        firing: &AlertFiring,
    ) -> Result<Option<String>> {
        let body = serde_json::to_vec(firing)?;
        let mut request = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = secret.filter(|s| !s.is_empty()) {
            let signature = sign_body(secret, &body)
                .ok_or_else(|| anyhow::anyhow!("could not initialise webhook signer"))?;
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("webhook answered {}", status);
        }
        Ok(Some(format!("HTTP {}", status.as_u16())))
    }
}
