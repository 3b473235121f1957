//! Outbound notifications: fire-and-forget webhooks per action and a final
//! result hook. Delivery failures are reported to the caller, who logs them
//! and carries on.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use punchclock_core::config::WebhookConfig;
use punchclock_core::error::{PunchError, Result};

use crate::state::Action;

/// Which configured endpoint a payload goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Start,
    StartBreak,
    StopBreak,
    Final,
}

impl Hook {
    /// Click hook for an action. The last action reports through [`Hook::Final`].
    pub fn for_action(action: Action) -> Option<Hook> {
        match action {
            Action::Start => Some(Hook::Start),
            Action::StartBreak => Some(Hook::StartBreak),
            Action::StopBreak => Some(Hook::StopBreak),
            Action::Final => None,
        }
    }
}

/// JSON body posted to every hook.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub ok: bool,
    pub event: String,
    pub job: String,
    pub run_id: String,
    pub ts: String,
    pub meta: serde_json::Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, hook: Hook, payload: &WebhookPayload) -> Result<()>;
}

/// HTTP POST to the URLs of `[webhooks]`. Unset URLs are skipped.
pub struct WebhookNotifier {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, hook: Hook) -> &str {
        match hook {
            Hook::Start => &self.config.start,
            Hook::StartBreak => &self.config.start_break,
            Hook::StopBreak => &self.config.stop_break,
            Hook::Final => &self.config.final_result,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, hook: Hook, payload: &WebhookPayload) -> Result<()> {
        let url = self.url(hook).trim();
        if url.is_empty() {
            tracing::info!("🔕 Webhook skipped ({hook:?}): URL not configured");
            return Ok(());
        }

        let resp = self
            .client
            .post(url)
            .json(payload)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .send()
            .await
            .map_err(|e| PunchError::Notification(format!("{}: {e}", redact_url(url))))?;

        if resp.status().is_success() {
            tracing::info!("✅ Webhook sent: {} → {}", payload.event, redact_url(url));
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let body: String = body.chars().take(300).collect();
            Err(PunchError::Notification(format!(
                "{} answered {status}: {body}",
                redact_url(url)
            )))
        }
    }
}

/// Drops every notification. Used when no endpoint is configured and in tests.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _hook: Hook, _payload: &WebhookPayload) -> Result<()> {
        Ok(())
    }
}

/// Strip query string and fragment so tokens never reach the logs.
pub fn redact_url(raw: &str) -> String {
    match reqwest::Url::parse(raw) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => raw.split(['?', '#']).next().unwrap_or_default().to_string(),
    }
}
