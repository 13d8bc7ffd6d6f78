use super::{http_client, require, severity_label};
use crate::error::{NotifyError, Result};
use crate::utils::{truncate_string, MAX_BODY_LENGTH};
use crate::{NotificationProvider, SendReceipt};
use async_trait::async_trait;
use machinemon_common::types::{Alert, Severity};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_URL: &str = "https://api.pushover.net";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushoverConfig {
    #[serde(default)]
    pub app_token: String,
    #[serde(default)]
    pub user_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    status: i64,
    #[serde(default)]
    request: String,
    #[serde(default)]
    errors: Vec<String>,
}

/// Push notifications through the Pushover messages API.
pub struct PushoverProvider {
    config: PushoverConfig,
    client: reqwest::Client,
}

impl PushoverProvider {
    pub fn new(config: PushoverConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            config,
            client: http_client(timeout)?,
        })
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .api_url
            .as_deref()
            .unwrap_or(DEFAULT_API_URL)
            .trim_end_matches('/');
        format!("{base}/1/messages.json")
    }

    /// Critical alerts use high priority; everything else is normal.
    fn priority(severity: Severity) -> &'static str {
        if severity == Severity::Critical {
            "1"
        } else {
            "0"
        }
    }
}

#[async_trait]
impl NotificationProvider for PushoverProvider {
    fn validate(&self) -> Result<()> {
        require("app_token", &self.config.app_token)?;
        require("user_key", &self.config.user_key)
    }

    async fn send(&self, alert: &Alert) -> Result<SendReceipt> {
        let title = format!("MachineMon {}", severity_label(alert.severity));
        let resp = self
            .client
            .post(self.endpoint())
            .form(&[
                ("token", self.config.app_token.as_str()),
                ("user", self.config.user_key.as_str()),
                ("title", title.as_str()),
                ("message", alert.message.as_str()),
                ("priority", Self::priority(alert.severity)),
            ])
            .send()
            .await?;

        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        let raw = raw.trim();
        if status.is_client_error() || status.is_server_error() {
            return Err(NotifyError::Api {
                service: "pushover",
                status: status.as_u16(),
                body: truncate_string(raw, MAX_BODY_LENGTH),
            });
        }

        let parsed: ApiResponse = serde_json::from_str(raw).unwrap_or_default();
        if parsed.status != 1 {
            let body = if parsed.errors.is_empty() {
                raw.to_string()
            } else {
                parsed.errors.join("; ")
            };
            return Err(NotifyError::Api {
                service: "pushover",
                status: status.as_u16(),
                body: truncate_string(&body, MAX_BODY_LENGTH),
            });
        }

        Ok(SendReceipt {
            status_code: Some(status.as_u16()),
            request_id: Some(parsed.request).filter(|r| !r.is_empty()),
            raw_response: Some(truncate_string(raw, MAX_BODY_LENGTH)),
        })
    }

    fn name(&self) -> &str {
        "pushover"
    }
}
