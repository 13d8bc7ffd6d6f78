use super::{http_client, require, severity_label};
use crate::error::{NotifyError, Result};
use crate::utils::{truncate_string, MAX_BODY_LENGTH};
use crate::{NotificationProvider, SendReceipt};
use async_trait::async_trait;
use machinemon_common::types::Alert;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_URL: &str = "https://api.twilio.com";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwilioConfig {
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub from_number: String,
    #[serde(default)]
    pub to_number: String,
    /// Base URL override, e.g. a local stand-in during tests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

/// SMS delivery through the Twilio Messages API.
pub struct TwilioProvider {
    config: TwilioConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct MessageResource {
    #[serde(default)]
    sid: Option<String>,
}

impl TwilioProvider {
    pub fn new(config: TwilioConfig, timeout: Duration) -> Result<Self> {
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
        format!(
            "{base}/2010-04-01/Accounts/{}/Messages.json",
            self.config.account_sid
        )
    }

    fn format_body(alert: &Alert) -> String {
        format!(
            "[MachineMon {}] {}",
            severity_label(alert.severity),
            alert.message
        )
    }
}

#[async_trait]
impl NotificationProvider for TwilioProvider {
    fn validate(&self) -> Result<()> {
        require("account_sid", &self.config.account_sid)?;
        require("auth_token", &self.config.auth_token)?;
        require("from_number", &self.config.from_number)?;
        require("to_number", &self.config.to_number)
    }

    async fn send(&self, alert: &Alert) -> Result<SendReceipt> {
        let body = Self::format_body(alert);
        let resp = self
            .client
            .post(self.endpoint())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[
                ("To", self.config.to_number.as_str()),
                ("From", self.config.from_number.as_str()),
                ("Body", body.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        if status.is_client_error() || status.is_server_error() {
            return Err(NotifyError::Api {
                service: "twilio",
                status: status.as_u16(),
                body: truncate_string(raw.trim(), MAX_BODY_LENGTH),
            });
        }

        let request_id = serde_json::from_str::<MessageResource>(&raw)
            .ok()
            .and_then(|m| m.sid);
        tracing::debug!(status = %status, sid = ?request_id, "Twilio accepted message");
        Ok(SendReceipt {
            status_code: Some(status.as_u16()),
            request_id,
            raw_response: Some(truncate_string(raw.trim(), MAX_BODY_LENGTH)),
        })
    }

    fn name(&self) -> &str {
        "twilio"
    }
}
