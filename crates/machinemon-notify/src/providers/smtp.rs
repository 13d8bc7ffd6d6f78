use super::{require, severity_label};
use crate::error::{NotifyError, Result};
use crate::{NotificationProvider, SendReceipt};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use machinemon_common::types::Alert;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub use_tls: bool,
}

impl SmtpConfig {
    /// Implicit TLS is used when requested or on the submissions port.
    pub fn implicit_tls(&self) -> bool {
        self.use_tls || self.port == 465
    }
}

/// Plain-text email delivery over SMTP.
pub struct SmtpProvider {
    config: SmtpConfig,
    timeout: Duration,
}

fn smtp_err(e: impl std::fmt::Display) -> NotifyError {
    NotifyError::Smtp(e.to_string())
}

impl SmtpProvider {
    pub fn new(config: SmtpConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let host = self.config.host.trim();
        let mut builder = if self.config.implicit_tls() {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(smtp_err)?
                .port(self.config.port)
        } else {
            let tls = TlsParameters::new(host.to_string()).map_err(smtp_err)?;
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
                .port(self.config.port)
                .tls(Tls::Opportunistic(tls))
        };
        if !self.config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.config.username.clone(),
                self.config.password.clone(),
            ));
        }
        Ok(builder.timeout(Some(self.timeout)).build())
    }

    fn build_message(&self, alert: &Alert) -> Result<Message> {
        let from = Mailbox::new(
            Some("MachineMon".to_string()),
            self.config.from.trim().parse().map_err(smtp_err)?,
        );
        let to: Mailbox = self.config.to.trim().parse().map_err(smtp_err)?;
        Message::builder()
            .from(from)
            .to(to)
            .subject(Self::subject(alert))
            .header(ContentType::TEXT_PLAIN)
            .body(Self::body(alert))
            .map_err(smtp_err)
    }

    fn subject(alert: &Alert) -> String {
        format!(
            "[MachineMon {}] {}",
            severity_label(alert.severity),
            alert.alert_type
        )
    }

    fn body(alert: &Alert) -> String {
        format!(
            "{}\r\n\r\nFired at: {}\r\n",
            alert.message,
            alert.fired_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

#[async_trait]
impl NotificationProvider for SmtpProvider {
    fn validate(&self) -> Result<()> {
        require("host", &self.config.host)?;
        if self.config.port == 0 {
            return Err(NotifyError::InvalidConfig("port is required".to_string()));
        }
        require("from address", &self.config.from)?;
        require("to address", &self.config.to)
    }

    async fn send(&self, alert: &Alert) -> Result<SendReceipt> {
        let message = self.build_message(alert)?;
        let response = self
            .transport()?
            .send(message)
            .await
            .map_err(smtp_err)?;
        let code = response.code().to_string();
        tracing::debug!(host = %self.config.host, code = %code, "SMTP server accepted message");
        Ok(SendReceipt {
            status_code: code.parse().ok(),
            request_id: None,
            raw_response: response.first_line().map(str::to_string),
        })
    }

    fn name(&self) -> &str {
        "smtp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use machinemon_common::types::{AlertType, Severity};

    fn config() -> SmtpConfig {
        SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            from: "alerts@example.com".into(),
            to: "ops@example.com".into(),
            ..Default::default()
        }
    }

    fn alert() -> Alert {
        let mut alert = Alert::new(
            "42",
            AlertType::ProcessDied,
            Severity::Critical,
            "Process 'worker' is no longer running on 'web-01'",
        );
        alert.fired_at = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        alert
    }

    #[test]
    fn validate_requires_fields() {
        let provider = SmtpProvider::new(config(), Duration::from_secs(5));
        assert!(provider.validate().is_ok());

        let missing_port = SmtpProvider::new(
            SmtpConfig {
                port: 0,
                ..config()
            },
            Duration::from_secs(5),
        );
        let err = missing_port.validate().unwrap_err();
        assert!(err.to_string().contains("port is required"));

        let missing_to = SmtpProvider::new(
            SmtpConfig {
                to: " ".into(),
                ..config()
            },
            Duration::from_secs(5),
        );
        assert!(missing_to.validate().unwrap_err().to_string().contains("to address"));
    }

    #[test]
    fn implicit_tls_on_flag_or_port_465() {
        assert!(!config().implicit_tls());
        assert!(SmtpConfig {
            use_tls: true,
            ..config()
        }
        .implicit_tls());
        assert!(SmtpConfig {
            port: 465,
            ..config()
        }
        .implicit_tls());
    }

    #[test]
    fn subject_and_body_format() {
        let alert = alert();
        assert_eq!(
            SmtpProvider::subject(&alert),
            "[MachineMon CRITICAL] process_died"
        );
        let body = SmtpProvider::body(&alert);
        assert!(body.starts_with("Process 'worker' is no longer running"));
        assert!(body.contains("Fired at: 2024-05-01 12:30:00 UTC"));
    }

    #[test]
    fn message_builds_with_display_name() {
        let provider = SmtpProvider::new(config(), Duration::from_secs(5));
        let message = provider.build_message(&alert()).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        let from_line = raw.lines().find(|l| l.starts_with("From:")).unwrap();
        assert!(from_line.contains("MachineMon"));
        assert!(from_line.contains("<alerts@example.com>"));
        assert!(raw.contains("Subject: [MachineMon CRITICAL] process_died"));
    }
}
