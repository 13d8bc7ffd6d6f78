use crate::error::{NotifyError, Result};
use crate::providers::pushover::{PushoverConfig, PushoverProvider};
use crate::providers::smtp::{SmtpConfig, SmtpProvider};
use crate::providers::twilio::{TwilioConfig, TwilioProvider};
use crate::NotificationProvider;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Decoded provider configuration, one variant per supported provider type.
///
/// # Examples
///
/// ```
/// use machinemon_notify::ProviderConfig;
///
/// let cfg = ProviderConfig::decode("pushover", r#"{"app_token":"a","user_key":"u"}"#).unwrap();
/// assert_eq!(cfg.provider_type(), "pushover");
/// assert!(ProviderConfig::decode("carrier-pigeon", "{}").is_err());
/// ```
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    Twilio(TwilioConfig),
    Pushover(PushoverConfig),
    Smtp(SmtpConfig),
}

impl ProviderConfig {
    pub const TYPES: [&'static str; 3] = ["twilio", "pushover", "smtp"];

    /// Decodes a provider row's JSON config according to its type tag.
    pub fn decode(provider_type: &str, config: &str) -> Result<Self> {
        match provider_type {
            "twilio" => Ok(Self::Twilio(parse("twilio", config)?)),
            "pushover" => Ok(Self::Pushover(parse("pushover", config)?)),
            "smtp" => Ok(Self::Smtp(parse("smtp", config)?)),
            other => Err(NotifyError::UnknownProviderType(other.to_string())),
        }
    }

    pub fn provider_type(&self) -> &'static str {
        match self {
            Self::Twilio(_) => "twilio",
            Self::Pushover(_) => "pushover",
            Self::Smtp(_) => "smtp",
        }
    }

    /// Builds the sender. `timeout` bounds each network call it makes.
    pub fn build(self, timeout: Duration) -> Result<Box<dyn NotificationProvider>> {
        Ok(match self {
            Self::Twilio(cfg) => Box::new(TwilioProvider::new(cfg, timeout)?),
            Self::Pushover(cfg) => Box::new(PushoverProvider::new(cfg, timeout)?),
            Self::Smtp(cfg) => Box::new(SmtpProvider::new(cfg, timeout)),
        })
    }
}

fn parse<T: DeserializeOwned>(kind: &str, config: &str) -> Result<T> {
    let config = if config.trim().is_empty() { "{}" } else { config };
    serde_json::from_str(config).map_err(|e| NotifyError::InvalidConfig(format!("{kind}: {e}")))
}
