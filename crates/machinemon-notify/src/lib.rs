//! Alert delivery for MachineMon.
//!
//! A fired [`Alert`] is fanned out by the [`dispatcher::Dispatcher`] to every
//! enabled provider row. Each row's opaque JSON config is decoded once into a
//! [`config::ProviderConfig`] and turned into a [`NotificationProvider`]:
//! Twilio SMS, Pushover push notifications or SMTP email.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod providers;
pub mod utils;


pub use config::ProviderConfig;
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, NotifyError, Result};

use async_trait::async_trait;
use machinemon_common::types::Alert;

/// Delivery metadata reported by a provider's upstream API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    /// HTTP status (or SMTP reply code) of the final response.
    pub status_code: Option<u16>,
    /// Vendor-assigned id for the accepted message, if the API returns one.
    pub request_id: Option<String>,
    pub raw_response: Option<String>,
}

/// A notification sender for one configured provider.
///
/// Implementations are built from a [`ProviderConfig`] by
/// [`ProviderConfig::build`].
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    /// Checks that required fields are present. Never touches the network.
    fn validate(&self) -> Result<()>;

    /// Delivers the alert. Non-success upstream responses are returned as
    /// [`NotifyError::Api`] carrying the status and body.
    async fn send(&self, alert: &Alert) -> Result<SendReceipt>;

    /// Provider type name (`"twilio"`, `"pushover"`, `"smtp"`).
    fn name(&self) -> &str;
}
