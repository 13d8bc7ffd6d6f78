use crate::config::ProviderConfig;
use crate::error::{DispatchError, NotifyError, ProviderFailure};
use crate::{NotificationProvider, SendReceipt};
use futures::future::join_all;
use machinemon_common::types::{Alert, AlertProvider, AlertType, Severity, TestAlertResult};
use machinemon_storage::SnapshotStore;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

const TEST_ALERT_MESSAGE: &str = "This is a test alert from MachineMon.";

/// Fans fired alerts out to every enabled provider.
pub struct Dispatcher {
    store: Arc<dyn SnapshotStore>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn SnapshotStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Sends `alert` to all enabled providers concurrently.
    ///
    /// Every provider is attempted regardless of the others. The alert is
    /// marked notified only when all of them succeed; otherwise the error
    /// names each provider that failed. Having no enabled providers is not an
    /// error and leaves the alert un-notified.
    pub async fn dispatch(&self, alert: &Alert) -> Result<(), DispatchError> {
        let providers = self.store.get_enabled_providers()?;
        if providers.is_empty() {
            tracing::debug!(alert_id = alert.id, "No alert providers configured, skipping dispatch");
            return Ok(());
        }

        let results = join_all(providers.iter().map(|row| self.send_one(row, alert))).await;
        let failures: Vec<ProviderFailure> = results.into_iter().filter_map(|r| r.err()).collect();
        if !failures.is_empty() {
            return Err(DispatchError::Partial {
                attempted: providers.len(),
                failures,
            });
        }

        self.store.mark_alert_notified(alert.id)?;
        Ok(())
    }

    async fn send_one(
        &self,
        row: &AlertProvider,
        alert: &Alert,
    ) -> Result<SendReceipt, ProviderFailure> {
        let fail = |error: NotifyError| {
            tracing::error!(
                provider = %row.name,
                provider_type = %row.provider_type,
                alert_id = alert.id,
                error = %error,
                "Failed to send alert"
            );
            ProviderFailure {
                provider: row.name.clone(),
                error,
            }
        };

        let provider = self.resolve(row).map_err(fail)?;
        match self.send_with_timeout(provider.as_ref(), alert).await {
            Ok(receipt) => {
                tracing::info!(
                    provider = %row.name,
                    alert_id = alert.id,
                    alert_type = %alert.alert_type,
                    "Alert sent"
                );
                Ok(receipt)
            }
            Err(e) => Err(fail(e)),
        }
    }

    /// Decodes and validates a provider row into a ready sender.
    fn resolve(&self, row: &AlertProvider) -> crate::Result<Box<dyn NotificationProvider>> {
        let provider = ProviderConfig::decode(&row.provider_type, &row.config)?.build(self.timeout)?;
        provider.validate()?;
        Ok(provider)
    }

    async fn send_with_timeout(
        &self,
        provider: &dyn NotificationProvider,
        alert: &Alert,
    ) -> crate::Result<SendReceipt> {
        match tokio::time::timeout(self.timeout, provider.send(alert)).await {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Timeout(self.timeout.as_secs())),
        }
    }

    /// Sends a synthetic `test` alert through one provider and reports the
    /// upstream response for diagnostics. Configuration problems are reported
    /// as [`DispatchError::Misconfigured`] without attempting a send.
    pub async fn send_test_alert(&self, provider_id: i64) -> Result<TestAlertResult, DispatchError> {
        let row = self
            .store
            .get_provider(provider_id)?
            .ok_or(DispatchError::ProviderNotFound(provider_id))?;
        let provider = self
            .resolve(&row)
            .map_err(|source| DispatchError::Misconfigured {
                provider_type: row.provider_type.clone(),
                source,
            })?;

        let alert = Alert::new("", AlertType::Test, Severity::Info, TEST_ALERT_MESSAGE);
        let receipt = self
            .send_with_timeout(provider.as_ref(), &alert)
            .await
            .map_err(|source| DispatchError::SendFailed {
                provider: row.name.clone(),
                source,
            })?;

        tracing::info!(provider = %row.name, provider_type = %row.provider_type, "Test alert sent");
        Ok(TestAlertResult {
            message: describe_receipt(&row.provider_type, &receipt),
            provider: row.provider_type,
            api_status_code: receipt.status_code,
            api_response: receipt.raw_response,
        })
    }
}

/// `"pushover accepted test alert (status 200, request=abc)"`
fn describe_receipt(provider_type: &str, receipt: &SendReceipt) -> String {
    let mut details = Vec::new();
    if let Some(code) = receipt.status_code {
        details.push(format!("status {code}"));
    }
    if let Some(id) = &receipt.request_id {
        details.push(format!("request={id}"));
    }
    if details.is_empty() {
        format!("{provider_type} accepted test alert")
    } else {
        format!("{provider_type} accepted test alert ({})", details.join(", "))
    }
}
