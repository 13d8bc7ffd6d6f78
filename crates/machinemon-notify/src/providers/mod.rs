pub mod pushover;
pub mod smtp;
pub mod twilio;

use crate::error::{NotifyError, Result};
use machinemon_common::types::Severity;

/// Fails with `"<field> is required"` when `value` is blank.
pub(crate) fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(NotifyError::InvalidConfig(format!("{field} is required")));
    }
    Ok(())
}

pub(crate) fn severity_label(severity: Severity) -> String {
    severity.to_string().to_uppercase()
}

pub(crate) fn http_client(timeout: std::time::Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}
