use machinemon_storage::StorageError;

/// Errors raised by a single notification provider.
///
/// # Examples
///
/// ```rust
/// use machinemon_notify::error::NotifyError;
///
/// let err = NotifyError::InvalidConfig("user_key is required".to_string());
/// assert!(err.to_string().contains("user_key"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Provider configuration is missing a required field or could not be decoded.
    #[error("Notify: invalid provider configuration: {0}")]
    InvalidConfig(String),

    /// The provider row names a type no provider implements.
    #[error("Notify: unknown provider type '{0}'")]
    UnknownProviderType(String),

    /// An HTTP request to the provider's API failed before a response arrived.
    #[error("Notify: HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// SMTP transport or message construction error.
    #[error("Notify: SMTP error: {0}")]
    Smtp(String),

    /// The provider's API returned a non-success response.
    #[error("Notify: API error from {service}: status={status}, body={body}")]
    Api {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// The send did not finish within the configured timeout.
    #[error("Notify: send timed out after {0}s")]
    Timeout(u64),
}

/// Convenience `Result` alias for provider operations.
pub type Result<T> = std::result::Result<T, NotifyError>;

/// One provider's failure within a dispatch.
#[derive(Debug)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: NotifyError,
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "provider {}: {}", self.provider, self.error)
    }
}

fn join_failures(failures: &[ProviderFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors returned by the [`crate::dispatcher::Dispatcher`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Dispatch: storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Dispatch: provider {0} not found")]
    ProviderNotFound(i64),

    /// The provider's stored config failed to decode or validate. Nothing was sent.
    #[error("Dispatch: invalid {provider_type} config: {source}")]
    Misconfigured {
        provider_type: String,
        #[source]
        source: NotifyError,
    },

    /// A single targeted send (test alert) failed.
    #[error("Dispatch: provider {provider}: {source}")]
    SendFailed {
        provider: String,
        #[source]
        source: NotifyError,
    },

    /// Some providers failed; the others still received the alert.
    #[error(
        "Dispatch: {} of {attempted} providers failed: {}",
        .failures.len(),
        join_failures(.failures)
    )]
    Partial {
        attempted: usize,
        failures: Vec<ProviderFailure>,
    },
}
