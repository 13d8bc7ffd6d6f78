use machinemon_notify::DispatchError;
use machinemon_storage::StorageError;

/// Errors that abort one unit of engine work (a check-in evaluation, a sweep).
///
/// Dispatch failures never surface here: a persisted alert that failed to
/// reach its providers is logged and stays un-notified.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("Alert: storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Alert: client {0} not found")]
    ClientNotFound(String),

    #[error("Alert: {0}")]
    Dispatch(#[from] DispatchError),
}

pub type Result<T> = std::result::Result<T, AlertError>;
