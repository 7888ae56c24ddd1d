use std::future::Future;
use std::path::PathBuf;

use pincode_common::retry::RetryPolicy;
use pincode_common::store::StoreError;
use thiserror::Error;

/// Enumeration of errors that can happen while looking up a single pincode.
/// None of these abort the batch or the scan: they end up in the failure report.
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("lookup request failed: {0}")]
    NetworkError(#[from] reqwest::Error),
    #[error("lookup response could not be decoded: {0}")]
    DecodeError(#[from] serde_json::Error),
    #[error("lookup returned no records: {0}")]
    EmptyResult(String),
}

impl LookupError {
    pub fn kind(&self) -> FailureKind {
        match self {
            LookupError::NetworkError(_) => FailureKind::NetworkError,
            LookupError::DecodeError(_) => FailureKind::DecodeError,
            LookupError::EmptyResult(_) => FailureKind::EmptyResult,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NetworkError,
    DecodeError,
    EmptyResult,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NetworkError => "network_error",
            FailureKind::DecodeError => "decode_error",
            FailureKind::EmptyResult => "empty_result",
        }
    }
}

/// Enumeration of errors reading the input pincode list.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("failed to read input file {}: {error}", .path.display())]
    Io {
        path: PathBuf,
        error: std::io::Error,
    },
}

/// Enumeration of errors that end a scan.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("shared store unavailable for {operation} after {attempts} attempts: {source}")]
    StorageUnavailable {
        operation: &'static str,
        attempts: u32,
        source: StoreError,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Input(#[from] InputError),
}

/// Run a store operation under `policy`, turning exhaustion into `ScanError::StorageUnavailable`.
pub(crate) async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    f: F,
) -> Result<T, ScanError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    policy
        .run(operation, f)
        .await
        .map_err(|exhausted| ScanError::StorageUnavailable {
            operation,
            attempts: exhausted.attempts,
            source: exhausted.error,
        })
}
