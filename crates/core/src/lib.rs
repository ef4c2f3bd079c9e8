mod config;
mod events;
mod history;
mod identity;
mod instance;
mod manager;
mod paths;
mod system;

pub use config::*;
pub use events::*;
pub use history::*;
pub use identity::*;
pub use instance::*;
pub use manager::*;
pub use paths::*;
pub use system::*;

use minefleet_miner_adapters::AdapterError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error kinds surfaced to callers (and over the wire as the
/// `code` field of error bodies).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    PreconditionFailed,
    ResourceBusy,
    InvalidArgument,
    Launch,
    IntegrityViolation,
    Timeout,
    Cancelled,
    Unavailable,
    Internal,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("resource busy: {0}")]
    ResourceBusy(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to launch miner: {0}")]
    Launch(String),
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("cancelled")]
    Cancelled,
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            CoreError::ResourceBusy(_) => ErrorKind::ResourceBusy,
            CoreError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            CoreError::Launch(_) => ErrorKind::Launch,
            CoreError::IntegrityViolation(_) => ErrorKind::IntegrityViolation,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::Unavailable(_) => ErrorKind::Unavailable,
            CoreError::Internal(_) | CoreError::Io(_) | CoreError::Json(_) => ErrorKind::Internal,
        }
    }
}

impl From<AdapterError> for CoreError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::NotInstalled(kind) => {
                CoreError::PreconditionFailed(format!("miner not installed: {kind}"))
            }
            AdapterError::BinaryNotFound(msg) => CoreError::PreconditionFailed(msg),
            AdapterError::AlreadyRunning => {
                CoreError::ResourceBusy("miner already running".to_string())
            }
            AdapterError::ChecksumMismatch => {
                CoreError::IntegrityViolation("artifact checksum mismatch".to_string())
            }
            AdapterError::DownloadFailed(msg) => CoreError::Unavailable(msg),
            AdapterError::Process(msg) => CoreError::Launch(msg),
            AdapterError::Io(e) => CoreError::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_stably() {
        assert_eq!(CoreError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(CoreError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            CoreError::Internal("bug".into()).kind(),
            ErrorKind::Internal
        );
        let io: CoreError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(io.kind(), ErrorKind::Internal);
    }

    #[test]
    fn adapter_errors_map_into_taxonomy() {
        let e: CoreError = AdapterError::NotInstalled("xmrig".into()).into();
        assert_eq!(e.kind(), ErrorKind::PreconditionFailed);
        let e: CoreError = AdapterError::AlreadyRunning.into();
        assert_eq!(e.kind(), ErrorKind::ResourceBusy);
        let e: CoreError = AdapterError::Process("spawn failed".into()).into();
        assert_eq!(e.kind(), ErrorKind::Launch);
    }
}
