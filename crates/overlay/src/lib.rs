mod envelope;
mod peers;
mod remote;
mod router;
mod transport;

pub use envelope::*;
pub use peers::*;
pub use remote::*;
pub use router::*;
pub use transport::{connect, ConnectionPool, HandshakeHello, SecureSession};

use minefleet_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("peer identity mismatch")]
    IdentityMismatch,
    #[error("envelope signature invalid")]
    SignatureInvalid,
    #[error("sender not authorized: {0}")]
    Unauthorized(String),
    #[error("replayed or skewed envelope: {0}")]
    Replay(String),
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("peer unavailable: {0}")]
    Unavailable(String),
    #[error("remote error: {0}")]
    Remote(CoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OverlayError>;

impl From<OverlayError> for CoreError {
    fn from(e: OverlayError) -> Self {
        match e {
            OverlayError::NotFound(msg) => CoreError::NotFound(msg),
            OverlayError::AlreadyExists(msg) => CoreError::ResourceBusy(msg),
            OverlayError::IdentityMismatch => {
                CoreError::IntegrityViolation("peer identity mismatch".to_string())
            }
            OverlayError::SignatureInvalid => {
                CoreError::IntegrityViolation("envelope signature invalid".to_string())
            }
            OverlayError::Unauthorized(msg) => {
                CoreError::IntegrityViolation(format!("sender not authorized: {msg}"))
            }
            OverlayError::Replay(msg) => {
                CoreError::IntegrityViolation(format!("replayed envelope: {msg}"))
            }
            OverlayError::Crypto(msg) => CoreError::IntegrityViolation(msg),
            OverlayError::HandshakeFailed(msg) => CoreError::Unavailable(msg),
            OverlayError::Timeout(msg) => CoreError::Timeout(msg),
            OverlayError::Unavailable(msg) => CoreError::Unavailable(msg),
            OverlayError::Remote(inner) => inner,
            OverlayError::Io(e) => CoreError::Unavailable(e.to_string()),
            OverlayError::Json(e) => CoreError::Internal(e.to_string()),
            OverlayError::Internal(msg) => CoreError::Internal(msg),
        }
    }
}
