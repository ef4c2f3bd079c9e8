//! Node identity: a long-lived ed25519 keypair plus the derived node ID.
//!
//! The public identity lives in `node.json`; the private key is kept in a
//! separate owner-only file and is never serialized with the identity.

use crate::{atomic_write_json, CoreError, Result};
use ed25519_dalek::VerifyingKey;
pub use ed25519_dalek::SigningKey;
use fs2::FileExt;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Controller,
    Worker,
    Dual,
}

impl Default for NodeRole {
    fn default() -> Self {
        NodeRole::Dual
    }
}

/// Public node identity as persisted in `node.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    pub id: String,
    pub name: String,
    /// Hex-encoded ed25519 verifying key.
    pub public_key: String,
    pub created_at: u64,
    pub role: NodeRole,
}

/// Deterministic short hash of a public key.
pub fn node_id_from_public_key(public_key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    hex::encode(&hasher.finalize()[..8])
}

pub struct IdentityStore {
    identity_path: PathBuf,
    key_path: PathBuf,
}

impl IdentityStore {
    pub fn new(identity_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            identity_path,
            key_path,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.identity_path.exists() && self.key_path.exists()
    }

    /// Generate and persist a fresh identity. Re-initialising an existing
    /// node is refused; the caller must remove the old identity first.
    pub fn init(&self, name: &str, role: NodeRole) -> Result<(NodeIdentity, SigningKey)> {
        if self.is_initialized() {
            return Err(CoreError::ResourceBusy(
                "node identity already initialized".to_string(),
            ));
        }

        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let identity = NodeIdentity {
            id: node_id_from_public_key(verifying_key.as_bytes()),
            name: name.to_string(),
            public_key: hex::encode(verifying_key.as_bytes()),
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            role,
        };

        self.write_private_key(&signing_key)?;
        atomic_write_json(&self.identity_path, &identity)?;
        info!("Initialized node identity {} ({})", identity.id, identity.name);
        Ok((identity, signing_key))
    }

    /// Load the persisted identity, or `None` when not yet initialized.
    pub fn load(&self) -> Result<Option<(NodeIdentity, SigningKey)>> {
        if !self.is_initialized() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.identity_path)?;
        let identity: NodeIdentity = serde_json::from_str(&content)?;

        let key_hex = std::fs::read_to_string(&self.key_path)?;
        let key_bytes: [u8; 32] = hex::decode(key_hex.trim())
            .map_err(|e| CoreError::IntegrityViolation(format!("bad private key encoding: {e}")))?
            .try_into()
            .map_err(|_| CoreError::IntegrityViolation("bad private key length".to_string()))?;
        let signing_key = SigningKey::from_bytes(&key_bytes);

        // The persisted public key must belong to the private key on disk.
        let expected = hex::encode(signing_key.verifying_key().as_bytes());
        if identity.public_key != expected {
            return Err(CoreError::IntegrityViolation(
                "node.json public key does not match private key".to_string(),
            ));
        }

        Ok(Some((identity, signing_key)))
    }

    fn write_private_key(&self, signing_key: &SigningKey) -> Result<()> {
        if let Some(parent) = self.key_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.key_path)?;
        file.lock_exclusive()?;
        let result = file
            .write_all(hex::encode(signing_key.to_bytes()).as_bytes())
            .and_then(|_| file.sync_all());
        let _ = file.unlock();
        result?;
        Ok(())
    }
}

/// Parse a hex-encoded verifying key.
pub fn verifying_key_from_hex(hex_key: &str) -> Result<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(hex_key)
        .map_err(|e| CoreError::InvalidArgument(format!("bad public key encoding: {e}")))?
        .try_into()
        .map_err(|_| CoreError::InvalidArgument("bad public key length".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| CoreError::InvalidArgument(format!("bad public key: {e}")))
}
