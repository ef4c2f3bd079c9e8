//! Signed message envelopes: the authenticated unit of peer-to-peer
//! communication.

use crate::{OverlayError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Closed set of wire message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Handshake,
    Ping,
    Pong,
    GetStats,
    Stats,
    StartMiner,
    StopMiner,
    Ack,
    Error,
    GetLogs,
    Logs,
    Deploy,
    DeployAck,
}

impl MessageType {
    /// Replies correlate to a prior request; everything else initiates.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            MessageType::Pong
                | MessageType::Stats
                | MessageType::Ack
                | MessageType::Error
                | MessageType::Logs
                | MessageType::DeployAck
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub from_id: String,
    pub to_id: String,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub signature: String,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Envelope {
    pub fn new(
        msg_type: MessageType,
        from_id: &str,
        to_id: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            msg_type,
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            timestamp: now(),
            in_reply_to: None,
            payload,
            signature: String::new(),
        }
    }

    pub fn reply_to(
        request: &Envelope,
        msg_type: MessageType,
        from_id: &str,
        payload: serde_json::Value,
    ) -> Self {
        let mut envelope = Self::new(msg_type, from_id, &request.from_id, payload);
        envelope.in_reply_to = Some(request.id.clone());
        envelope
    }

    /// The signature covers every header field plus a digest of the
    /// payload, so any bit of the signed region invalidates it.
    fn signable_bytes(&self) -> Vec<u8> {
        let payload_bytes = serde_json::to_vec(&self.payload).unwrap_or_default();
        let mut payload_hasher = Sha256::new();
        payload_hasher.update(&payload_bytes);
        let payload_hash = payload_hasher.finalize();

        let header = format!(
            "{}|{:?}|{}|{}|{}|",
            self.id, self.msg_type, self.from_id, self.to_id, self.timestamp
        );
        let mut bytes = header.into_bytes();
        bytes.extend_from_slice(&payload_hash);
        bytes
    }

    pub fn sign(&mut self, key: &SigningKey) {
        let signature = key.sign(&self.signable_bytes());
        self.signature = hex::encode(signature.to_bytes());
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        let bytes = hex::decode(&self.signature).map_err(|_| OverlayError::SignatureInvalid)?;
        let signature =
            Signature::from_slice(&bytes).map_err(|_| OverlayError::SignatureInvalid)?;
        key.verify(&self.signable_bytes(), &signature)
            .map_err(|_| OverlayError::SignatureInvalid)
    }

    /// Age relative to the local clock, absolute.
    pub fn skew_secs(&self) -> u64 {
        now().abs_diff(self.timestamp)
    }
}

// Typed payloads carried inside envelopes.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsPayload {
    pub miners: Vec<minefleet_core::MinerSummary>,
    pub total_hashrate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMinerPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<minefleet_miner_adapters::MinerKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<minefleet_miner_adapters::MinerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopMinerPayload {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub miner_name: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLogsPayload {
    pub miner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsPayload {
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error: String,
    pub code: minefleet_core::ErrorKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployPayload {
    pub profiles: Vec<minefleet_core::Profile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployAckPayload {
    pub accepted: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypair() -> (SigningKey, VerifyingKey) {
        let signing = SigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();
        (signing, verifying)
    }

    #[test]
    fn sign_verify_round_trip() {
        let (signing, verifying) = keypair();
        let mut envelope = Envelope::new(
            MessageType::Ping,
            "aaaa",
            "bbbb",
            serde_json::json!({}),
        );
        envelope.sign(&signing);
        assert!(envelope.verify(&verifying).is_ok());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let (signing, _) = keypair();
        let (_, other_verifying) = keypair();
        let mut envelope = Envelope::new(
            MessageType::Ping,
            "aaaa",
            "bbbb",
            serde_json::json!({}),
        );
        envelope.sign(&signing);
        assert!(envelope.verify(&other_verifying).is_err());
    }

    #[test]
    fn mutating_signed_region_fails_verification() {
        let (signing, verifying) = keypair();
        let mut envelope = Envelope::new(
            MessageType::GetStats,
            "aaaa",
            "bbbb",
            serde_json::json!({"limit": 10}),
        );
        envelope.sign(&signing);

        let mut tampered = envelope.clone();
        tampered.payload = serde_json::json!({"limit": 11});
        assert!(tampered.verify(&verifying).is_err());

        let mut tampered = envelope.clone();
        tampered.from_id = "cccc".to_string();
        assert!(tampered.verify(&verifying).is_err());

        let mut tampered = envelope.clone();
        tampered.timestamp += 1;
        assert!(tampered.verify(&verifying).is_err());
    }

    #[test]
    fn replies_carry_correlation() {
        let request = Envelope::new(MessageType::GetStats, "aaaa", "bbbb", serde_json::json!({}));
        let reply = Envelope::reply_to(
            &request,
            MessageType::Stats,
            "bbbb",
            serde_json::json!({"miners": [], "totalHashrate": 0.0}),
        );
        assert_eq!(reply.in_reply_to.as_deref(), Some(request.id.as_str()));
        assert_eq!(reply.to_id, "aaaa");
        assert!(reply.msg_type.is_reply());
        assert!(!request.msg_type.is_reply());
    }

    #[test]
    fn envelope_serde_round_trip() {
        let (signing, _) = keypair();
        let mut envelope = Envelope::new(
            MessageType::StartMiner,
            "aaaa",
            "bbbb",
            serde_json::to_value(StartMinerPayload {
                profile_id: Some("p1".to_string()),
                kind: None,
                config: None,
            })
            .unwrap(),
        );
        envelope.sign(&signing);

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"type\":\"start_miner\""));
        let decoded: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.id, envelope.id);
        assert_eq!(decoded.signature, envelope.signature);
    }
}
