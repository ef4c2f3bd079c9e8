//! Secure peer sessions: framed, authenticated, encrypted streams over
//! TCP.
//!
//! Handshake: both ends exchange a plaintext hello carrying their
//! long-term identity, an ephemeral X25519 public key, and a random
//! challenge; a shared session key is derived from the key agreement and
//! both challenges, and each side proves its identity by signing the
//! handshake transcript inside the first encrypted frame. Every
//! subsequent frame is one ChaCha20-Poly1305 sealed envelope with a
//! per-direction monotonic counter nonce.

use crate::{OverlayError, Result};
use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use futures::{SinkExt, StreamExt};
use minefleet_core::{node_id_from_public_key, verifying_key_from_hex, NodeIdentity};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use x25519_dalek::{EphemeralSecret, PublicKey as XPublicKey};

pub(crate) const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
pub(crate) const KEEPALIVE_PERIOD: std::time::Duration = std::time::Duration::from_secs(15);
pub(crate) const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

const DIR_INITIATOR: u8 = 1;
const DIR_RESPONDER: u8 = 2;

pub(crate) type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// Plaintext first frame of a session: identity plus key-agreement
/// material. The whole struct feeds the signed transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeHello {
    pub node_id: String,
    pub name: String,
    /// Hex ed25519 identity key.
    pub public_key: String,
    /// Hex ephemeral X25519 public key.
    pub eph_public: String,
    /// Hex 16-byte random challenge.
    pub challenge: String,
    pub role: minefleet_core::NodeRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeConfirm {
    signature: String,
}

fn derive_session_key(shared: &[u8], init_challenge: &[u8], resp_challenge: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"minefleet-session-v1");
    hasher.update(shared);
    hasher.update(init_challenge);
    hasher.update(resp_challenge);
    hasher.finalize().into()
}

fn transcript_hash(init: &HandshakeHello, resp: &HandshakeHello) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(init)?);
    hasher.update(serde_json::to_vec(resp)?);
    Ok(hasher.finalize().into())
}

fn x25519_public_from_hex(hex_key: &str) -> Result<XPublicKey> {
    let bytes: [u8; 32] = hex::decode(hex_key)
        .map_err(|_| OverlayError::HandshakeFailed("bad ephemeral key encoding".to_string()))?
        .try_into()
        .map_err(|_| OverlayError::HandshakeFailed("bad ephemeral key length".to_string()))?;
    Ok(XPublicKey::from(bytes))
}

/// A mutually authenticated, encrypted, ordered channel to one peer.
pub struct SecureSession {
    peer_id: String,
    peer_name: String,
    peer_public_key: VerifyingKey,
    writer: tokio::sync::Mutex<FrameWriter>,
    cipher: ChaCha20Poly1305,
    send_direction: u8,
    recv_direction: u8,
    send_counter: AtomicU64,
    /// Minimum counter acceptable on the next inbound frame.
    recv_floor: Mutex<u64>,
    closed: AtomicBool,
}

impl SecureSession {
    fn new(
        peer_hello: &HandshakeHello,
        peer_public_key: VerifyingKey,
        writer: FrameWriter,
        session_key: [u8; 32],
        send_direction: u8,
    ) -> Self {
        let recv_direction = if send_direction == DIR_INITIATOR {
            DIR_RESPONDER
        } else {
            DIR_INITIATOR
        };
        Self {
            peer_id: peer_hello.node_id.clone(),
            peer_name: peer_hello.name.clone(),
            peer_public_key,
            writer: tokio::sync::Mutex::new(writer),
            cipher: ChaCha20Poly1305::new(Key::from_slice(&session_key)),
            send_direction,
            recv_direction,
            send_counter: AtomicU64::new(0),
            recv_floor: Mutex::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn peer_public_key(&self) -> &VerifyingKey {
        &self.peer_public_key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn nonce(direction: u8, counter: u64) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[0] = direction;
        bytes[4..].copy_from_slice(&counter.to_be_bytes());
        *Nonce::from_slice(&bytes)
    }

    fn seal(&self, counter: u64, plaintext: &[u8]) -> Result<Bytes> {
        let nonce = Self::nonce(self.send_direction, counter);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| OverlayError::Crypto("encryption failed".to_string()))?;
        let mut frame = Vec::with_capacity(8 + ciphertext.len());
        frame.extend_from_slice(&counter.to_be_bytes());
        frame.extend_from_slice(&ciphertext);
        Ok(Bytes::from(frame))
    }

    /// Decrypt one inbound frame, enforcing the monotonic counter.
    pub(crate) fn open_frame(&self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < 8 {
            return Err(OverlayError::Crypto("short frame".to_string()));
        }
        let counter = u64::from_be_bytes(frame[..8].try_into().unwrap_or_default());
        {
            let mut floor = self.recv_floor.lock();
            if counter < *floor {
                return Err(OverlayError::Replay(format!(
                    "frame counter {counter} below floor {floor}",
                    floor = *floor
                )));
            }
            *floor = counter + 1;
        }
        let nonce = Self::nonce(self.recv_direction, counter);
        self.cipher
            .decrypt(&nonce, &frame[8..])
            .map_err(|_| OverlayError::Crypto("frame authentication failed".to_string()))
    }

    /// Writes on a session are serialized by the write lock.
    pub(crate) async fn send_plain(&self, plaintext: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(OverlayError::Unavailable("session closed".to_string()));
        }
        let counter = self.send_counter.fetch_add(1, Ordering::SeqCst);
        let frame = self.seal(counter, plaintext)?;
        let mut writer = self.writer.lock().await;
        writer
            .send(frame)
            .await
            .map_err(|e| OverlayError::Unavailable(format!("session write: {e}")))
    }

    pub async fn send_envelope(&self, envelope: &crate::Envelope) -> Result<()> {
        self.send_plain(&serde_json::to_vec(envelope)?).await
    }

    pub async fn close(&self) {
        self.mark_closed();
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }
}

fn fresh_hello(identity: &NodeIdentity) -> (EphemeralSecret, HandshakeHello) {
    let eph_secret = EphemeralSecret::random_from_rng(OsRng);
    let eph_public = XPublicKey::from(&eph_secret);
    let challenge: [u8; 16] = rand::random();
    let hello = HandshakeHello {
        node_id: identity.id.clone(),
        name: identity.name.clone(),
        public_key: identity.public_key.clone(),
        eph_public: hex::encode(eph_public.as_bytes()),
        challenge: hex::encode(challenge),
        role: identity.role,
    };
    (eph_secret, hello)
}

fn validate_peer_hello(hello: &HandshakeHello) -> Result<VerifyingKey> {
    let key = verifying_key_from_hex(&hello.public_key)
        .map_err(|e| OverlayError::HandshakeFailed(e.to_string()))?;
    if node_id_from_public_key(key.as_bytes()) != hello.node_id {
        return Err(OverlayError::IdentityMismatch);
    }
    Ok(key)
}

async fn read_frame(reader: &mut FrameReader) -> Result<Bytes> {
    match reader.next().await {
        Some(Ok(bytes)) => Ok(bytes.freeze()),
        Some(Err(e)) => Err(OverlayError::Unavailable(format!("session read: {e}"))),
        None => Err(OverlayError::HandshakeFailed(
            "connection closed during handshake".to_string(),
        )),
    }
}

async fn exchange_confirms(
    session: &SecureSession,
    reader: &mut FrameReader,
    signing_key: &SigningKey,
    transcript: &[u8; 32],
) -> Result<()> {
    let signature = signing_key.sign(transcript);
    let confirm = HandshakeConfirm {
        signature: hex::encode(signature.to_bytes()),
    };
    session.send_plain(&serde_json::to_vec(&confirm)?).await?;

    let frame = read_frame(reader).await?;
    let plaintext = session.open_frame(&frame)?;
    let peer_confirm: HandshakeConfirm = serde_json::from_slice(&plaintext)?;
    let signature_bytes = hex::decode(&peer_confirm.signature)
        .map_err(|_| OverlayError::SignatureInvalid)?;
    let signature =
        Signature::from_slice(&signature_bytes).map_err(|_| OverlayError::SignatureInvalid)?;
    session
        .peer_public_key
        .verify(transcript, &signature)
        .map_err(|_| OverlayError::SignatureInvalid)
}

/// Dial a peer and establish an authenticated session. When the peer's
/// recorded public key is known it must match the one presented, else the
/// session aborts with an identity mismatch.
pub async fn connect(
    address: &str,
    identity: &NodeIdentity,
    signing_key: &SigningKey,
    expected_key: Option<&VerifyingKey>,
) -> Result<(Arc<SecureSession>, FrameReader, HandshakeHello)> {
    tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        connect_inner(address, identity, signing_key, expected_key),
    )
    .await
    .map_err(|_| OverlayError::Timeout("handshake".to_string()))?
}

async fn connect_inner(
    address: &str,
    identity: &NodeIdentity,
    signing_key: &SigningKey,
    expected_key: Option<&VerifyingKey>,
) -> Result<(Arc<SecureSession>, FrameReader, HandshakeHello)> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| OverlayError::Unavailable(format!("dial {address}: {e}")))?;
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
    let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());

    let (eph_secret, my_hello) = fresh_hello(identity);
    writer
        .send(Bytes::from(serde_json::to_vec(&my_hello)?))
        .await
        .map_err(|e| OverlayError::Unavailable(format!("handshake write: {e}")))?;

    let frame = read_frame(&mut reader).await?;
    let peer_hello: HandshakeHello = serde_json::from_slice(&frame)?;
    let peer_key = validate_peer_hello(&peer_hello)?;
    if let Some(expected) = expected_key {
        if expected != &peer_key {
            return Err(OverlayError::IdentityMismatch);
        }
    }

    let shared = eph_secret.diffie_hellman(&x25519_public_from_hex(&peer_hello.eph_public)?);
    let session_key = derive_session_key(
        shared.as_bytes(),
        &hex::decode(&my_hello.challenge).unwrap_or_default(),
        &hex::decode(&peer_hello.challenge).unwrap_or_default(),
    );
    let transcript = transcript_hash(&my_hello, &peer_hello)?;

    let session = SecureSession::new(&peer_hello, peer_key, writer, session_key, DIR_INITIATOR);
    exchange_confirms(&session, &mut reader, signing_key, &transcript).await?;
    Ok((Arc::new(session), reader, peer_hello))
}

/// Responder half of the handshake for one accepted connection.
pub(crate) async fn accept(
    stream: TcpStream,
    identity: &NodeIdentity,
    signing_key: &SigningKey,
    recorded_key_for: impl Fn(&str) -> Option<String>,
) -> Result<(Arc<SecureSession>, FrameReader, HandshakeHello)> {
    tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        accept_inner(stream, identity, signing_key, recorded_key_for),
    )
    .await
    .map_err(|_| OverlayError::Timeout("handshake".to_string()))?
}

async fn accept_inner(
    stream: TcpStream,
    identity: &NodeIdentity,
    signing_key: &SigningKey,
    recorded_key_for: impl Fn(&str) -> Option<String>,
) -> Result<(Arc<SecureSession>, FrameReader, HandshakeHello)> {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
    let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());

    let frame = read_frame(&mut reader).await?;
    let peer_hello: HandshakeHello = serde_json::from_slice(&frame)?;
    let peer_key = validate_peer_hello(&peer_hello)?;

    // A record that already pins a key for this identity must agree.
    if let Some(recorded) = recorded_key_for(&peer_hello.node_id) {
        if recorded != peer_hello.public_key {
            return Err(OverlayError::IdentityMismatch);
        }
    }

    let (eph_secret, my_hello) = fresh_hello(identity);
    writer
        .send(Bytes::from(serde_json::to_vec(&my_hello)?))
        .await
        .map_err(|e| OverlayError::Unavailable(format!("handshake write: {e}")))?;

    let shared = eph_secret.diffie_hellman(&x25519_public_from_hex(&peer_hello.eph_public)?);
    // Challenge order is fixed by role: initiator first.
    let session_key = derive_session_key(
        shared.as_bytes(),
        &hex::decode(&peer_hello.challenge).unwrap_or_default(),
        &hex::decode(&my_hello.challenge).unwrap_or_default(),
    );
    let transcript = transcript_hash(&peer_hello, &my_hello)?;

    let session = SecureSession::new(&peer_hello, peer_key, writer, session_key, DIR_RESPONDER);
    exchange_confirms(&session, &mut reader, signing_key, &transcript).await?;
    Ok((Arc::new(session), reader, peer_hello))
}

/// Open sessions indexed by peer node id. The transport exclusively owns
/// socket sessions; everything else holds `Arc`s handed out from here.
#[derive(Default)]
pub struct ConnectionPool {
    sessions: tokio::sync::RwLock<HashMap<String, Arc<SecureSession>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, peer_id: &str) -> Option<Arc<SecureSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(peer_id)
            .filter(|s| !s.is_closed())
            .cloned()
    }

    pub async fn insert(&self, session: Arc<SecureSession>) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.peer_id().to_string(), session);
    }

    pub async fn remove(&self, peer_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.remove(peer_id) {
            session.mark_closed();
        }
    }

    pub async fn all(&self) -> Vec<Arc<SecureSession>> {
        let sessions = self.sessions.read().await;
        sessions.values().filter(|s| !s.is_closed()).cloned().collect()
    }
}
