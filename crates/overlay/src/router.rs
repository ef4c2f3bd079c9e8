//! Message router: request/response dispatch over secure sessions,
//! envelope verification, correlation with deadlines, replay defense, and
//! the worker-side handlers that project overlay requests onto the local
//! miner manager.

use crate::transport::{self, FrameReader, IDLE_TIMEOUT, KEEPALIVE_PERIOD};
use crate::{
    AckPayload, ConnectionPool, DeployAckPayload, DeployPayload, Envelope, ErrorPayload,
    GetLogsPayload, LogsPayload, MessageType, OverlayError, PeerRegistry, Result, SecureSession,
    StartMinerPayload, StatsPayload, StopMinerPayload,
};
use ed25519_dalek::SigningKey;
use minefleet_core::{CoreError, ErrorKind, MinerManager, NodeIdentity, ProfileStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Envelopes older than this (either direction) are rejected, and ids are
/// remembered for the same window to reject duplicates.
const SKEW_BOUND: Duration = Duration::from_secs(300);

const PING_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LOG_LIMIT: usize = 100;

/// Reliability penalty applied on an integrity violation.
const INTEGRITY_PENALTY: f64 = 10.0;

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn core_error_from(code: ErrorKind, message: String) -> CoreError {
    match code {
        ErrorKind::NotFound => CoreError::NotFound(message),
        ErrorKind::PreconditionFailed => CoreError::PreconditionFailed(message),
        ErrorKind::ResourceBusy => CoreError::ResourceBusy(message),
        ErrorKind::InvalidArgument => CoreError::InvalidArgument(message),
        ErrorKind::Launch => CoreError::Launch(message),
        ErrorKind::IntegrityViolation => CoreError::IntegrityViolation(message),
        ErrorKind::Timeout => CoreError::Timeout(message),
        ErrorKind::Cancelled => CoreError::Cancelled,
        ErrorKind::Unavailable => CoreError::Unavailable(message),
        ErrorKind::Internal => CoreError::Internal(message),
    }
}

fn error_reply(error: &CoreError) -> (MessageType, serde_json::Value) {
    let payload = ErrorPayload {
        error: error.to_string(),
        code: error.kind(),
    };
    (
        MessageType::Error,
        serde_json::to_value(payload).unwrap_or_default(),
    )
}

pub struct MessageRouter {
    identity: NodeIdentity,
    signing_key: SigningKey,
    registry: Arc<PeerRegistry>,
    pool: ConnectionPool,
    manager: Arc<MinerManager>,
    profiles: Arc<ProfileStore>,
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    seen: Mutex<HashMap<String, u64>>,
    request_timeout: Duration,
    /// Handed to per-session reader tasks so they can dispatch back into
    /// the router without keeping it alive forever.
    self_ref: Weak<MessageRouter>,
}

impl MessageRouter {
    pub fn new(
        identity: NodeIdentity,
        signing_key: SigningKey,
        registry: Arc<PeerRegistry>,
        manager: Arc<MinerManager>,
        profiles: Arc<ProfileStore>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            identity,
            signing_key,
            registry,
            pool: ConnectionPool::new(),
            manager,
            profiles,
            pending: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashMap::new()),
            request_timeout,
            self_ref: self_ref.clone(),
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Reuse the open session to a peer or dial a fresh one.
    pub async fn ensure_session(&self, peer_id: &str) -> Result<Arc<SecureSession>> {
        if let Some(session) = self.pool.get(peer_id).await {
            return Ok(session);
        }

        let peer = self.registry.get(peer_id)?;
        let expected = peer
            .public_key
            .as_deref()
            .map(minefleet_core::verifying_key_from_hex)
            .transpose()
            .map_err(|e| OverlayError::Internal(e.to_string()))?;

        let (session, reader, hello) = transport::connect(
            &peer.address,
            &self.identity,
            &self.signing_key,
            expected.as_ref(),
        )
        .await?;

        // First contact with a provisional record pins the learned key
        // and migrates the record to the key-derived node id.
        let _ = self.registry.pin_identity(&peer.id, &hello.public_key);
        self.registry.record_seen(session.peer_id());

        self.pool.insert(Arc::clone(&session)).await;
        Self::spawn_reader(self.self_ref.clone(), Arc::clone(&session), reader);
        Ok(session)
    }

    /// Send a signed request and await its correlated reply within the
    /// deadline. A late reply is discarded; an `error` reply surfaces as
    /// the remote's error kind.
    pub async fn request(
        &self,
        peer_id: &str,
        msg_type: MessageType,
        payload: serde_json::Value,
    ) -> Result<Envelope> {
        let session = self.ensure_session(peer_id).await?;
        self.request_on(&session, msg_type, payload, self.request_timeout)
            .await
    }

    async fn request_on(
        &self,
        session: &Arc<SecureSession>,
        msg_type: MessageType,
        payload: serde_json::Value,
        deadline: Duration,
    ) -> Result<Envelope> {
        let mut envelope =
            Envelope::new(msg_type, &self.identity.id, session.peer_id(), payload);
        envelope.sign(&self.signing_key);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(envelope.id.clone(), tx);

        if let Err(e) = session.send_envelope(&envelope).await {
            self.pending.lock().remove(&envelope.id);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => {
                if reply.msg_type == MessageType::Error {
                    let payload: ErrorPayload = serde_json::from_value(reply.payload)
                        .unwrap_or_else(|_| ErrorPayload {
                            error: "unparseable remote error".to_string(),
                            code: ErrorKind::Internal,
                        });
                    return Err(OverlayError::Remote(core_error_from(
                        payload.code,
                        payload.error,
                    )));
                }
                Ok(reply)
            }
            Ok(Err(_)) => {
                self.pending.lock().remove(&envelope.id);
                Err(OverlayError::Unavailable("session dropped".to_string()))
            }
            Err(_) => {
                self.pending.lock().remove(&envelope.id);
                Err(OverlayError::Timeout(format!(
                    "request to {} exceeded {:?}",
                    session.peer_id(),
                    deadline
                )))
            }
        }
    }

    /// Liveness probe returning the measured round trip in milliseconds.
    pub async fn ping(&self, peer_id: &str) -> Result<u64> {
        let session = self.ensure_session(peer_id).await?;
        let rtt = self.ping_session(&session).await?;
        self.registry.record_rtt(session.peer_id(), rtt as f64);
        self.registry.reward(session.peer_id(), 1.0);
        Ok(rtt)
    }

    async fn ping_session(&self, session: &Arc<SecureSession>) -> Result<u64> {
        let started = Instant::now();
        self.request_on(session, MessageType::Ping, serde_json::json!({}), PING_TIMEOUT)
            .await?;
        Ok(started.elapsed().as_millis() as u64)
    }

    /// Verify, de-duplicate, and route one inbound envelope.
    pub async fn dispatch_inbound(&self, session: &Arc<SecureSession>, envelope: Envelope) {
        // The envelope must come from the session's authenticated
        // identity, and its signature must verify against that key
        // before the payload is touched.
        if envelope.from_id != session.peer_id() {
            warn!(
                "Envelope from {} on session authenticated as {}",
                envelope.from_id,
                session.peer_id()
            );
            self.registry
                .penalize(session.peer_id(), INTEGRITY_PENALTY);
            return;
        }
        if envelope.verify(session.peer_public_key()).is_err() {
            warn!("Envelope signature invalid from {}", envelope.from_id);
            self.registry
                .penalize(session.peer_id(), INTEGRITY_PENALTY);
            session.close().await;
            self.pool.remove(session.peer_id()).await;
            return;
        }

        if envelope.skew_secs() > SKEW_BOUND.as_secs() {
            warn!(
                "Rejecting envelope from {} with {}s clock skew",
                envelope.from_id,
                envelope.skew_secs()
            );
            return;
        }
        if !self.remember_envelope(&envelope.id) {
            debug!("Dropping duplicate envelope {}", envelope.id);
            return;
        }

        self.registry.record_seen(&envelope.from_id);

        if let Some(request_id) = envelope.in_reply_to.clone() {
            match self.pending.lock().remove(&request_id) {
                Some(tx) => {
                    let _ = tx.send(envelope);
                }
                None => debug!("Discarding late reply to {}", request_id),
            }
            return;
        }

        let (msg_type, payload) = self.handle_request(session, &envelope).await;
        let mut reply = Envelope::reply_to(&envelope, msg_type, &self.identity.id, payload);
        reply.sign(&self.signing_key);
        if let Err(e) = session.send_envelope(&reply).await {
            warn!("Failed to send reply to {}: {}", envelope.from_id, e);
        }
    }

    /// Track the envelope id inside the skew window; `false` means it was
    /// already seen.
    fn remember_envelope(&self, id: &str) -> bool {
        let mut seen = self.seen.lock();
        let cutoff = now().saturating_sub(SKEW_BOUND.as_secs());
        seen.retain(|_, ts| *ts >= cutoff);
        if seen.contains_key(id) {
            return false;
        }
        seen.insert(id.to_string(), now());
        true
    }

    /// Worker-side request handling. Everything except liveness requires
    /// the sender to be present in the local registry with a matching
    /// public key.
    async fn handle_request(
        &self,
        session: &Arc<SecureSession>,
        envelope: &Envelope,
    ) -> (MessageType, serde_json::Value) {
        if envelope.msg_type == MessageType::Ping {
            return (MessageType::Pong, serde_json::json!({}));
        }

        let presented_key = hex::encode(session.peer_public_key().as_bytes());
        if !self.registry.authorize(&envelope.from_id, &presented_key) {
            warn!("Rejecting request from unknown sender {}", envelope.from_id);
            return error_reply(&CoreError::IntegrityViolation(format!(
                "sender {} not in peer registry",
                envelope.from_id
            )));
        }

        match envelope.msg_type {
            MessageType::GetStats => {
                let miners = self.manager.list_miners().await;
                let total_hashrate = miners
                    .iter()
                    .filter_map(|m| m.stats.as_ref())
                    .filter(|s| !s.stale)
                    .map(|s| s.hashrate)
                    .sum();
                let payload = StatsPayload {
                    miners,
                    total_hashrate,
                };
                (
                    MessageType::Stats,
                    serde_json::to_value(payload).unwrap_or_default(),
                )
            }
            MessageType::StartMiner => {
                let payload: StartMinerPayload =
                    match serde_json::from_value(envelope.payload.clone()) {
                        Ok(p) => p,
                        Err(e) => {
                            return error_reply(&CoreError::InvalidArgument(e.to_string()))
                        }
                    };
                let resolved = if let Some(profile_id) = payload.profile_id {
                    self.profiles.get(&profile_id).map(|p| (p.kind, p.config))
                } else {
                    match (payload.kind, payload.config) {
                        (Some(kind), Some(config)) => Ok((kind, config)),
                        _ => Err(CoreError::InvalidArgument(
                            "either profileId or kind + config is required".to_string(),
                        )),
                    }
                };
                match resolved {
                    Ok((kind, config)) => match self.manager.start_miner(kind, config).await {
                        Ok(name) => (
                            MessageType::Ack,
                            serde_json::to_value(AckPayload {
                                miner_name: Some(name),
                                message: "started".to_string(),
                            })
                            .unwrap_or_default(),
                        ),
                        Err(e) => error_reply(&e),
                    },
                    Err(e) => error_reply(&e),
                }
            }
            MessageType::StopMiner => {
                let payload: StopMinerPayload =
                    match serde_json::from_value(envelope.payload.clone()) {
                        Ok(p) => p,
                        Err(e) => {
                            return error_reply(&CoreError::InvalidArgument(e.to_string()))
                        }
                    };
                match self.manager.stop_miner(&payload.name).await {
                    Ok(()) => (
                        MessageType::Ack,
                        serde_json::to_value(AckPayload {
                            miner_name: Some(payload.name),
                            message: "stopped".to_string(),
                        })
                        .unwrap_or_default(),
                    ),
                    Err(e) => error_reply(&e),
                }
            }
            MessageType::GetLogs => {
                let payload: GetLogsPayload =
                    match serde_json::from_value(envelope.payload.clone()) {
                        Ok(p) => p,
                        Err(e) => {
                            return error_reply(&CoreError::InvalidArgument(e.to_string()))
                        }
                    };
                match self
                    .manager
                    .get_logs(&payload.miner, payload.limit.unwrap_or(DEFAULT_LOG_LIMIT))
                    .await
                {
                    Ok(lines) => (
                        MessageType::Logs,
                        serde_json::to_value(LogsPayload { lines }).unwrap_or_default(),
                    ),
                    Err(e) => error_reply(&e),
                }
            }
            MessageType::Deploy => {
                let payload: DeployPayload =
                    match serde_json::from_value(envelope.payload.clone()) {
                        Ok(p) => p,
                        Err(e) => {
                            return error_reply(&CoreError::InvalidArgument(e.to_string()))
                        }
                    };
                // Configuration bundles only; executable transfer is not
                // accepted over the overlay.
                let mut accepted = 0;
                for profile in payload.profiles {
                    match self.profiles.upsert(profile) {
                        Ok(()) => accepted += 1,
                        Err(e) => warn!("Rejected deployed profile: {}", e),
                    }
                }
                (
                    MessageType::DeployAck,
                    serde_json::to_value(DeployAckPayload { accepted }).unwrap_or_default(),
                )
            }
            other => error_reply(&CoreError::InvalidArgument(format!(
                "unsupported request type {other:?}"
            ))),
        }
    }

    /// Per-session reader task: decrypts frames and dispatches envelopes
    /// until close, idle timeout, or an integrity violation.
    pub fn spawn_reader(router: Weak<Self>, session: Arc<SecureSession>, mut reader: FrameReader) {
        use futures::StreamExt;

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = reader.next() => frame,
                    _ = tokio::time::sleep(IDLE_TIMEOUT) => {
                        info!("Session with {} idle, closing", session.peer_id());
                        break;
                    }
                };
                let bytes = match frame {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        debug!("Read error on session with {}: {}", session.peer_id(), e);
                        break;
                    }
                    None => break,
                };
                let Some(router) = router.upgrade() else {
                    break;
                };
                match session.open_frame(&bytes) {
                    Ok(plaintext) => match serde_json::from_slice::<Envelope>(&plaintext) {
                        Ok(envelope) => router.dispatch_inbound(&session, envelope).await,
                        Err(e) => {
                            warn!("Undecodable envelope from {}: {}", session.peer_id(), e)
                        }
                    },
                    Err(e) => {
                        warn!(
                            "Integrity violation on session with {}: {}",
                            session.peer_id(),
                            e
                        );
                        router
                            .registry
                            .penalize(session.peer_id(), INTEGRITY_PENALTY);
                        break;
                    }
                }
            }
            session.close().await;
            if let Some(router) = router.upgrade() {
                router.pool.remove(session.peer_id()).await;
            }
        });
    }

    /// Accept loop for inbound peer sessions.
    pub async fn spawn_listener(
        router: Arc<Self>,
        addr: &str,
    ) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Overlay listening on {}", local_addr);

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let router = Arc::clone(&router);
                        tokio::spawn(async move {
                            let registry = Arc::clone(&router.registry);
                            let result = transport::accept(
                                stream,
                                &router.identity,
                                &router.signing_key,
                                move |node_id| {
                                    registry.get(node_id).ok().and_then(|p| p.public_key)
                                },
                            )
                            .await;
                            match result {
                                Ok((session, reader, _)) => {
                                    info!(
                                        "Accepted session from {} ({})",
                                        session.peer_name(),
                                        session.peer_id()
                                    );
                                    router.pool.insert(Arc::clone(&session)).await;
                                    Self::spawn_reader(
                                        Arc::downgrade(&router),
                                        session,
                                        reader,
                                    );
                                }
                                Err(e) => warn!("Handshake with {} failed: {}", remote, e),
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        Ok((local_addr, handle))
    }

    /// Ping every open session at a fixed cadence; a failed keepalive
    /// closes the session.
    pub fn spawn_keepalive(router: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(KEEPALIVE_PERIOD);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                for session in router.pool.all().await {
                    let router = Arc::clone(&router);
                    tokio::spawn(async move {
                        let peer_id = session.peer_id().to_string();
                        if let Err(e) = router.ping_session(&session).await {
                            warn!("Keepalive to {} failed: {}", peer_id, e);
                            session.close().await;
                            router.pool.remove(&peer_id).await;
                        }
                    });
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_codes_map_back_to_core_errors() {
        let e = core_error_from(ErrorKind::NotFound, "miner xmrig-001".to_string());
        assert!(matches!(e, CoreError::NotFound(_)));
        let e = core_error_from(ErrorKind::ResourceBusy, "busy".to_string());
        assert!(matches!(e, CoreError::ResourceBusy(_)));
        let e = core_error_from(ErrorKind::Cancelled, String::new());
        assert!(matches!(e, CoreError::Cancelled));
    }

    #[test]
    fn error_reply_carries_kind() {
        let (msg_type, payload) = error_reply(&CoreError::Timeout("slow".to_string()));
        assert_eq!(msg_type, MessageType::Error);
        let payload: ErrorPayload = serde_json::from_value(payload).unwrap();
        assert_eq!(payload.code, ErrorKind::Timeout);
        assert!(payload.error.contains("slow"));
    }
}
