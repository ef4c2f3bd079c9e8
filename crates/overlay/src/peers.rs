//! Peer registry: the set of known peers plus metric-weighted ranking.
//!
//! JSON-backed; every mutating operation atomically rewrites the file.

use crate::{OverlayError, Result};
use minefleet_core::{atomic_write_json, node_id_from_public_key, NodeRole, RankingWeights};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMetrics {
    pub rtt_ms: f64,
    pub hop_count: u32,
    pub geo_distance_km: f64,
    /// 0–100; new peers start fully trusted.
    pub reliability: f64,
}

impl PeerMetrics {
    fn new() -> Self {
        Self {
            rtt_ms: 0.0,
            hop_count: 0,
            geo_distance_km: 0.0,
            reliability: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: String,
    pub name: String,
    /// Hex ed25519 key; absent until pinned at first handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub address: String,
    pub role: NodeRole,
    pub added_at: u64,
    #[serde(default)]
    pub last_seen: u64,
    #[serde(default)]
    pub metrics: PeerMetrics,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Provisional id for a peer added without a public key; replaced by the
/// key-derived node id once the first handshake pins the key.
fn provisional_id(address: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"addr:");
    hasher.update(address.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Pluggable ranking: lower score wins.
pub trait PeerRanker: Send + Sync {
    fn score(&self, peer: &Peer, ctx: &RankContext) -> f64;
}

/// Normalization bounds computed over the candidate set.
#[derive(Debug, Clone, Default)]
pub struct RankContext {
    pub max_rtt_ms: f64,
    pub max_hops: f64,
    pub max_geo_km: f64,
}

impl RankContext {
    fn over(peers: &[Peer]) -> Self {
        let mut ctx = Self::default();
        for peer in peers {
            ctx.max_rtt_ms = ctx.max_rtt_ms.max(peer.metrics.rtt_ms);
            ctx.max_hops = ctx.max_hops.max(peer.metrics.hop_count as f64);
            ctx.max_geo_km = ctx.max_geo_km.max(peer.metrics.geo_distance_km);
        }
        ctx
    }
}

pub struct WeightedRanker {
    weights: RankingWeights,
}

impl WeightedRanker {
    pub fn new(weights: RankingWeights) -> Self {
        Self { weights }
    }
}

impl Default for WeightedRanker {
    fn default() -> Self {
        Self::new(RankingWeights::default())
    }
}

fn norm(value: f64, max: f64) -> f64 {
    if max <= 0.0 {
        0.0
    } else {
        value / max
    }
}

impl PeerRanker for WeightedRanker {
    fn score(&self, peer: &Peer, ctx: &RankContext) -> f64 {
        self.weights.rtt * norm(peer.metrics.rtt_ms, ctx.max_rtt_ms)
            + self.weights.hops * norm(peer.metrics.hop_count as f64, ctx.max_hops)
            + self.weights.geo * norm(peer.metrics.geo_distance_km, ctx.max_geo_km)
            - self.weights.reliability * (peer.metrics.reliability / 100.0)
    }
}

pub struct PeerRegistry {
    path: PathBuf,
    peers: RwLock<Vec<Peer>>,
    ranker: Box<dyn PeerRanker>,
}

impl PeerRegistry {
    pub fn load(path: PathBuf, ranker: Box<dyn PeerRanker>) -> Self {
        let peers: Vec<Peer> = if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                    warn!("Failed to parse {:?}: {}", path, e);
                    Vec::new()
                }),
                Err(e) => {
                    warn!("Failed to read {:?}: {}", path, e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        Self {
            path,
            peers: RwLock::new(peers),
            ranker,
        }
    }

    fn persist(&self, peers: &[Peer]) -> Result<()> {
        atomic_write_json(&self.path, &peers)
            .map_err(|e| OverlayError::Internal(format!("persisting peers: {e}")))
    }

    pub fn add(
        &self,
        name: &str,
        address: &str,
        public_key: Option<&str>,
        role: NodeRole,
    ) -> Result<Peer> {
        let id = match public_key {
            Some(key_hex) => {
                let bytes = hex::decode(key_hex)
                    .map_err(|_| OverlayError::Internal("bad public key encoding".to_string()))?;
                node_id_from_public_key(&bytes)
            }
            None => provisional_id(address),
        };

        let peer = Peer {
            id: id.clone(),
            name: name.to_string(),
            public_key: public_key.map(str::to_string),
            address: address.to_string(),
            role,
            added_at: now(),
            last_seen: 0,
            metrics: PeerMetrics::new(),
        };

        let mut peers = self.peers.write();
        if peers.iter().any(|p| p.id == id) {
            return Err(OverlayError::AlreadyExists(format!("peer {id}")));
        }
        peers.push(peer.clone());
        self.persist(&peers)?;
        info!("Added peer {} ({}) at {}", peer.name, peer.id, peer.address);
        Ok(peer)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|p| p.id != id);
        if peers.len() == before {
            return Err(OverlayError::NotFound(format!("peer {id}")));
        }
        self.persist(&peers)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Peer> {
        self.peers
            .read()
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| OverlayError::NotFound(format!("peer {id}")))
    }

    pub fn get_by_public_key(&self, public_key_hex: &str) -> Option<Peer> {
        self.peers
            .read()
            .iter()
            .find(|p| p.public_key.as_deref() == Some(public_key_hex))
            .cloned()
    }

    pub fn list(&self) -> Vec<Peer> {
        self.peers.read().clone()
    }

    pub fn update_metrics(&self, id: &str, rtt_ms: f64, hops: u32, geo_km: f64) -> Result<Peer> {
        let mut peers = self.peers.write();
        let peer = peers
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| OverlayError::NotFound(format!("peer {id}")))?;
        peer.metrics.rtt_ms = rtt_ms;
        peer.metrics.hop_count = hops;
        peer.metrics.geo_distance_km = geo_km;
        let updated = peer.clone();
        self.persist(&peers)?;
        Ok(updated)
    }

    /// Record a measured round-trip time without touching the other
    /// metric fields.
    pub fn record_rtt(&self, id: &str, rtt_ms: f64) {
        let mut peers = self.peers.write();
        if let Some(peer) = peers.iter_mut().find(|p| p.id == id) {
            peer.metrics.rtt_ms = rtt_ms;
            peer.last_seen = now();
            let _ = self.persist(&peers);
        }
    }

    pub fn record_seen(&self, id: &str) {
        let mut peers = self.peers.write();
        if let Some(peer) = peers.iter_mut().find(|p| p.id == id) {
            peer.last_seen = now();
            let _ = self.persist(&peers);
        }
    }

    /// Decrease reliability after an integrity violation or repeated
    /// failure; clamped to [0, 100].
    pub fn penalize(&self, id: &str, amount: f64) {
        let mut peers = self.peers.write();
        if let Some(peer) = peers.iter_mut().find(|p| p.id == id) {
            peer.metrics.reliability = (peer.metrics.reliability - amount).max(0.0);
            warn!(
                "Peer {} reliability now {:.1}",
                id, peer.metrics.reliability
            );
            let _ = self.persist(&peers);
        }
    }

    pub fn reward(&self, id: &str, amount: f64) {
        let mut peers = self.peers.write();
        if let Some(peer) = peers.iter_mut().find(|p| p.id == id) {
            peer.metrics.reliability = (peer.metrics.reliability + amount).min(100.0);
            let _ = self.persist(&peers);
        }
    }

    /// Attach the key learned at first handshake to a provisional record,
    /// migrating its id to the key-derived node id.
    pub fn pin_identity(&self, current_id: &str, public_key_hex: &str) -> Result<Peer> {
        let bytes = hex::decode(public_key_hex)
            .map_err(|_| OverlayError::Internal("bad public key encoding".to_string()))?;
        let node_id = node_id_from_public_key(&bytes);

        let mut peers = self.peers.write();
        let peer = peers
            .iter_mut()
            .find(|p| p.id == current_id)
            .ok_or_else(|| OverlayError::NotFound(format!("peer {current_id}")))?;

        match &peer.public_key {
            Some(existing) if existing != public_key_hex => {
                return Err(OverlayError::IdentityMismatch);
            }
            _ => {}
        }
        peer.public_key = Some(public_key_hex.to_string());
        peer.id = node_id;
        let updated = peer.clone();
        self.persist(&peers)?;
        Ok(updated)
    }

    /// Worker-side authorization: the presenting identity must exist in
    /// the registry with a matching key (or match a provisional record
    /// that has no key pinned yet).
    pub fn authorize(&self, node_id: &str, public_key_hex: &str) -> bool {
        let pinned = {
            let peers = self.peers.read();
            if peers
                .iter()
                .any(|p| p.public_key.as_deref() == Some(public_key_hex))
            {
                return true;
            }
            peers
                .iter()
                .any(|p| p.id == node_id && p.public_key.is_none())
        };
        if pinned {
            // First contact from a provisional record: pin the key.
            return self.pin_identity(node_id, public_key_hex).is_ok();
        }
        false
    }

    fn ranked(&self) -> Vec<(f64, Peer)> {
        let peers = self.list();
        let ctx = RankContext::over(&peers);
        let mut scored: Vec<(f64, Peer)> = peers
            .into_iter()
            .map(|p| (self.ranker.score(&p, &ctx), p))
            .collect();
        // Lower score first; ties broken by reliability then id for
        // deterministic selection.
        scored.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.1.metrics
                        .reliability
                        .partial_cmp(&a.1.metrics.reliability)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        scored
    }

    pub fn select_optimal(&self) -> Option<Peer> {
        self.ranked().into_iter().map(|(_, p)| p).next()
    }

    pub fn select_nearest(&self, k: usize) -> Vec<Peer> {
        self.ranked().into_iter().map(|(_, p)| p).take(k).collect()
    }
}
