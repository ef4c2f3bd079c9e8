//! Durable low-resolution hashrate history.
//!
//! An embedded ordered store keyed by `(miner_name, timestamp)` at
//! 1-minute resolution. Writes funnel through a dedicated writer task;
//! reads run concurrently against sled's snapshot iterators.

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SECS_PER_MINUTE: u64 = 60;

/// One `(miner, timestamp, hashrate)` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashratePoint {
    pub miner: String,
    pub timestamp: u64,
    pub hashrate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySummary {
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub latest: f64,
}

pub struct HistoryStore {
    db: sled::Db,
    retention_days: u32,
}

fn encode_key(miner: &str, timestamp: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(miner.len() + 9);
    key.extend_from_slice(miner.as_bytes());
    key.push(0);
    key.extend_from_slice(&timestamp.to_be_bytes());
    key
}

fn decode_key(key: &[u8]) -> Option<(String, u64)> {
    if key.len() < 9 {
        return None;
    }
    let (name, ts) = key.split_at(key.len() - 9);
    let miner = String::from_utf8(name.to_vec()).ok()?;
    let ts_bytes: [u8; 8] = ts[1..].try_into().ok()?;
    Some((miner, u64::from_be_bytes(ts_bytes)))
}

fn floor_to_minute(timestamp: u64) -> u64 {
    timestamp - timestamp % SECS_PER_MINUTE
}

impl HistoryStore {
    pub fn open(path: &Path, retention_days: u32) -> Result<Self> {
        let db = sled::open(path).map_err(|e| CoreError::Internal(format!("sled: {e}")))?;
        Ok(Self { db, retention_days })
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// At most one row per `(miner, minute)`; later writes in the same
    /// minute overwrite.
    pub fn insert(&self, miner: &str, timestamp: u64, hashrate: f64) -> Result<()> {
        let key = encode_key(miner, floor_to_minute(timestamp));
        self.db
            .insert(key, hashrate.to_bits().to_be_bytes().to_vec())
            .map_err(|e| CoreError::Internal(format!("sled insert: {e}")))?;
        Ok(())
    }

    /// Ascending range; an inverted range is empty, not an error.
    pub fn range_by_miner(&self, miner: &str, since: u64, until: u64) -> Result<Vec<HashratePoint>> {
        if since > until {
            return Ok(Vec::new());
        }
        let start = encode_key(miner, floor_to_minute(since));
        let end = encode_key(miner, until);

        let mut points = Vec::new();
        for row in self.db.range(start..=end) {
            let (key, value) =
                row.map_err(|e| CoreError::Internal(format!("sled range: {e}")))?;
            let Some((name, timestamp)) = decode_key(&key) else {
                continue;
            };
            if name != miner {
                continue;
            }
            let bits: [u8; 8] = value
                .as_ref()
                .try_into()
                .map_err(|_| CoreError::Internal("malformed history value".to_string()))?;
            points.push(HashratePoint {
                miner: name,
                timestamp,
                hashrate: f64::from_bits(u64::from_be_bytes(bits)),
            });
        }
        Ok(points)
    }

    pub fn summary(&self, miner: &str, since: u64) -> Result<HistorySummary> {
        let points = self.range_by_miner(miner, since, u64::MAX - SECS_PER_MINUTE)?;
        if points.is_empty() {
            return Ok(HistorySummary::default());
        }
        let count = points.len() as u64;
        let sum: f64 = points.iter().map(|p| p.hashrate).sum();
        let min = points.iter().map(|p| p.hashrate).fold(f64::MAX, f64::min);
        let max = points.iter().map(|p| p.hashrate).fold(f64::MIN, f64::max);
        let latest = points.last().map(|p| p.hashrate).unwrap_or(0.0);
        Ok(HistorySummary {
            count,
            avg: sum / count as f64,
            min,
            max,
            latest,
        })
    }

    /// Distinct miner names present in the store.
    pub fn miner_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for row in self.db.iter() {
            let (key, _) = row.map_err(|e| CoreError::Internal(format!("sled iter: {e}")))?;
            if let Some((name, _)) = decode_key(&key) {
                if names.last().map(|n| *n != name).unwrap_or(true) {
                    names.push(name);
                }
            }
        }
        names.dedup();
        Ok(names)
    }

    /// Delete rows older than the threshold. Idempotent.
    pub fn purge(&self, older_than: u64) -> Result<usize> {
        let mut removed = 0;
        for row in self.db.iter() {
            let (key, _) = row.map_err(|e| CoreError::Internal(format!("sled iter: {e}")))?;
            if let Some((_, timestamp)) = decode_key(&key) {
                if timestamp < older_than {
                    self.db
                        .remove(&key)
                        .map_err(|e| CoreError::Internal(format!("sled remove: {e}")))?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!("Purged {} history rows older than {}", removed, older_than);
        }
        Ok(removed)
    }

    /// Purge based on the configured retention window.
    pub fn purge_expired(&self) -> Result<usize> {
        let retention_secs = self.retention_days as u64 * 24 * 3600;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.purge(now.saturating_sub(retention_secs))
    }

    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| CoreError::Internal(format!("sled flush: {e}")))
    }

    /// Single writer consuming the non-blocking channel the stats poller
    /// publishes to. The task drains and flushes on channel close.
    pub fn spawn_writer(self: Arc<Self>) -> (HistoryWriter, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<HashratePoint>(256);
        let store = self;
        let handle = tokio::spawn(async move {
            let mut since_flush = 0u32;
            while let Some(point) = rx.recv().await {
                if let Err(e) = store.insert(&point.miner, point.timestamp, point.hashrate) {
                    warn!("History insert failed for {}: {}", point.miner, e);
                    continue;
                }
                since_flush += 1;
                if since_flush >= 32 {
                    let _ = store.flush();
                    since_flush = 0;
                }
            }
            let _ = store.flush();
            debug!("History writer drained");
        });
        (HistoryWriter { tx }, handle)
    }

    /// Retention purge at startup and every 24 hours thereafter.
    pub fn spawn_purge_task(self: Arc<Self>) -> JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(24 * 3600));
            loop {
                tick.tick().await;
                if let Err(e) = store.purge_expired() {
                    warn!("History purge failed: {}", e);
                }
            }
        })
    }
}

/// Cloneable producer half of the history writer queue.
#[derive(Clone)]
pub struct HistoryWriter {
    tx: mpsc::Sender<HashratePoint>,
}

impl HistoryWriter {
    /// Non-blocking: a full queue drops the point with a warning rather
    /// than stalling the stats poller.
    pub fn record(&self, point: HashratePoint) {
        if let Err(e) = self.tx.try_send(point) {
            warn!("History queue full, dropping point: {}", e);
        }
    }
}
