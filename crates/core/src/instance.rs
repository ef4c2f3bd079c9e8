//! Live miner instance state owned by the manager.

use crate::HashratePoint;
use minefleet_miner_adapters::{MinerAdapter, MinerConfig, MinerHandle, MinerKind, PerformanceSample};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// Bounded log ring; oldest lines are evicted first.
pub const LOG_BUFFER_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Exited,
}

pub struct LogBuffer {
    entries: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(line);
    }

    /// The most recent `limit` lines, in production order.
    pub fn recent(&self, limit: usize) -> Vec<String> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) struct MinerInstance {
    pub name: String,
    pub kind: MinerKind,
    pub config: MinerConfig,
    pub config_hash: String,
    pub state: InstanceState,
    pub adapter: Arc<dyn MinerAdapter + 'static>,
    pub handle: MinerHandle,
    pub logs: LogBuffer,
    pub last_sample: Option<PerformanceSample>,
    pub ring: VecDeque<HashratePoint>,
    pub ring_capacity: usize,
    pub consecutive_failures: u32,
    pub created_at: u64,
    pub started_mono: Instant,
    /// Last minute index forwarded to the low-resolution store.
    pub last_history_minute: u64,
    pub exited_at: Option<Instant>,
}

impl MinerInstance {
    /// Append to the high-resolution ring, preserving strictly increasing
    /// timestamps and the capacity bound.
    pub fn push_ring(&mut self, point: HashratePoint) {
        if let Some(last) = self.ring.back() {
            if point.timestamp <= last.timestamp {
                return;
            }
        }
        if self.ring.len() >= self.ring_capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(point);
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, InstanceState::Starting | InstanceState::Running)
    }
}

/// Wire-facing snapshot of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinerSummary {
    pub name: String,
    pub kind: MinerKind,
    pub state: InstanceState,
    pub running: bool,
    pub stats: Option<PerformanceSample>,
    pub created_at: u64,
}

impl MinerInstance {
    pub fn summary(&self) -> MinerSummary {
        MinerSummary {
            name: self.name.clone(),
            kind: self.kind,
            state: self.state,
            running: self.state == InstanceState::Running,
            stats: self.last_sample.clone(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minefleet_miner_adapters::FakeAdapter;
    use std::collections::VecDeque;

    fn test_instance(ring_capacity: usize) -> MinerInstance {
        MinerInstance {
            name: "xmrig-001".to_string(),
            kind: MinerKind::Xmrig,
            config: MinerConfig {
                kind: MinerKind::Xmrig,
                pool: "pool.example:3333".to_string(),
                worker: "w1".to_string(),
                password: "x".to_string(),
                tls: false,
                threads: 1,
                extra_args: String::new(),
                algorithm: None,
                devices: Vec::new(),
            },
            config_hash: String::new(),
            state: InstanceState::Starting,
            adapter: Arc::new(FakeAdapter::new(MinerKind::Xmrig)),
            handle: MinerHandle {
                child: None,
                stdin: None,
            },
            logs: LogBuffer::new(10),
            last_sample: None,
            ring: VecDeque::new(),
            ring_capacity,
            consecutive_failures: 0,
            created_at: 0,
            started_mono: Instant::now(),
            last_history_minute: 0,
            exited_at: None,
        }
    }

    #[test]
    fn ring_is_bounded_and_strictly_increasing() {
        let mut instance = test_instance(5);
        for ts in [1u64, 2, 2, 3, 4, 4, 5, 6, 7, 8] {
            instance.push_ring(HashratePoint {
                miner: "xmrig-001".to_string(),
                timestamp: ts,
                hashrate: ts as f64,
            });
        }
        assert!(instance.ring.len() <= 5);
        assert!(instance
            .ring
            .iter()
            .zip(instance.ring.iter().skip(1))
            .all(|(a, b)| a.timestamp < b.timestamp));
        // Oldest entries were evicted first.
        assert_eq!(instance.ring.back().map(|p| p.timestamp), Some(8));
    }

    #[test]
    fn log_buffer_evicts_oldest() {
        let mut buffer = LogBuffer::new(5);
        for i in 0..8 {
            buffer.push(format!("line {i}"));
        }
        assert_eq!(buffer.len(), 5);
        let recent = buffer.recent(10);
        assert_eq!(recent.first().unwrap(), "line 3");
        assert_eq!(recent.last().unwrap(), "line 7");
    }

    #[test]
    fn recent_respects_limit_and_order() {
        let mut buffer = LogBuffer::new(10);
        for i in 0..6 {
            buffer.push(format!("line {i}"));
        }
        let recent = buffer.recent(3);
        assert_eq!(recent, vec!["line 3", "line 4", "line 5"]);
    }
}
