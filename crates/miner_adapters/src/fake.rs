//! Fake miner adapter for testing without real binaries.
//! Produces deterministic logs and stats for CI/integration tests.

use crate::descriptor::{MinerDescriptor, XMRIG_DESCRIPTOR};
use crate::{
    AdapterError, InstallStatus, LogSink, MinerAdapter, MinerConfig, MinerHandle, MinerKind,
    MinerState, PerformanceSample, Result,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::info;

pub struct FakeAdapter {
    kind: MinerKind,
    base_hashrate: f64,
    state: Mutex<MinerState>,
    stop_signal: Mutex<Option<mpsc::Sender<()>>>,
    stats: Arc<FakeStats>,
    launched: Mutex<Option<MinerConfig>>,
}

struct FakeStats {
    running: AtomicBool,
    accepted: AtomicU64,
    rejected: AtomicU64,
    uptime: AtomicU64,
}

impl FakeAdapter {
    pub fn new(kind: MinerKind) -> Self {
        Self {
            kind,
            base_hashrate: 1234.0,
            state: Mutex::new(MinerState::Stopped),
            stop_signal: Mutex::new(None),
            stats: Arc::new(FakeStats {
                running: AtomicBool::new(false),
                accepted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                uptime: AtomicU64::new(0),
            }),
            launched: Mutex::new(None),
        }
    }

    pub fn with_hashrate(kind: MinerKind, hashrate: f64) -> Self {
        let mut adapter = Self::new(kind);
        adapter.base_hashrate = hashrate;
        adapter
    }
}

#[async_trait::async_trait]
impl MinerAdapter for FakeAdapter {
    fn kind(&self) -> MinerKind {
        self.kind
    }

    fn descriptor(&self) -> &'static MinerDescriptor {
        &XMRIG_DESCRIPTOR
    }

    fn state(&self) -> MinerState {
        *self.state.lock()
    }

    async fn check_installation(&self) -> Result<InstallStatus> {
        Ok(InstallStatus {
            installed: true,
            version: Some("0.0.0-fake".to_string()),
            path: Some(PathBuf::from("/dev/null")),
        })
    }

    async fn install(&self) -> Result<()> {
        Ok(())
    }

    async fn uninstall(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self, config: &MinerConfig, logs: LogSink) -> Result<MinerHandle> {
        {
            let state = *self.state.lock();
            if state == MinerState::Running || state == MinerState::Starting {
                return Err(AdapterError::AlreadyRunning);
            }
        }
        info!("FakeAdapter starting with pool: {}", config.pool);

        let (tx, mut rx) = mpsc::channel::<()>(1);
        *self.stop_signal.lock() = Some(tx);
        *self.launched.lock() = Some(config.clone());

        let stats = self.stats.clone();
        stats.running.store(true, Ordering::SeqCst);
        stats.accepted.store(0, Ordering::SeqCst);
        stats.rejected.store(0, Ordering::SeqCst);
        stats.uptime.store(0, Ordering::SeqCst);

        tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(100));
            let mut ticks = 0u64;

            let _ = logs.send("[INFO] fake miner 0.0.0 starting".to_string());
            let _ = logs.send("[INFO] Connecting to pool...".to_string());

            loop {
                tokio::select! {
                    _ = rx.recv() => {
                        let _ = logs.send("[INFO] Stopping...".to_string());
                        stats.running.store(false, Ordering::SeqCst);
                        break;
                    }
                    _ = tick.tick() => {
                        ticks += 1;
                        stats.uptime.store(ticks / 10, Ordering::SeqCst);
                        if ticks % 10 == 0 {
                            let accepted = stats.accepted.fetch_add(1, Ordering::SeqCst) + 1;
                            let _ = logs.send(format!("[INFO] accepted ({accepted}/0)"));
                        }
                    }
                }
            }
        });

        *self.state.lock() = MinerState::Running;
        Ok(MinerHandle {
            child: None,
            stdin: None,
        })
    }

    async fn stop(&self, _handle: &mut MinerHandle) {
        let sender = self.stop_signal.lock().take();
        if let Some(tx) = sender {
            let _ = tx.send(()).await;
        }
        *self.state.lock() = MinerState::Stopped;
    }

    async fn fetch_stats(&self) -> Result<Option<PerformanceSample>> {
        if *self.state.lock() != MinerState::Running {
            return Ok(None);
        }
        let launched = self.launched.lock();
        Ok(Some(PerformanceSample {
            timestamp: PerformanceSample::now(),
            hashrate: self.base_hashrate,
            accepted_shares: self.stats.accepted.load(Ordering::SeqCst),
            rejected_shares: self.stats.rejected.load(Ordering::SeqCst),
            uptime_secs: self.stats.uptime.load(Ordering::SeqCst),
            algorithm: launched.as_ref().and_then(|c| c.algorithm.clone()),
            pool: launched.as_ref().map(|c| c.pool.clone()),
            difficulty: 1.0,
            stale: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MinerConfig {
        MinerConfig {
            kind: MinerKind::Xmrig,
            pool: "fake-pool.example:3333".to_string(),
            worker: "w".to_string(),
            password: "x".to_string(),
            tls: false,
            threads: 1,
            extra_args: String::new(),
            algorithm: None,
            devices: Vec::new(),
        }
    }

    #[tokio::test]
    async fn fake_lifecycle_and_stats() {
        let adapter = FakeAdapter::with_hashrate(MinerKind::Xmrig, 999.0);
        assert_eq!(adapter.state(), MinerState::Stopped);
        assert!(adapter.fetch_stats().await.unwrap().is_none());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = adapter.start(&config(), tx).await.unwrap();
        assert_eq!(adapter.state(), MinerState::Running);

        let sample = adapter.fetch_stats().await.unwrap().unwrap();
        assert_eq!(sample.hashrate, 999.0);
        assert_eq!(sample.pool.as_deref(), Some("fake-pool.example:3333"));

        // Startup lines arrive on the sink.
        let line = rx.recv().await.unwrap();
        assert!(line.contains("fake miner"));

        adapter.stop(&mut handle).await;
        assert_eq!(adapter.state(), MinerState::Stopped);
    }

    #[tokio::test]
    async fn double_start_rejected() {
        let adapter = FakeAdapter::new(MinerKind::Xmrig);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut handle = adapter.start(&config(), tx.clone()).await.unwrap();
        assert!(matches!(
            adapter.start(&config(), tx).await,
            Err(AdapterError::AlreadyRunning)
        ));
        adapter.stop(&mut handle).await;
    }
}
