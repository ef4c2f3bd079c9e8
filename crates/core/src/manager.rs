//! Miner manager: registry of live instances, lifecycle control, log
//! capture, the stats poller, and autostart.

use crate::{
    CoreError, EventBus, HashratePoint, HistoryWriter, InstanceState, LogBuffer, MinerEvent,
    MinerInstance, MinerSummary, Result, Settings, LOG_BUFFER_SIZE,
};
use futures::StreamExt;
use minefleet_miner_adapters::{
    create_adapter, MinerAdapter, MinerConfig, MinerDescriptor, MinerHandle, MinerKind,
    PerformanceSample,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The ring must retain at least five minutes at the poll period.
const RING_RETENTION_SECS: u64 = 300;
const MIN_RING_CAPACITY: usize = 30;

/// How many consecutive failed fetches mark the last sample stale.
const STALE_FAILURE_THRESHOLD: u32 = 3;

pub type AdapterFactory = Arc<dyn Fn(MinerKind) -> Box<dyn MinerAdapter + 'static> + Send + Sync>;

async fn fetch_one_stat(
    name: String,
    adapter: Arc<dyn MinerAdapter + 'static>,
    stats_timeout: Duration,
) -> (String, Result<Option<PerformanceSample>>) {
    let result = match tokio::time::timeout(stats_timeout, adapter.fetch_stats()).await {
        Ok(Ok(sample)) => Ok(sample),
        Ok(Err(e)) => Err(CoreError::from(e)),
        Err(_) => Err(CoreError::Timeout("stats fetch".to_string())),
    };
    (name, result)
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Stats poller tick period.
    pub poll_period: Duration,
    /// Per-adapter deadline within one tick.
    pub stats_timeout: Duration,
    /// Fallback delay after which a Starting instance is considered
    /// Running even without a successful stats read.
    pub readiness_grace: Duration,
    /// How long an Exited instance stays visible before reaping.
    pub exited_retention: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_secs(10),
            stats_timeout: Duration::from_secs(3),
            readiness_grace: Duration::from_secs(10),
            exited_retention: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableMiner {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledMinerInfo {
    pub kind: MinerKind,
    pub installed: bool,
    pub version: Option<String>,
    pub path: Option<PathBuf>,
}

pub struct MinerManager {
    instances: Arc<RwLock<HashMap<String, MinerInstance>>>,
    counters: Mutex<HashMap<MinerKind, u64>>,
    factory: AdapterFactory,
    events: EventBus,
    history: Mutex<Option<HistoryWriter>>,
    config: ManagerConfig,
    ring_capacity: usize,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl MinerManager {
    pub fn new(
        factory: AdapterFactory,
        history: Option<HistoryWriter>,
        config: ManagerConfig,
    ) -> Self {
        let ring_capacity = (RING_RETENTION_SECS / config.poll_period.as_secs().max(1))
            .max(MIN_RING_CAPACITY as u64) as usize;
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
            counters: Mutex::new(HashMap::new()),
            factory,
            events: EventBus::default(),
            history: Mutex::new(history),
            config,
            ring_capacity,
            poller: Mutex::new(None),
        }
    }

    pub fn with_defaults(history: Option<HistoryWriter>) -> Self {
        Self::new(
            Arc::new(|kind| create_adapter(kind)),
            history,
            ManagerConfig::default(),
        )
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn alloc_name(&self, kind: MinerKind) -> String {
        let mut counters = self.counters.lock();
        let counter = counters.entry(kind).or_insert(0);
        *counter += 1;
        format!("{}-{:03}", kind, counter)
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Start a new instance of `kind`. The configuration snapshot is
    /// immutable for the instance's life.
    pub async fn start_miner(&self, kind: MinerKind, config: MinerConfig) -> Result<String> {
        if config.kind != kind {
            return Err(CoreError::InvalidArgument(format!(
                "configuration kind {} does not match {}",
                config.kind, kind
            )));
        }

        let config_hash = config.config_hash();
        {
            let instances = self.instances.read().await;
            if instances
                .values()
                .any(|i| i.config_hash == config_hash && i.state != InstanceState::Exited)
            {
                return Err(CoreError::ResourceBusy(
                    "an instance with an equivalent configuration is already running".to_string(),
                ));
            }
        }

        let adapter: Arc<dyn MinerAdapter + 'static> = Arc::from((self.factory)(kind));
        let status = adapter.check_installation().await?;
        if !status.installed {
            return Err(CoreError::PreconditionFailed(format!(
                "miner {kind} is not installed"
            )));
        }

        let (log_tx, mut log_rx) = mpsc::unbounded_channel();
        let handle = adapter.start(&config, log_tx).await?;

        let name = self.alloc_name(kind);
        let mut instance = MinerInstance {
            name: name.clone(),
            kind,
            config,
            config_hash: config_hash.clone(),
            state: InstanceState::Starting,
            adapter: Arc::clone(&adapter),
            handle,
            logs: LogBuffer::new(LOG_BUFFER_SIZE),
            last_sample: None,
            ring: std::collections::VecDeque::with_capacity(self.ring_capacity),
            ring_capacity: self.ring_capacity,
            consecutive_failures: 0,
            created_at: Self::now(),
            started_mono: Instant::now(),
            last_history_minute: 0,
            exited_at: None,
        };

        {
            let mut map = self.instances.write().await;
            // Re-check: a racing start may have registered the same
            // configuration while this one was spawning.
            if map
                .values()
                .any(|i| i.config_hash == config_hash && i.state != InstanceState::Exited)
            {
                drop(map);
                let mut handle =
                    std::mem::replace(&mut instance.handle, MinerHandle { child: None, stdin: None });
                adapter.stop(&mut handle).await;
                return Err(CoreError::ResourceBusy(
                    "an instance with an equivalent configuration is already running".to_string(),
                ));
            }
            map.insert(name.clone(), instance);
        }

        // Drain captured output into the instance's log ring. Lines
        // produced before this point sit in the channel, so none are
        // lost to the registration window.
        let instances = Arc::clone(&self.instances);
        let drain_name = name.clone();
        tokio::spawn(async move {
            while let Some(line) = log_rx.recv().await {
                let mut map = instances.write().await;
                if let Some(instance) = map.get_mut(&drain_name) {
                    instance.logs.push(line);
                }
            }
        });

        self.events.emit(MinerEvent::Created {
            name: name.clone(),
            kind: kind.to_string(),
        });
        info!("Started miner {}", name);
        Ok(name)
    }

    /// Stop and reap an instance. Returns only once it has exited; a
    /// second stop of an already-exited instance is idempotent.
    pub async fn stop_miner(&self, name: &str) -> Result<()> {
        let (adapter, mut handle) = {
            let mut map = self.instances.write().await;
            let instance = map
                .get_mut(name)
                .ok_or_else(|| CoreError::NotFound(format!("miner {name}")))?;
            if instance.state == InstanceState::Exited {
                map.remove(name);
                self.events.emit(MinerEvent::Stopped {
                    name: name.to_string(),
                });
                return Ok(());
            }
            instance.state = InstanceState::Stopping;
            let adapter = Arc::clone(&instance.adapter);
            let handle =
                std::mem::replace(&mut instance.handle, MinerHandle { child: None, stdin: None });
            (adapter, handle)
        };

        adapter.stop(&mut handle).await;

        self.instances.write().await.remove(name);
        self.events.emit(MinerEvent::Stopped {
            name: name.to_string(),
        });
        info!("Stopped miner {}", name);
        Ok(())
    }

    pub async fn get_miner(&self, name: &str) -> Result<MinerSummary> {
        self.instances
            .read()
            .await
            .get(name)
            .map(|i| i.summary())
            .ok_or_else(|| CoreError::NotFound(format!("miner {name}")))
    }

    pub async fn list_miners(&self) -> Vec<MinerSummary> {
        let mut summaries: Vec<MinerSummary> = self
            .instances
            .read()
            .await
            .values()
            .map(|i| i.summary())
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub async fn get_logs(&self, name: &str, limit: usize) -> Result<Vec<String>> {
        self.instances
            .read()
            .await
            .get(name)
            .map(|i| i.logs.recent(limit))
            .ok_or_else(|| CoreError::NotFound(format!("miner {name}")))
    }

    pub async fn get_stats(&self, name: &str) -> Result<PerformanceSample> {
        self.instances
            .read()
            .await
            .get(name)
            .map(|i| i.last_sample.clone().unwrap_or_default())
            .ok_or_else(|| CoreError::NotFound(format!("miner {name}")))
    }

    pub async fn get_hashrate_history(&self, name: &str) -> Result<Vec<HashratePoint>> {
        self.instances
            .read()
            .await
            .get(name)
            .map(|i| i.ring.iter().cloned().collect())
            .ok_or_else(|| CoreError::NotFound(format!("miner {name}")))
    }

    /// Forward raw bytes to the child's stdin.
    pub async fn write_stdin(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut stdin = {
            let mut map = self.instances.write().await;
            let instance = map
                .get_mut(name)
                .ok_or_else(|| CoreError::NotFound(format!("miner {name}")))?;
            instance.handle.stdin.take().ok_or_else(|| {
                CoreError::PreconditionFailed(format!("miner {name} has no stdin writer"))
            })?
        };

        let result = async {
            stdin.write_all(bytes).await?;
            stdin.flush().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;

        // Return the writer unless the instance vanished meanwhile.
        let mut map = self.instances.write().await;
        if let Some(instance) = map.get_mut(name) {
            instance.handle.stdin = Some(stdin);
        }

        result.map_err(|e| CoreError::Unavailable(format!("stdin write failed: {e}")))
    }

    pub async fn install_miner(&self, kind: MinerKind) -> Result<()> {
        let adapter = (self.factory)(kind);
        adapter.install().await?;
        Ok(())
    }

    pub async fn uninstall_miner(&self, kind: MinerKind) -> Result<()> {
        {
            let instances = self.instances.read().await;
            if instances.values().any(|i| i.kind == kind && i.is_active()) {
                return Err(CoreError::ResourceBusy(format!(
                    "instances of {kind} are still running"
                )));
            }
        }
        let adapter = (self.factory)(kind);
        adapter.uninstall().await?;
        Ok(())
    }

    pub fn available_miners() -> Vec<AvailableMiner> {
        MinerKind::all()
            .iter()
            .map(|kind| {
                let desc = MinerDescriptor::for_kind(*kind);
                AvailableMiner {
                    name: kind.to_string(),
                    description: desc.description.to_string(),
                }
            })
            .collect()
    }

    pub async fn installed_miners(&self) -> Vec<InstalledMinerInfo> {
        let mut infos = Vec::new();
        for kind in MinerKind::all() {
            let adapter = (self.factory)(*kind);
            let status = adapter.check_installation().await.unwrap_or_default();
            infos.push(InstalledMinerInfo {
                kind: *kind,
                installed: status.installed,
                version: status.version,
                path: status.path,
            });
        }
        infos
    }

    /// Start every autostart entry. Failures are logged and never abort
    /// construction of the manager.
    pub async fn autostart(&self, settings: &Settings) {
        for entry in settings.miners.iter().filter(|e| e.autostart) {
            match self.start_miner(entry.kind, entry.config.clone()).await {
                Ok(name) => info!("Autostarted {}", name),
                Err(e) => warn!("Autostart of {} failed: {}", entry.kind, e),
            }
        }
    }

    /// One poller tick: parallel bounded stats fan-out, then a single
    /// write pass applying samples, state transitions, and reaping.
    pub async fn poll_once(&self) {
        let targets: Vec<(String, Arc<dyn MinerAdapter + 'static>)> = {
            let map = self.instances.read().await;
            map.values()
                .filter(|i| i.is_active())
                .map(|i| (i.name.clone(), Arc::clone(&i.adapter)))
                .collect()
        };

        let bound = targets.len().min(num_cpus::get() * 2).max(1);
        let stats_timeout = self.config.stats_timeout;
        let futs: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = (String, Result<Option<PerformanceSample>>)> + Send>>> =
            targets
                .into_iter()
                .map(|(name, adapter)| {
                    Box::pin(fetch_one_stat(name, adapter, stats_timeout))
                        as std::pin::Pin<Box<dyn std::future::Future<Output = _> + Send>>
                })
                .collect();
        let results: Vec<(String, Result<Option<PerformanceSample>>)> =
            futures::stream::iter(futs).buffer_unordered(bound).collect().await;

        let history = self.history.lock().clone();
        let mut events = Vec::new();
        {
            let mut map = self.instances.write().await;
            for (name, result) in results {
                let Some(instance) = map.get_mut(&name) else {
                    continue;
                };
                match result {
                    Ok(Some(sample)) => {
                        instance.consecutive_failures = 0;
                        if instance.state == InstanceState::Starting {
                            instance.state = InstanceState::Running;
                            events.push(MinerEvent::Running { name: name.clone() });
                        }
                        if !sample.stale {
                            let point = HashratePoint {
                                miner: name.clone(),
                                timestamp: sample.timestamp,
                                hashrate: sample.hashrate,
                            };
                            instance.push_ring(point.clone());
                            let minute = sample.timestamp / 60;
                            if minute > instance.last_history_minute {
                                if let Some(writer) = &history {
                                    writer.record(point);
                                }
                                instance.last_history_minute = minute;
                            }
                        }
                        instance.last_sample = Some(sample);
                    }
                    Ok(None) => {
                        if instance.state == InstanceState::Starting
                            && instance.started_mono.elapsed() >= self.config.readiness_grace
                        {
                            instance.state = InstanceState::Running;
                            events.push(MinerEvent::Running { name: name.clone() });
                        }
                    }
                    Err(e) => {
                        instance.consecutive_failures += 1;
                        debug!("Stats fetch failed for {}: {}", name, e);
                        if instance.consecutive_failures >= STALE_FAILURE_THRESHOLD {
                            if let Some(sample) = instance.last_sample.as_mut() {
                                if !sample.stale {
                                    warn!(
                                        "Marking {} stats stale after {} failed fetches",
                                        name, instance.consecutive_failures
                                    );
                                }
                                sample.stale = true;
                            }
                        }
                    }
                }
            }

            // Unexpected child exits surface as state transitions, never
            // as errors out of the manager.
            let mut reaped = Vec::new();
            for (name, instance) in map.iter_mut() {
                if let Some(child) = instance.handle.child.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        if instance.state != InstanceState::Exited {
                            warn!("Miner {} exited unexpectedly: {}", name, status);
                            instance.state = InstanceState::Exited;
                            instance.exited_at = Some(Instant::now());
                            instance.handle.child = None;
                            if let Some(sample) = instance.last_sample.as_mut() {
                                sample.stale = true;
                            }
                            events.push(MinerEvent::Exited {
                                name: name.clone(),
                                code: status.code(),
                            });
                        }
                    }
                }
                if instance.state == InstanceState::Exited
                    && instance
                        .exited_at
                        .map(|t| t.elapsed() >= self.config.exited_retention)
                        .unwrap_or(true)
                {
                    reaped.push(name.clone());
                }
            }
            for name in reaped {
                map.remove(&name);
            }
        }

        for event in events {
            self.events.emit(event);
        }
    }

    /// Start the cooperative stats poller task.
    pub fn spawn_poller(self: Arc<Self>) {
        let manager = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(manager.config.poll_period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                manager.poll_once().await;
            }
        });
        *self.poller.lock() = Some(handle);
    }

    /// Stop the poller, stop every instance concurrently, and release the
    /// history writer so pending rows flush.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }

        let drained: Vec<(String, Arc<dyn MinerAdapter + 'static>, MinerHandle)> = {
            let mut map = self.instances.write().await;
            map.drain()
                .map(|(name, mut instance)| {
                    let handle = std::mem::replace(
                        &mut instance.handle,
                        MinerHandle {
                            child: None,
                            stdin: None,
                        },
                    );
                    (name, Arc::clone(&instance.adapter), handle)
                })
                .collect()
        };

        futures::future::join_all(drained.into_iter().map(
            |(name, adapter, mut handle)| async move {
                adapter.stop(&mut handle).await;
                info!("Stopped miner {} during shutdown", name);
            },
        ))
        .await;

        *self.history.lock() = None;
        info!("Miner manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HistoryStore;
    use minefleet_miner_adapters::FakeAdapter;

    fn fake_factory() -> AdapterFactory {
        Arc::new(|kind| Box::new(FakeAdapter::new(kind)))
    }

    fn test_config() -> ManagerConfig {
        ManagerConfig {
            poll_period: Duration::from_millis(50),
            stats_timeout: Duration::from_millis(500),
            readiness_grace: Duration::from_millis(50),
            exited_retention: Duration::from_millis(100),
        }
    }

    fn miner_config(kind: MinerKind, worker: &str) -> MinerConfig {
        MinerConfig {
            kind,
            pool: "pool.example:3333".to_string(),
            worker: worker.to_string(),
            password: "x".to_string(),
            tls: false,
            threads: 1,
            extra_args: String::new(),
            algorithm: None,
            devices: Vec::new(),
        }
    }

    #[tokio::test]
    async fn start_then_get_returns_same_instance() {
        let manager = MinerManager::new(fake_factory(), None, test_config());
        let name = manager
            .start_miner(MinerKind::Xmrig, miner_config(MinerKind::Xmrig, "w1"))
            .await
            .unwrap();
        assert_eq!(name, "xmrig-001");

        let summary = manager.get_miner(&name).await.unwrap();
        assert_eq!(summary.name, name);
        assert_eq!(summary.kind, MinerKind::Xmrig);
        assert_eq!(summary.state, InstanceState::Starting);
    }

    #[tokio::test]
    async fn names_are_monotonic_per_kind() {
        let manager = MinerManager::new(fake_factory(), None, test_config());
        let first = manager
            .start_miner(MinerKind::Xmrig, miner_config(MinerKind::Xmrig, "w1"))
            .await
            .unwrap();
        let second = manager
            .start_miner(MinerKind::Xmrig, miner_config(MinerKind::Xmrig, "w2"))
            .await
            .unwrap();
        assert_eq!(first, "xmrig-001");
        assert_eq!(second, "xmrig-002");
    }

    #[tokio::test]
    async fn duplicate_config_is_resource_busy() {
        let manager = MinerManager::new(fake_factory(), None, test_config());
        manager
            .start_miner(MinerKind::Xmrig, miner_config(MinerKind::Xmrig, "w1"))
            .await
            .unwrap();
        let err = manager
            .start_miner(MinerKind::Xmrig, miner_config(MinerKind::Xmrig, "w1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ResourceBusy(_)));
    }

    #[tokio::test]
    async fn kind_mismatch_is_invalid_argument() {
        let manager = MinerManager::new(fake_factory(), None, test_config());
        let err = manager
            .start_miner(MinerKind::Xmrig, miner_config(MinerKind::CpuminerOpt, "w1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn stop_removes_instance() {
        let manager = MinerManager::new(fake_factory(), None, test_config());
        let name = manager
            .start_miner(MinerKind::Xmrig, miner_config(MinerKind::Xmrig, "w1"))
            .await
            .unwrap();

        manager.stop_miner(&name).await.unwrap();
        assert!(matches!(
            manager.get_miner(&name).await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            manager.stop_miner(&name).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn poll_promotes_to_running_and_fills_ring() {
        let manager = MinerManager::new(fake_factory(), None, test_config());
        let name = manager
            .start_miner(MinerKind::Xmrig, miner_config(MinerKind::Xmrig, "w1"))
            .await
            .unwrap();

        manager.poll_once().await;

        let summary = manager.get_miner(&name).await.unwrap();
        assert_eq!(summary.state, InstanceState::Running);
        assert!(summary.running);
        let stats = summary.stats.unwrap();
        assert_eq!(stats.hashrate, 1234.0);

        let ring = manager.get_hashrate_history(&name).await.unwrap();
        assert_eq!(ring.len(), 1);
        assert_eq!(ring[0].hashrate, 1234.0);

        // Same-second samples must not break strict timestamp ordering.
        manager.poll_once().await;
        let ring = manager.get_hashrate_history(&name).await.unwrap();
        assert!(ring.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn logs_are_captured() {
        let manager = MinerManager::new(fake_factory(), None, test_config());
        let name = manager
            .start_miner(MinerKind::Xmrig, miner_config(MinerKind::Xmrig, "w1"))
            .await
            .unwrap();

        // Give the fake adapter's log task a moment to emit.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let logs = manager.get_logs(&name, 100).await.unwrap();
        assert!(logs.iter().any(|l| l.contains("fake miner")));
    }

    #[tokio::test]
    async fn stdin_without_writer_is_precondition_failed() {
        let manager = MinerManager::new(fake_factory(), None, test_config());
        let name = manager
            .start_miner(MinerKind::Xmrig, miner_config(MinerKind::Xmrig, "w1"))
            .await
            .unwrap();
        let err = manager.write_stdin(&name, b"h\n").await.unwrap_err();
        assert!(matches!(err, CoreError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn autostart_tolerates_failures() {
        let manager = MinerManager::new(fake_factory(), None, test_config());
        let settings = Settings {
            miners: vec![
                crate::MinerEntry {
                    kind: MinerKind::Xmrig,
                    autostart: true,
                    config: miner_config(MinerKind::Xmrig, "w1"),
                },
                // Duplicate config: the second start fails and is ignored.
                crate::MinerEntry {
                    kind: MinerKind::Xmrig,
                    autostart: true,
                    config: miner_config(MinerKind::Xmrig, "w1"),
                },
                crate::MinerEntry {
                    kind: MinerKind::CpuminerOpt,
                    autostart: false,
                    config: miner_config(MinerKind::CpuminerOpt, "w2"),
                },
            ],
            ..Default::default()
        };

        manager.autostart(&settings).await;
        assert_eq!(manager.list_miners().await.len(), 1);
    }

    #[tokio::test]
    async fn poller_forwards_to_history_once_per_minute() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HistoryStore::open(&dir.path().join("mining.db"), 30).unwrap());
        let (writer, writer_task) = Arc::clone(&store).spawn_writer();

        let manager = MinerManager::new(fake_factory(), Some(writer), test_config());
        let name = manager
            .start_miner(MinerKind::Xmrig, miner_config(MinerKind::Xmrig, "w1"))
            .await
            .unwrap();

        manager.poll_once().await;
        manager.poll_once().await;

        manager.shutdown().await;
        writer_task.await.unwrap();

        // Both polls land in the same low-resolution minute unless the
        // test straddles a minute boundary.
        let points = store.range_by_miner(&name, 0, u64::MAX / 2).unwrap();
        assert!((1..=2).contains(&points.len()));
        assert_eq!(points[0].hashrate, 1234.0);
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let manager = MinerManager::new(fake_factory(), None, test_config());
        manager
            .start_miner(MinerKind::Xmrig, miner_config(MinerKind::Xmrig, "w1"))
            .await
            .unwrap();
        manager
            .start_miner(MinerKind::CpuminerOpt, miner_config(MinerKind::CpuminerOpt, "w2"))
            .await
            .unwrap();

        manager.shutdown().await;
        assert!(manager.list_miners().await.is_empty());
    }

    #[tokio::test]
    async fn available_miners_lists_descriptors() {
        let available = MinerManager::available_miners();
        assert_eq!(available.len(), MinerKind::all().len());
        assert!(available.iter().any(|m| m.name == "xmrig"));
    }
}
