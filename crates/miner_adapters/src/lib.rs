mod cpuminer_opt;
mod descriptor;
mod install;
mod xmrig;

#[cfg(any(test, feature = "test-miners"))]
mod fake;

pub use cpuminer_opt::{
    map_algorithm as cpuminer_map_algorithm, supports_algorithm as cpuminer_supports_algorithm,
    CpuminerOptAdapter, StatsCollector,
};
pub use descriptor::{MinerDescriptor, StatsStrategy};
pub use install::miners_data_dir;
pub use xmrig::XmrigAdapter;

#[cfg(any(test, feature = "test-miners"))]
pub use fake::FakeAdapter;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::process::{Child, ChildStdin};

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("miner not installed: {0}")]
    NotInstalled(String),
    #[error("binary not found: {0}")]
    BinaryNotFound(String),
    #[error("checksum mismatch - artifact may be tampered")]
    ChecksumMismatch,
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("miner already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, AdapterError>;

/// Sink for captured stdout/stderr lines. The manager owns the receiving
/// end and drains it into the instance's log buffer.
pub type LogSink = tokio::sync::mpsc::UnboundedSender<String>;

/// Families of miner executables sharing an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MinerKind {
    Xmrig,
    CpuminerOpt,
}

impl MinerKind {
    pub fn all() -> &'static [MinerKind] {
        &[MinerKind::Xmrig, MinerKind::CpuminerOpt]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MinerKind::Xmrig => "xmrig",
            MinerKind::CpuminerOpt => "cpuminer-opt",
        }
    }
}

impl std::fmt::Display for MinerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MinerKind {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "xmrig" => Ok(MinerKind::Xmrig),
            "cpuminer-opt" => Ok(MinerKind::CpuminerOpt),
            other => Err(AdapterError::Process(format!("unknown miner kind: {other}"))),
        }
    }
}

/// Launch configuration for one miner instance. Kind-specific fields are
/// serde-defaulted so configs stay forward compatible across kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinerConfig {
    pub kind: MinerKind,
    pub pool: String,
    pub worker: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default)]
    pub tls: bool,
    /// 0 = derive from available cores
    #[serde(default)]
    pub threads: u32,
    #[serde(default)]
    pub extra_args: String,
    #[serde(default)]
    pub algorithm: Option<String>,
    /// GPU device indices; ignored by CPU kinds
    #[serde(default)]
    pub devices: Vec<u32>,
}

fn default_password() -> String {
    "x".to_string()
}

impl MinerConfig {
    /// Stable identity hash over the fields that make two configs
    /// equivalent for duplicate-start detection.
    pub fn config_hash(&self) -> String {
        let input = format!(
            "{}|{}|{}|{}|{}|{}|{}|{:?}|{:?}",
            self.kind,
            self.pool,
            self.worker,
            self.password,
            self.tls,
            self.threads,
            self.extra_args,
            self.algorithm,
            self.devices,
        );
        let mut hasher = Sha256::new();
        hasher.update(input.as_bytes());
        hex::encode(&hasher.finalize()[..8])
    }

    /// Pool host without scheme or port, for display.
    pub fn pool_host(&self) -> String {
        self.pool
            .split("://")
            .last()
            .unwrap_or(&self.pool)
            .split(':')
            .next()
            .unwrap_or(&self.pool)
            .to_string()
    }
}

/// One performance measurement for one instance at one instant.
/// Missing values are zero or `None`, never negative sentinels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    pub timestamp: u64,
    pub hashrate: f64,
    pub accepted_shares: u64,
    pub rejected_shares: u64,
    pub uptime_secs: u64,
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub difficulty: f64,
    #[serde(default)]
    pub stale: bool,
}

impl PerformanceSample {
    pub fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Result of probing a kind's installation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallStatus {
    pub installed: bool,
    pub version: Option<String>,
    pub path: Option<PathBuf>,
}

/// Internal adapter process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MinerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Live handles returned by [`MinerAdapter::start`]. The fake adapter used
/// in tests produces no real child, hence the options.
pub struct MinerHandle {
    pub child: Option<Child>,
    pub stdin: Option<ChildStdin>,
}

/// Uniform capability set implemented once per miner kind. Methods take
/// `&self`; adapters keep mutable state behind locks so a shared adapter
/// can serve the stats poller while the manager drives its lifecycle.
#[async_trait::async_trait]
pub trait MinerAdapter: Send + Sync {
    fn kind(&self) -> MinerKind;

    fn descriptor(&self) -> &'static MinerDescriptor;

    fn state(&self) -> MinerState;

    async fn check_installation(&self) -> Result<InstallStatus>;

    /// Idempotent: succeeds without redownload when the expected artifact
    /// already exists and verifies.
    async fn install(&self) -> Result<()>;

    async fn uninstall(&self) -> Result<()>;

    async fn start(&self, config: &MinerConfig, logs: LogSink) -> Result<MinerHandle>;

    /// Graceful stop: SIGTERM, bounded wait, then kill. Returns after reap.
    async fn stop(&self, handle: &mut MinerHandle);

    /// `Ok(None)` while the child is not yet ready; after the child exits
    /// the last known sample is returned flagged stale.
    async fn fetch_stats(&self) -> Result<Option<PerformanceSample>>;
}

/// Central factory mapping a kind to its adapter constructor.
pub fn create_adapter(kind: MinerKind) -> Box<dyn MinerAdapter> {
    match kind {
        MinerKind::Xmrig => Box::new(XmrigAdapter::new()),
        MinerKind::CpuminerOpt => Box::new(CpuminerOptAdapter::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in MinerKind::all() {
            assert_eq!(kind.as_str().parse::<MinerKind>().unwrap(), *kind);
        }
        assert!("gpuminer-9000".parse::<MinerKind>().is_err());
    }

    fn sample_config() -> MinerConfig {
        MinerConfig {
            kind: MinerKind::Xmrig,
            pool: "pool.example:3333".to_string(),
            worker: "w1".to_string(),
            password: "x".to_string(),
            tls: false,
            threads: 0,
            extra_args: String::new(),
            algorithm: None,
            devices: Vec::new(),
        }
    }

    #[test]
    fn config_hash_is_stable_and_discriminating() {
        let a = sample_config();
        let mut b = sample_config();
        assert_eq!(a.config_hash(), b.config_hash());

        b.worker = "w2".to_string();
        assert_ne!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn pool_host_strips_scheme_and_port() {
        let mut config = sample_config();
        config.pool = "stratum+tcp://pool.example:3333".to_string();
        assert_eq!(config.pool_host(), "pool.example");
    }

    #[test]
    fn factory_builds_each_kind() {
        for kind in MinerKind::all() {
            let adapter = create_adapter(*kind);
            assert_eq!(adapter.kind(), *kind);
            assert_eq!(adapter.state(), MinerState::Stopped);
        }
    }
}
