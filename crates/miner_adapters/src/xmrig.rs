//! XMRig adapter: http-endpoint stats strategy.
//!
//! The child is launched with its local HTTP API enabled on a loopback
//! port probed per instance; stats are read from `/2/summary`.

use crate::descriptor::{MinerDescriptor, XMRIG_DESCRIPTOR};
use crate::{
    install, AdapterError, InstallStatus, LogSink, MinerAdapter, MinerConfig, MinerHandle,
    MinerKind, MinerState, PerformanceSample, Result,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

/// Base port for the child's HTTP API; incremented while busy.
const API_PORT_BASE: u16 = 45580;
const API_PORT_RANGE: u16 = 20;

const STATS_TIMEOUT: Duration = Duration::from_secs(3);
const STOP_GRACE: Duration = Duration::from_secs(10);

pub struct XmrigAdapter {
    api_port: AtomicU16,
    state: Mutex<MinerState>,
    started_at: Mutex<Option<Instant>>,
    launched: Mutex<Option<LaunchContext>>,
    last_sample: Mutex<Option<PerformanceSample>>,
    client: reqwest::Client,
}

struct LaunchContext {
    pool: String,
    algorithm: Option<String>,
}

impl XmrigAdapter {
    pub fn new() -> Self {
        Self {
            api_port: AtomicU16::new(0),
            state: Mutex::new(MinerState::Stopped),
            started_at: Mutex::new(None),
            launched: Mutex::new(None),
            last_sample: Mutex::new(None),
            client: reqwest::Client::new(),
        }
    }

    /// Probe for a free loopback port for this instance's HTTP API.
    fn find_available_port(&self) -> u16 {
        use std::net::TcpListener;

        for offset in 0..API_PORT_RANGE {
            let port = API_PORT_BASE + offset;
            if TcpListener::bind(("127.0.0.1", port)).is_ok() {
                self.api_port.store(port, Ordering::SeqCst);
                return port;
            }
        }
        self.api_port.store(API_PORT_BASE, Ordering::SeqCst);
        API_PORT_BASE
    }

    fn build_args(&self, config: &MinerConfig, api_port: u16) -> Vec<String> {
        let available = num_cpus::get() as u32;
        let threads = if config.threads > 0 {
            config.threads
        } else {
            (available / 2).max(1)
        };

        let mut args = vec![
            "-o".to_string(),
            config.pool.clone(),
            "-u".to_string(),
            config.worker.clone(),
            "-p".to_string(),
            config.password.clone(),
            "-t".to_string(),
            threads.to_string(),
            "--http-enabled".to_string(),
            "--http-host".to_string(),
            "127.0.0.1".to_string(),
            "--http-port".to_string(),
            api_port.to_string(),
            "--no-color".to_string(),
        ];
        if config.tls {
            args.push("--tls".to_string());
        }
        if let Some(algo) = &config.algorithm {
            args.push("-a".to_string());
            args.push(algo.clone());
        }
        args.extend(config.extra_args.split_whitespace().map(str::to_string));
        args
    }
}

#[async_trait::async_trait]
impl MinerAdapter for XmrigAdapter {
    fn kind(&self) -> MinerKind {
        MinerKind::Xmrig
    }

    fn descriptor(&self) -> &'static MinerDescriptor {
        &XMRIG_DESCRIPTOR
    }

    fn state(&self) -> MinerState {
        *self.state.lock()
    }

    async fn check_installation(&self) -> Result<InstallStatus> {
        install::check_installed(self.descriptor()).await
    }

    async fn install(&self) -> Result<()> {
        install::install(self.descriptor()).await.map(|_| ())
    }

    async fn uninstall(&self) -> Result<()> {
        install::uninstall(self.descriptor()).await
    }

    async fn start(&self, config: &MinerConfig, logs: LogSink) -> Result<MinerHandle> {
        {
            let state = *self.state.lock();
            if state == MinerState::Running || state == MinerState::Starting {
                return Err(AdapterError::AlreadyRunning);
            }
        }
        *self.state.lock() = MinerState::Starting;

        let status = self.check_installation().await?;
        let binary = match status.path {
            Some(path) if status.installed => path,
            _ => {
                *self.state.lock() = MinerState::Error;
                return Err(AdapterError::NotInstalled("xmrig".to_string()));
            }
        };

        let api_port = self.find_available_port();
        let args = self.build_args(config, api_port);
        info!(
            "Starting xmrig with pool {}, API port {}",
            config.pool, api_port
        );

        let mut child = match Command::new(&binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                *self.state.lock() = MinerState::Error;
                return Err(AdapterError::Process(e.to_string()));
            }
        };

        if let Some(stdout) = child.stdout.take() {
            let sink = logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = sink.send(line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let sink = logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = sink.send(format!("[stderr] {line}"));
                }
            });
        }

        let stdin = child.stdin.take();
        *self.started_at.lock() = Some(Instant::now());
        *self.launched.lock() = Some(LaunchContext {
            pool: config.pool.clone(),
            algorithm: config.algorithm.clone(),
        });
        *self.last_sample.lock() = None;
        *self.state.lock() = MinerState::Running;

        Ok(MinerHandle {
            child: Some(child),
            stdin,
        })
    }

    async fn stop(&self, handle: &mut MinerHandle) {
        {
            let mut state = self.state.lock();
            if *state != MinerState::Running && *state != MinerState::Starting {
                return;
            }
            *state = MinerState::Stopping;
        }

        let Some(child) = handle.child.as_mut() else {
            *self.state.lock() = MinerState::Stopped;
            return;
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                info!("Sending SIGTERM to xmrig PID {}", pid);
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        match timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => info!("xmrig stopped gracefully with status {}", status),
            Ok(Err(e)) => error!("Error waiting for xmrig: {}", e),
            Err(_) => {
                warn!("xmrig did not stop within {:?}, killing", STOP_GRACE);
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }

        *self.state.lock() = MinerState::Stopped;
    }

    async fn fetch_stats(&self) -> Result<Option<PerformanceSample>> {
        if *self.state.lock() != MinerState::Running {
            // Recently exited: hand back what we last saw, flagged stale.
            return Ok(self.last_sample.lock().clone().map(|mut s| {
                s.stale = true;
                s
            }));
        }

        let api_port = self.api_port.load(Ordering::SeqCst);
        let url = format!("http://127.0.0.1:{api_port}/2/summary");
        let resp = match self.client.get(&url).timeout(STATS_TIMEOUT).send().await {
            Ok(resp) => resp,
            // Endpoint not yet up: no sample available, not an error.
            Err(_) => return Ok(None),
        };

        let summary: XmrigSummary = match resp.json().await {
            Ok(summary) => summary,
            Err(_) => return Ok(None),
        };

        let launched = self.launched.lock();
        let sample = PerformanceSample {
            timestamp: PerformanceSample::now(),
            hashrate: summary.current_hashrate(),
            accepted_shares: summary.accepted_shares(),
            rejected_shares: summary.rejected_shares(),
            uptime_secs: summary.connection.uptime,
            algorithm: summary
                .algo
                .clone()
                .or_else(|| launched.as_ref().and_then(|l| l.algorithm.clone())),
            pool: if summary.connection.pool.is_empty() {
                launched.as_ref().map(|l| l.pool.clone())
            } else {
                Some(summary.connection.pool.clone())
            },
            difficulty: summary.connection.diff.unwrap_or(0.0),
            stale: false,
        };
        *self.last_sample.lock() = Some(sample.clone());
        Ok(Some(sample))
    }
}

impl Default for XmrigAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Response shapes of the child's `/2/summary` endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XmrigSummary {
    #[serde(default)]
    pub hashrate: XmrigHashrate,
    #[serde(default)]
    pub results: XmrigResults,
    #[serde(default)]
    pub connection: XmrigConnection,
    #[serde(default)]
    pub algo: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XmrigHashrate {
    pub total: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XmrigResults {
    pub shares_good: u64,
    pub shares_total: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XmrigConnection {
    pub uptime: u64,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub diff: Option<f64>,
}

impl XmrigSummary {
    pub fn current_hashrate(&self) -> f64 {
        self.hashrate.total.first().copied().flatten().unwrap_or(0.0)
    }

    pub fn accepted_shares(&self) -> u64 {
        self.results.shares_good
    }

    pub fn rejected_shares(&self) -> u64 {
        self.results.shares_total.saturating_sub(self.results.shares_good)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_parses_api_response() {
        let raw = r#"{
            "hashrate": {"total": [1234.5, null, 1200.0]},
            "results": {"shares_good": 10, "shares_total": 12},
            "connection": {"uptime": 300, "pool": "pool.example:3333", "diff": 100000.0},
            "algo": "rx/0"
        }"#;
        let summary: XmrigSummary = serde_json::from_str(raw).unwrap();
        assert_eq!(summary.current_hashrate(), 1234.5);
        assert_eq!(summary.accepted_shares(), 10);
        assert_eq!(summary.rejected_shares(), 2);
        assert_eq!(summary.connection.uptime, 300);
    }

    #[test]
    fn summary_tolerates_missing_fields() {
        let summary: XmrigSummary = serde_json::from_str("{}").unwrap();
        assert_eq!(summary.current_hashrate(), 0.0);
        assert_eq!(summary.rejected_shares(), 0);
    }

    #[test]
    fn args_include_api_and_pool() {
        let adapter = XmrigAdapter::new();
        let config = MinerConfig {
            kind: MinerKind::Xmrig,
            pool: "pool.example:3333".to_string(),
            worker: "w1".to_string(),
            password: "x".to_string(),
            tls: true,
            threads: 4,
            extra_args: "--randomx-1gb-pages".to_string(),
            algorithm: Some("rx/0".to_string()),
            devices: Vec::new(),
        };
        let args = adapter.build_args(&config, 45580);
        assert!(args.contains(&"--http-enabled".to_string()));
        assert!(args.contains(&"45580".to_string()));
        assert!(args.contains(&"--tls".to_string()));
        assert!(args.contains(&"rx/0".to_string()));
        assert!(args.contains(&"--randomx-1gb-pages".to_string()));
        let t_pos = args.iter().position(|a| a == "-t").unwrap();
        assert_eq!(args[t_pos + 1], "4");
    }

    #[tokio::test]
    async fn fetch_stats_is_none_while_stopped_without_history() {
        let adapter = XmrigAdapter::new();
        assert!(adapter.fetch_stats().await.unwrap().is_none());
    }
}
