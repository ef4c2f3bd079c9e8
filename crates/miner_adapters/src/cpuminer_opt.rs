//! cpuminer-opt adapter: stdout-parse stats strategy.
//!
//! cpuminer-opt has no stats API, so the adapter registers regex
//! extractors against the captured stdout stream and serves the last
//! parsed sample.

use crate::descriptor::{MinerDescriptor, CPUMINER_OPT_DESCRIPTOR};
use crate::{
    install, AdapterError, InstallStatus, LogSink, MinerAdapter, MinerConfig, MinerHandle,
    MinerKind, MinerState, PerformanceSample, Result,
};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

const STOP_GRACE: Duration = Duration::from_secs(10);

/// Rolling average window for hashrate samples.
const HASHRATE_AVG_WINDOW: usize = 60;

/// Coin algorithm → cpuminer-opt `-a` argument.
pub const SUPPORTED_ALGORITHMS: &[(&str, &str)] = &[
    ("sha256d", "sha256d"),
    ("sha256", "sha256d"),
    ("sha-256", "sha256d"),
    ("scrypt", "scrypt"),
    ("x11", "x11"),
    ("x16r", "x16r"),
    ("x17", "x17"),
    ("lyra2v2", "lyra2v2"),
    ("lyra2z", "lyra2z"),
    ("yescrypt", "yescrypt"),
    ("yespower", "yespower"),
    ("allium", "allium"),
    ("blake2b", "blake2b"),
    ("blake2s", "blake2s"),
    ("groestl", "groestl"),
    ("keccak", "keccak"),
    ("neoscrypt", "neoscrypt"),
    ("quark", "quark"),
    ("qubit", "qubit"),
    ("skein", "skein"),
    ("tribus", "tribus"),
];

pub fn map_algorithm(coin_algo: &str) -> Option<&'static str> {
    SUPPORTED_ALGORITHMS
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(coin_algo))
        .map(|(_, v)| *v)
}

pub fn supports_algorithm(algo: &str) -> bool {
    map_algorithm(algo).is_some()
}

/// Compiled extractor set. Versioned so a miner release with changed log
/// formats gets a new table rather than edits scattered across patterns.
struct LineExtractors {
    version: u32,
    hashrate: Vec<(Regex, f64)>,
    shares: Vec<Regex>,
    accepted_bang: Option<Regex>,
    difficulty: Option<Regex>,
}

impl LineExtractors {
    fn v1() -> Self {
        let hashrate = [
            (r"(\d+\.?\d*)\s*GH/s", 1_000_000_000.0),
            (r"(\d+\.?\d*)\s*MH/s", 1_000_000.0),
            (r"(\d+\.?\d*)\s*kH/s", 1_000.0),
            (r"(\d+\.?\d*)\s*H/s", 1.0),
            (r"Total:\s*(\d+\.?\d*)GH", 1_000_000_000.0),
            (r"Total:\s*(\d+\.?\d*)MH", 1_000_000.0),
            (r"Total:\s*(\d+\.?\d*)kH", 1_000.0),
            (r"Total:\s*(\d+\.?\d*)H", 1.0),
        ]
        .iter()
        .filter_map(|(p, m)| Regex::new(p).ok().map(|re| (re, *m)))
        .collect();

        let shares = [r"accepted[:\s]+(\d+)/(\d+)", r"accepted\s*\((\d+)/(\d+)\)"]
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();

        Self {
            version: 1,
            hashrate,
            shares,
            accepted_bang: Regex::new(r"\((\d+)\)").ok(),
            difficulty: Regex::new(r"diff[:\s]+(\d+\.?\d*)").ok(),
        }
    }

    /// Extractors are side-effect free; a miss yields `None`, never an error.
    fn extract_hashrate(&self, line: &str) -> Option<f64> {
        for (re, multiplier) in &self.hashrate {
            if let Some(caps) = re.captures(line) {
                if let Ok(num) = caps.get(1)?.as_str().parse::<f64>() {
                    return Some(num * multiplier);
                }
            }
        }
        None
    }

    fn extract_shares(&self, line: &str) -> Option<(u64, u64)> {
        let line_lower = line.to_lowercase();

        for re in &self.shares {
            if let Some(caps) = re.captures(&line_lower) {
                let accepted: u64 = caps.get(1)?.as_str().parse().ok()?;
                let total: u64 = caps.get(2)?.as_str().parse().ok()?;
                return Some((accepted, total.saturating_sub(accepted)));
            }
        }

        if line_lower.contains("yes!") || line_lower.contains("yay!") {
            if let Some(caps) = self.accepted_bang.as_ref()?.captures(&line_lower) {
                let accepted: u64 = caps.get(1)?.as_str().parse().ok()?;
                return Some((accepted, 0));
            }
        }

        None
    }

    fn extract_difficulty(&self, line: &str) -> Option<f64> {
        self.difficulty
            .as_ref()?
            .captures(&line.to_lowercase())
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

/// Thread-safe collector fed by the stdout reader task.
#[derive(Clone)]
pub struct StatsCollector {
    inner: Arc<Mutex<CollectorInner>>,
    extractors: Arc<LineExtractors>,
}

struct CollectorInner {
    hashrate: Option<f64>,
    hashrate_samples: VecDeque<f64>,
    accepted: u64,
    rejected: u64,
    difficulty: f64,
    start_time: Option<Instant>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CollectorInner {
                hashrate: None,
                hashrate_samples: VecDeque::with_capacity(HASHRATE_AVG_WINDOW),
                accepted: 0,
                rejected: 0,
                difficulty: 0.0,
                start_time: None,
            })),
            extractors: Arc::new(LineExtractors::v1()),
        }
    }

    pub fn extractor_version(&self) -> u32 {
        self.extractors.version
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.hashrate = None;
        inner.hashrate_samples.clear();
        inner.accepted = 0;
        inner.rejected = 0;
        inner.difficulty = 0.0;
        inner.start_time = Some(Instant::now());
    }

    pub fn parse_line(&self, line: &str) {
        let mut inner = self.inner.lock();

        if let Some(hr) = self.extractors.extract_hashrate(line) {
            inner.hashrate = Some(hr);
            if inner.hashrate_samples.len() >= HASHRATE_AVG_WINDOW {
                inner.hashrate_samples.pop_front();
            }
            inner.hashrate_samples.push_back(hr);
        }

        if let Some((acc, rej)) = self.extractors.extract_shares(line) {
            inner.accepted = acc;
            inner.rejected = rej;
        }

        if let Some(diff) = self.extractors.extract_difficulty(line) {
            inner.difficulty = diff;
        }
    }

    /// `None` until the first hashrate line has been parsed.
    pub fn sample(&self) -> Option<PerformanceSample> {
        let inner = self.inner.lock();
        let hashrate = inner.hashrate?;
        Some(PerformanceSample {
            timestamp: PerformanceSample::now(),
            hashrate,
            accepted_shares: inner.accepted,
            rejected_shares: inner.rejected,
            uptime_secs: inner
                .start_time
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
            algorithm: None,
            pool: None,
            difficulty: inner.difficulty,
            stale: false,
        })
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CpuminerOptAdapter {
    state: Mutex<MinerState>,
    collector: StatsCollector,
    launched: Mutex<Option<(String, String)>>,
    last_sample: Mutex<Option<PerformanceSample>>,
}

impl CpuminerOptAdapter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MinerState::Stopped),
            collector: StatsCollector::new(),
            launched: Mutex::new(None),
            last_sample: Mutex::new(None),
        }
    }

    fn build_args(&self, config: &MinerConfig) -> Result<Vec<String>> {
        let requested = config.algorithm.as_deref().unwrap_or("sha256d");
        let algo = map_algorithm(requested).ok_or_else(|| {
            AdapterError::Process(format!("algorithm '{requested}' not supported by cpuminer-opt"))
        })?;

        let cpu_count = num_cpus::get() as u32;
        let threads = if config.threads > 0 {
            config.threads
        } else {
            (cpu_count / 2).max(1)
        };

        // TLS is selected through the stratum scheme.
        let pool = if config.tls && !config.pool.contains("://") {
            format!("stratum+tcps://{}", config.pool)
        } else {
            config.pool.clone()
        };

        let mut args = vec![
            "-a".to_string(),
            algo.to_string(),
            "-o".to_string(),
            pool,
            "-u".to_string(),
            config.worker.clone(),
            "-p".to_string(),
            config.password.clone(),
            "-t".to_string(),
            threads.to_string(),
        ];
        args.extend(config.extra_args.split_whitespace().map(str::to_string));
        Ok(args)
    }
}

#[async_trait::async_trait]
impl MinerAdapter for CpuminerOptAdapter {
    fn kind(&self) -> MinerKind {
        MinerKind::CpuminerOpt
    }

    fn descriptor(&self) -> &'static MinerDescriptor {
        &CPUMINER_OPT_DESCRIPTOR
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

        let args = match self.build_args(config) {
            Ok(args) => args,
            Err(e) => {
                *self.state.lock() = MinerState::Error;
                return Err(e);
            }
        };

        let status = self.check_installation().await?;
        let binary = match status.path {
            Some(path) if status.installed => path,
            _ => {
                *self.state.lock() = MinerState::Error;
                return Err(AdapterError::NotInstalled("cpuminer-opt".to_string()));
            }
        };

        info!("Starting cpuminer-opt: {:?} {:?}", binary, args);
        self.collector.reset();

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
                return Err(AdapterError::Process(format!("failed to spawn: {e}")));
            }
        };

        if let Some(stdout) = child.stdout.take() {
            let sink = logs.clone();
            let collector = self.collector.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    collector.parse_line(&line);
                    let _ = sink.send(line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let sink = logs.clone();
            let collector = self.collector.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    // cpuminer-opt logs status lines on stderr as well
                    collector.parse_line(&line);
                    let _ = sink.send(format!("[stderr] {line}"));
                }
            });
        }

        let stdin = child.stdin.take();
        *self.launched.lock() = Some((
            config.pool.clone(),
            config
                .algorithm
                .clone()
                .unwrap_or_else(|| "sha256d".to_string()),
        ));
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
                info!("Sending SIGTERM to cpuminer-opt PID {}", pid);
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        match timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => info!("cpuminer-opt stopped gracefully: {}", status),
            Ok(Err(e)) => error!("Error waiting for cpuminer-opt: {}", e),
            Err(_) => {
                warn!("cpuminer-opt did not stop within {:?}, killing", STOP_GRACE);
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }

        *self.state.lock() = MinerState::Stopped;
    }

    async fn fetch_stats(&self) -> Result<Option<PerformanceSample>> {
        if *self.state.lock() != MinerState::Running {
            return Ok(self.last_sample.lock().clone().map(|mut s| {
                s.stale = true;
                s
            }));
        }

        let Some(mut sample) = self.collector.sample() else {
            return Ok(None);
        };

        if let Some((pool, algo)) = self.launched.lock().clone() {
            sample.pool = Some(pool);
            sample.algorithm = Some(algo);
        }
        *self.last_sample.lock() = Some(sample.clone());
        Ok(Some(sample))
    }
}

impl Default for CpuminerOptAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_mapping() {
        assert_eq!(map_algorithm("sha256"), Some("sha256d"));
        assert_eq!(map_algorithm("SHA256"), Some("sha256d"));
        assert_eq!(map_algorithm("scrypt"), Some("scrypt"));
        assert_eq!(map_algorithm("x11"), Some("x11"));
        assert_eq!(map_algorithm("randomx"), None);
        assert_eq!(map_algorithm("ethash"), None);
    }

    #[test]
    fn hashrate_extraction() {
        let ex = LineExtractors::v1();
        assert_eq!(ex.extract_hashrate("CPU: 1.5 kH/s"), Some(1500.0));
        assert_eq!(ex.extract_hashrate("Total: 2.0 MH/s"), Some(2_000_000.0));
        assert_eq!(ex.extract_hashrate("Speed: 500 H/s"), Some(500.0));
        assert_eq!(ex.extract_hashrate("Rate: 1.5 GH/s"), Some(1_500_000_000.0));
        assert_eq!(ex.extract_hashrate("Total: 1.5kH"), Some(1500.0));
        assert_eq!(ex.extract_hashrate("Connected to pool"), None);
    }

    #[test]
    fn shares_extraction() {
        let ex = LineExtractors::v1();
        assert_eq!(ex.extract_shares("accepted: 5/6"), Some((5, 1)));
        assert_eq!(ex.extract_shares("accepted: 10/10"), Some((10, 0)));
        assert_eq!(ex.extract_shares("accepted (5/6)"), Some((5, 1)));
        assert_eq!(ex.extract_shares("yay! (5)"), Some((5, 0)));
        assert_eq!(ex.extract_shares("yes! (10)"), Some((10, 0)));
        assert_eq!(ex.extract_shares("no shares here"), None);
    }

    #[test]
    fn difficulty_extraction() {
        let ex = LineExtractors::v1();
        assert_eq!(ex.extract_difficulty("diff: 1.5"), Some(1.5));
        assert_eq!(ex.extract_difficulty("Diff 100"), Some(100.0));
        assert_eq!(ex.extract_difficulty("no match"), None);
    }

    #[test]
    fn collector_produces_samples_after_first_hashrate() {
        let collector = StatsCollector::new();
        collector.reset();
        assert!(collector.sample().is_none());

        collector.parse_line("[INFO] cpuminer-opt 3.24.5");
        collector.parse_line("[INFO] CPU: 1.5 kH/s");
        collector.parse_line("[INFO] accepted: 5/6");
        collector.parse_line("[INFO] diff: 2.5");

        let sample = collector.sample().unwrap();
        assert_eq!(sample.hashrate, 1500.0);
        assert_eq!(sample.accepted_shares, 5);
        assert_eq!(sample.rejected_shares, 1);
        assert_eq!(sample.difficulty, 2.5);
        assert!(!sample.stale);
    }

    #[test]
    fn unsupported_algorithm_fails_arg_build() {
        let adapter = CpuminerOptAdapter::new();
        let config = MinerConfig {
            kind: MinerKind::CpuminerOpt,
            pool: "pool.example:3333".to_string(),
            worker: "w".to_string(),
            password: "x".to_string(),
            tls: false,
            threads: 0,
            extra_args: String::new(),
            algorithm: Some("randomx".to_string()),
            devices: Vec::new(),
        };
        assert!(adapter.build_args(&config).is_err());
    }

    #[test]
    fn default_algorithm_and_threads() {
        let adapter = CpuminerOptAdapter::new();
        let config = MinerConfig {
            kind: MinerKind::CpuminerOpt,
            pool: "pool.example:3333".to_string(),
            worker: "w".to_string(),
            password: "x".to_string(),
            tls: false,
            threads: 0,
            extra_args: String::new(),
            algorithm: None,
            devices: Vec::new(),
        };
        let args = adapter.build_args(&config).unwrap();
        assert_eq!(args[0], "-a");
        assert_eq!(args[1], "sha256d");
        let t_pos = args.iter().position(|a| a == "-t").unwrap();
        assert!(args[t_pos + 1].parse::<u32>().unwrap() >= 1);
    }
}
