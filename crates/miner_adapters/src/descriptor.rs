//! Static per-kind descriptors: where the artifact comes from, what the
//! executable is called, and how stats are retrieved.

use crate::MinerKind;

/// How an adapter obtains performance samples from its child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatsStrategy {
    /// Child exposes a local HTTP stats endpoint on a loopback port.
    HttpEndpoint,
    /// Regex extractors run against the captured stdout stream.
    StdoutParse,
}

pub struct MinerDescriptor {
    pub kind: MinerKind,
    pub executable: &'static str,
    pub description: &'static str,
    pub version: &'static str,
    /// URL template with `{version}` and `{platform}` placeholders.
    /// Points at a flat prebuilt binary; archive handling is external.
    pub download_url: &'static str,
    pub strategy: StatsStrategy,
    /// `(platform, sha256)` pins. An empty table falls back to an
    /// executable-header sanity check on the downloaded artifact.
    pub checksums: &'static [(&'static str, &'static str)],
}

pub static XMRIG_DESCRIPTOR: MinerDescriptor = MinerDescriptor {
    kind: MinerKind::Xmrig,
    executable: "xmrig",
    description: "RandomX / CryptoNight CPU miner with local HTTP API",
    version: "6.21.0",
    download_url: "https://github.com/xmrig/xmrig/releases/download/v{version}/xmrig-{version}-{platform}",
    strategy: StatsStrategy::HttpEndpoint,
    checksums: &[],
};

pub static CPUMINER_OPT_DESCRIPTOR: MinerDescriptor = MinerDescriptor {
    kind: MinerKind::CpuminerOpt,
    executable: "cpuminer-opt",
    description: "Multi-algorithm CPU miner (SHA-256d, Scrypt, X-series)",
    version: "3.24.5",
    download_url: "https://github.com/JayDDee/cpuminer-opt/releases/download/v{version}/cpuminer-opt-{version}-{platform}",
    strategy: StatsStrategy::StdoutParse,
    checksums: &[],
};

impl MinerDescriptor {
    pub fn for_kind(kind: MinerKind) -> &'static MinerDescriptor {
        match kind {
            MinerKind::Xmrig => &XMRIG_DESCRIPTOR,
            MinerKind::CpuminerOpt => &CPUMINER_OPT_DESCRIPTOR,
        }
    }

    /// Platform/arch tuple used in artifact names and checksum lookups.
    pub fn platform() -> &'static str {
        match (std::env::consts::OS, std::env::consts::ARCH) {
            ("linux", "x86_64") => "linux-x64",
            ("linux", "aarch64") => "linux-arm64",
            ("macos", "x86_64") => "macos-x64",
            ("macos", "aarch64") => "macos-arm64",
            ("windows", _) => "windows-x64",
            _ => "unknown",
        }
    }

    pub fn resolved_url(&self) -> String {
        self.download_url
            .replace("{version}", self.version)
            .replace("{platform}", Self::platform())
    }

    pub fn pinned_checksum(&self) -> Option<&'static str> {
        let platform = Self::platform();
        self.checksums
            .iter()
            .find(|(p, _)| *p == platform)
            .map(|(_, sum)| *sum)
    }
}
