//! Host summary for the `/info` surface.

use serde::{Deserialize, Serialize};
use sysinfo::System;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSummary {
    pub platform: String,
    pub cpu: String,
    pub cores: usize,
    pub memory_gb: f64,
}

pub fn system_summary() -> SystemSummary {
    let mut sys = System::new();
    sys.refresh_cpu();
    sys.refresh_memory();

    let platform = format!(
        "{} {}",
        System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
        System::os_version().unwrap_or_default()
    )
    .trim()
    .to_string();

    let cpu = sys
        .cpus()
        .first()
        .map(|c| c.brand().to_string())
        .unwrap_or_else(|| std::env::consts::ARCH.to_string());

    SystemSummary {
        platform,
        cpu,
        cores: num_cpus::get(),
        memory_gb: (sys.total_memory() as f64 / 1_000_000_000.0 * 10.0).round() / 10.0,
    }
}
