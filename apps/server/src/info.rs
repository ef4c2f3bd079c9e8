//! System + installed-miner summary.

use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use minefleet_core::{system_summary, InstalledMinerInfo, SystemSummary};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    #[serde(flatten)]
    pub system: SystemSummary,
    pub installed_miners_info: Vec<InstalledMinerInfo>,
}

pub async fn system_info(State(state): State<AppState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        system: system_summary(),
        installed_miners_info: state.manager.installed_miners().await,
    })
}
