//! Local miner endpoints.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::Json;
use minefleet_core::{AvailableMiner, CoreError, HashratePoint, MinerManager, MinerSummary};
use minefleet_miner_adapters::{MinerKind, PerformanceSample};
use serde::Deserialize;

fn parse_kind(name: &str) -> Result<MinerKind, ApiError> {
    name.parse::<MinerKind>()
        .map_err(|_| CoreError::InvalidArgument(format!("unknown miner kind: {name}")).into())
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<MinerSummary>> {
    Json(state.manager.list_miners().await)
}

pub async fn available() -> Json<Vec<AvailableMiner>> {
    Json(MinerManager::available_miners())
}

pub async fn stop(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.manager.stop_miner(&name).await?;
    Ok(Json(serde_json::json!({ "message": format!("{name} stopped") })))
}

pub async fn stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<PerformanceSample>> {
    Ok(Json(state.manager.get_stats(&name).await?))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_log_limit")]
    pub limit: usize,
}

fn default_log_limit() -> usize {
    100
}

pub async fn logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.manager.get_logs(&name, query.limit).await?))
}

#[derive(Debug, Deserialize)]
pub struct StdinBody {
    pub data: String,
}

pub async fn stdin(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<StdinBody>,
) -> ApiResult<Json<serde_json::Value>> {
    state.manager.write_stdin(&name, body.data.as_bytes()).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

pub async fn hashrate_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<HashratePoint>>> {
    Ok(Json(state.manager.get_hashrate_history(&name).await?))
}

pub async fn install(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let kind = parse_kind(&name)?;
    state.manager.install_miner(kind).await?;
    Ok(Json(serde_json::json!({ "message": format!("{kind} installed") })))
}

pub async fn uninstall(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let kind = parse_kind(&name)?;
    state.manager.uninstall_miner(kind).await?;
    Ok(Json(serde_json::json!({ "message": format!("{kind} uninstalled") })))
}
