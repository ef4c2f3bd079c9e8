//! Fleet control endpoints projected onto peers.

use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::Json;
use minefleet_overlay::{FleetHashrate, PeerStatsEntry, StartMinerPayload, StatsPayload};
use serde::Deserialize;

async fn local_hashrate(state: &AppState) -> f64 {
    state
        .manager
        .list_miners()
        .await
        .iter()
        .filter_map(|m| m.stats.as_ref())
        .filter(|s| !s.stale)
        .map(|s| s.hashrate)
        .sum()
}

pub async fn all_stats(State(state): State<AppState>) -> ApiResult<Json<Vec<PeerStatsEntry>>> {
    let overlay = state.overlay().await?;
    Ok(Json(overlay.remote.all_stats().await))
}

pub async fn total_hashrate(State(state): State<AppState>) -> ApiResult<Json<FleetHashrate>> {
    let overlay = state.overlay().await?;
    let local = local_hashrate(&state).await;
    Ok(Json(overlay.remote.total_hashrate(local).await))
}

pub async fn peer_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatsPayload>> {
    let overlay = state.overlay().await?;
    Ok(Json(overlay.remote.get_stats(&id).await?))
}

pub async fn start(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StartMinerPayload>,
) -> ApiResult<Json<serde_json::Value>> {
    let overlay = state.overlay().await?;
    let name = overlay.remote.start_miner(&id, body).await?;
    Ok(Json(serde_json::json!({ "minerName": name })))
}

#[derive(Debug, Deserialize)]
pub struct StopBody {
    pub name: String,
}

pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StopBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let overlay = state.overlay().await?;
    overlay.remote.stop_miner(&id, &body.name).await?;
    Ok(Json(serde_json::json!({ "message": format!("{} stopped", body.name) })))
}

#[derive(Debug, Deserialize)]
pub struct RemoteLogsQuery {
    pub limit: Option<usize>,
}

pub async fn logs(
    State(state): State<AppState>,
    Path((id, miner)): Path<(String, String)>,
    Query(query): Query<RemoteLogsQuery>,
) -> ApiResult<Json<Vec<String>>> {
    let overlay = state.overlay().await?;
    Ok(Json(overlay.remote.get_logs(&id, &miner, query.limit).await?))
}
