//! Profile CRUD and profile-driven starts.

use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::Json;
use minefleet_core::Profile;
use minefleet_miner_adapters::MinerConfig;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ProfileBody {
    pub name: String,
    pub config: MinerConfig,
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<Profile>> {
    Json(state.profiles.list())
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<ProfileBody>,
) -> ApiResult<Json<Profile>> {
    Ok(Json(state.profiles.create(body.name, body.config)?))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Profile>> {
    Ok(Json(state.profiles.get(&id)?))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ProfileBody>,
) -> ApiResult<Json<Profile>> {
    Ok(Json(state.profiles.update(&id, body.name, body.config)?))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.profiles.delete(&id)?;
    Ok(Json(serde_json::json!({ "message": format!("profile {id} deleted") })))
}

pub async fn start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let profile = state.profiles.get(&id)?;
    let name = state
        .manager
        .start_miner(profile.kind, profile.config)
        .await?;
    Ok(Json(serde_json::json!({ "minerName": name })))
}
