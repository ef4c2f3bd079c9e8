//! Node identity and peer registry endpoints.

use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::Json;
use minefleet_core::{CoreError, NodeIdentity, NodeRole};
use minefleet_overlay::Peer;
use serde::Deserialize;

pub async fn info(State(state): State<AppState>) -> ApiResult<Json<NodeIdentity>> {
    match state.identity_store.load()? {
        Some((identity, _)) => Ok(Json(identity)),
        None => Err(CoreError::NotFound("node not initialized".to_string()).into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct InitBody {
    pub name: String,
    #[serde(default)]
    pub role: Option<NodeRole>,
}

pub async fn init(
    State(state): State<AppState>,
    Json(body): Json<InitBody>,
) -> ApiResult<Json<NodeIdentity>> {
    let (identity, signing_key) = state
        .identity_store
        .init(&body.name, body.role.unwrap_or_default())?;
    state.start_overlay(identity.clone(), signing_key).await?;
    Ok(Json(identity))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPeerBody {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub role: Option<NodeRole>,
}

pub async fn list_peers(State(state): State<AppState>) -> Json<Vec<Peer>> {
    Json(state.registry.list())
}

pub async fn add_peer(
    State(state): State<AppState>,
    Json(body): Json<AddPeerBody>,
) -> ApiResult<Json<Peer>> {
    let peer = state.registry.add(
        &body.name,
        &body.address,
        body.public_key.as_deref(),
        body.role.unwrap_or(NodeRole::Worker),
    )?;
    Ok(Json(peer))
}

pub async fn get_peer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Peer>> {
    Ok(Json(state.registry.get(&id)?))
}

pub async fn remove_peer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.registry.remove(&id)?;
    Ok(Json(serde_json::json!({ "message": format!("peer {id} removed") })))
}

pub async fn ping_peer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let overlay = state.overlay().await?;
    let ping_ms = overlay.remote.ping(&id).await?;
    Ok(Json(serde_json::json!({ "pingMs": ping_ms })))
}
