//! Low-resolution history queries with ISO-8601 range parameters.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::DateTime;
use minefleet_core::{CoreError, HashratePoint, HistoryStore, HistorySummary};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub since: Option<String>,
    pub until: Option<String>,
}

fn store(state: &AppState) -> Result<Arc<HistoryStore>, ApiError> {
    state
        .history
        .clone()
        .ok_or_else(|| CoreError::PreconditionFailed("history database disabled".to_string()).into())
}

fn parse_time(value: Option<&str>, default: u64) -> Result<u64, ApiError> {
    match value {
        None => Ok(default),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.timestamp().max(0) as u64)
            .map_err(|e| {
                ApiError(CoreError::InvalidArgument(format!(
                    "bad timestamp {raw:?}: {e}"
                )))
            }),
    }
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub async fn miners(State(state): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(store(&state)?.miner_names()?))
}

pub async fn summary(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Json<HistorySummary>> {
    let since = parse_time(query.since.as_deref(), 0)?;
    Ok(Json(store(&state)?.summary(&name, since)?))
}

pub async fn hashrate(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Json<Vec<HashratePoint>>> {
    let since = parse_time(query.since.as_deref(), 0)?;
    let until = parse_time(query.until.as_deref(), now())?;
    Ok(Json(store(&state)?.range_by_miner(&name, since, until)?))
}
