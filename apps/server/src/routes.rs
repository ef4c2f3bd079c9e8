//! HTTP route table. The facade validates arguments and serializes
//! results; policy lives in the manager and router.

use crate::state::AppState;
use crate::{history, info, miners, node, profiles, remote};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState, namespace: &str) -> Router {
    let api = Router::new()
        .route("/info", get(info::system_info))
        .route("/miners", get(miners::list))
        .route("/miners/available", get(miners::available))
        .route("/miners/:name", delete(miners::stop))
        .route("/miners/:name/stats", get(miners::stats))
        .route("/miners/:name/logs", get(miners::logs))
        .route("/miners/:name/stdin", post(miners::stdin))
        .route("/miners/:name/hashrate-history", get(miners::hashrate_history))
        .route("/miners/:name/install", post(miners::install))
        .route("/miners/:name/uninstall", delete(miners::uninstall))
        .route("/profiles", get(profiles::list).post(profiles::create))
        .route(
            "/profiles/:id",
            get(profiles::get).put(profiles::update).delete(profiles::delete),
        )
        .route("/profiles/:id/start", post(profiles::start))
        .route("/history/miners", get(history::miners))
        .route("/history/miners/:name", get(history::summary))
        .route("/history/miners/:name/hashrate", get(history::hashrate))
        .route("/node/info", get(node::info))
        .route("/node/init", post(node::init))
        .route("/peers", get(node::list_peers).post(node::add_peer))
        .route("/peers/:id", get(node::get_peer).delete(node::remove_peer))
        .route("/peers/:id/ping", post(node::ping_peer))
        .route("/remote/stats", get(remote::all_stats))
        .route("/remote/hashrate", get(remote::total_hashrate))
        .route("/remote/:id/stats", get(remote::peer_stats))
        .route("/remote/:id/start", post(remote::start))
        .route("/remote/:id/stop", post(remote::stop))
        .route("/remote/:id/logs/:miner", get(remote::logs))
        .with_state(state);

    Router::new()
        .nest(namespace, api)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::OverlayState;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use minefleet_core::{
        HistoryStore, IdentityStore, ManagerConfig, MinerManager, ProfileStore, SettingsStore,
    };
    use minefleet_overlay::{PeerRegistry, WeightedRanker};
    use minefleet_miner_adapters::FakeAdapter;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    const NS: &str = "/api/v1/mining";

    fn test_state(dir: &tempfile::TempDir) -> AppState {
        let manager = Arc::new(MinerManager::new(
            Arc::new(|kind| Box::new(FakeAdapter::new(kind))),
            None,
            ManagerConfig {
                poll_period: Duration::from_millis(50),
                stats_timeout: Duration::from_millis(500),
                readiness_grace: Duration::from_millis(50),
                exited_retention: Duration::from_millis(100),
            },
        ));
        // Ephemeral overlay port so node-init tests can bind a listener.
        std::fs::write(
            dir.path().join("miners.json"),
            serde_json::json!({"node": {"listenAddr": "127.0.0.1:0"}}).to_string(),
        )
        .unwrap();
        AppState {
            manager,
            profiles: Arc::new(ProfileStore::load(dir.path().join("mining_profiles.json"))),
            settings: Arc::new(SettingsStore::load(dir.path().join("miners.json"))),
            history: Some(Arc::new(
                HistoryStore::open(&dir.path().join("mining.db"), 30).unwrap(),
            )),
            identity_store: Arc::new(IdentityStore::new(
                dir.path().join("node.json"),
                dir.path().join("node").join("private.key"),
            )),
            registry: Arc::new(PeerRegistry::load(
                dir.path().join("peers.json"),
                Box::new(WeightedRanker::default()),
            )),
            overlay: Arc::new(RwLock::new(None::<OverlayState>)),
        }
    }

    fn get_req(path: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("{NS}{path}"))
            .body(Body::empty())
            .unwrap()
    }

    fn json_req(method: Method, path: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(format!("{NS}{path}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn miners_list_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir), NS);

        let response = app.oneshot(get_req("/miners")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn profile_lifecycle_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = build_router(state.clone(), NS);

        let create = json_req(
            Method::POST,
            "/profiles",
            serde_json::json!({
                "name": "rig-a",
                "config": {
                    "kind": "xmrig",
                    "pool": "pool.example:3333",
                    "worker": "w1"
                }
            }),
        );
        let response = app.clone().oneshot(create).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let profile = body_json(response).await;
        let id = profile["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(json_req(
                Method::POST,
                &format!("/profiles/{id}/start"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let started = body_json(response).await;
        assert_eq!(started["minerName"], "xmrig-001");

        let response = app.clone().oneshot(get_req("/miners")).await.unwrap();
        let miners = body_json(response).await;
        assert_eq!(miners.as_array().unwrap().len(), 1);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri(format!("{NS}/miners/xmrig-001"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get_req("/miners/xmrig-001/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let error = body_json(response).await;
        assert_eq!(error["code"], "not_found");
    }

    #[tokio::test]
    async fn duplicate_start_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = build_router(state, NS);

        let profile_body = serde_json::json!({
            "name": "rig-a",
            "config": {"kind": "xmrig", "pool": "pool.example:3333", "worker": "w1"}
        });
        let response = app
            .clone()
            .oneshot(json_req(Method::POST, "/profiles", profile_body))
            .await
            .unwrap();
        let id = body_json(response).await["id"].as_str().unwrap().to_string();

        let start_path = format!("/profiles/{id}/start");
        let first = app
            .clone()
            .oneshot(json_req(Method::POST, &start_path, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(json_req(Method::POST, &start_path, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let error = body_json(second).await;
        assert_eq!(error["code"], "resource_busy");
    }

    #[tokio::test]
    async fn available_miners_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir), NS);

        let response = app.clone().oneshot(get_req("/miners/available")).await.unwrap();
        let available = body_json(response).await;
        assert!(available
            .as_array()
            .unwrap()
            .iter()
            .any(|m| m["name"] == "xmrig"));

        let response = app.oneshot(get_req("/info")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let info = body_json(response).await;
        assert!(info["cores"].as_u64().unwrap() >= 1);
        assert!(info["installedMinersInfo"].is_array());
    }

    #[tokio::test]
    async fn node_init_then_info() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = build_router(state.clone(), NS);

        let response = app.clone().oneshot(get_req("/node/info")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(json_req(
                Method::POST,
                "/node/init",
                serde_json::json!({"name": "rig-a", "role": "dual"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let identity = body_json(response).await;
        assert_eq!(identity["name"], "rig-a");
        assert_eq!(identity["id"].as_str().unwrap().len(), 16);

        let response = app.oneshot(get_req("/node/info")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn peer_registry_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir), NS);

        let response = app
            .clone()
            .oneshot(json_req(
                Method::POST,
                "/peers",
                serde_json::json!({"name": "rig-b", "address": "10.0.0.2:9091"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let peer = body_json(response).await;
        let id = peer["id"].as_str().unwrap().to_string();

        let response = app.clone().oneshot(get_req("/peers")).await.unwrap();
        let peers = body_json(response).await;
        assert_eq!(peers.as_array().unwrap().len(), 1);

        // Ping without an initialized node is a conflict, not a crash.
        let response = app
            .clone()
            .oneshot(json_req(
                Method::POST,
                &format!("/peers/{id}/ping"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri(format!("{NS}/peers/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn history_range_queries() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let store = state.history.clone().unwrap();
        store.insert("xmrig-001", 1_700_000_000, 1000.0).unwrap();
        store.insert("xmrig-001", 1_700_000_060, 1100.0).unwrap();
        let app = build_router(state, NS);

        let response = app.clone().oneshot(get_req("/history/miners")).await.unwrap();
        assert_eq!(
            body_json(response).await,
            serde_json::json!(["xmrig-001"])
        );

        let response = app
            .clone()
            .oneshot(get_req(
                "/history/miners/xmrig-001/hashrate?since=2023-11-14T00:00:00Z&until=2023-11-16T00:00:00Z",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let points = body_json(response).await;
        assert_eq!(points.as_array().unwrap().len(), 2);

        // Inverted range: empty array, not an error.
        let response = app
            .clone()
            .oneshot(get_req(
                "/history/miners/xmrig-001/hashrate?since=2023-11-16T00:00:00Z&until=2023-11-14T00:00:00Z",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!([]));

        let response = app
            .clone()
            .oneshot(get_req("/history/miners/xmrig-001"))
            .await
            .unwrap();
        let summary = body_json(response).await;
        assert_eq!(summary["count"], 2);

        // Malformed timestamps are a validation error.
        let response = app
            .oneshot(get_req("/history/miners/xmrig-001/hashrate?since=yesterday"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn remote_endpoints_require_identity() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir), NS);

        let response = app.oneshot(get_req("/remote/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let error = body_json(response).await;
        assert_eq!(error["code"], "precondition_failed");
    }
}
