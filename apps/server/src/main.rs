//! minefleetd: multi-miner management service.
//!
//! Owns external miner child processes, persists hashrate telemetry, and
//! federates control across nodes over an authenticated peer overlay.

mod error;
mod history;
mod info;
mod miners;
mod node;
mod profiles;
mod remote;
mod routes;
mod state;

use minefleet_core::{
    history_db_path, node_identity_path, peers_path, private_key_path, profiles_path,
    settings_path, HistoryStore, IdentityStore, MinerManager, ProfileStore, SettingsStore,
};
use minefleet_overlay::{PeerRegistry, WeightedRanker};
use state::AppState;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!("Startup failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let settings_store = Arc::new(SettingsStore::load(settings_path()));
    let settings = settings_store.get();

    let (history, history_writer, writer_task) = if settings.database.enabled {
        let store = Arc::new(HistoryStore::open(
            &history_db_path(),
            settings.database.retention_days,
        )?);
        // Retention purge runs at startup (first interval tick) and
        // every 24 hours thereafter.
        Arc::clone(&store).spawn_purge_task();
        let (writer, task) = Arc::clone(&store).spawn_writer();
        (Some(store), Some(writer), Some(task))
    } else {
        info!("History database disabled");
        (None, None, None)
    };

    let manager = Arc::new(MinerManager::with_defaults(history_writer));
    let profiles = Arc::new(ProfileStore::load(profiles_path()));
    let registry = Arc::new(PeerRegistry::load(
        peers_path(),
        Box::new(WeightedRanker::new(settings.node.ranking)),
    ));
    let identity_store = Arc::new(IdentityStore::new(node_identity_path(), private_key_path()));

    let app_state = AppState {
        manager: Arc::clone(&manager),
        profiles,
        settings: Arc::clone(&settings_store),
        history: history.clone(),
        identity_store: Arc::clone(&identity_store),
        registry,
        overlay: Arc::new(RwLock::new(None)),
    };

    match identity_store.load() {
        Ok(Some((identity, signing_key))) => {
            info!("Node identity {} ({})", identity.id, identity.name);
            app_state.start_overlay(identity, signing_key).await?;
        }
        Ok(None) => info!("Node identity not initialized; overlay offline"),
        Err(e) => return Err(format!("loading node identity: {e}").into()),
    }

    manager.autostart(&settings).await;
    Arc::clone(&manager).spawn_poller();

    let app = routes::build_router(app_state, &settings.node.api_namespace);
    let listener = tokio::net::TcpListener::bind(&settings.node.http_addr).await?;
    info!(
        "Control surface on http://{}{}",
        settings.node.http_addr, settings.node.api_namespace
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    manager.shutdown().await;
    if let Some(task) = writer_task {
        if let Err(e) = task.await {
            warn!("History writer task ended abnormally: {}", e);
        }
    }
    if let Some(store) = &history {
        let _ = store.flush();
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
