//! Shared facade state: handles to the manager, stores, and (once the
//! node identity exists) the overlay.

use minefleet_core::{
    CoreError, HistoryStore, IdentityStore, MinerManager, NodeIdentity, ProfileStore,
    SettingsStore, SigningKey,
};
use minefleet_overlay::{MessageRouter, PeerRegistry, RemoteController};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct OverlayState {
    pub identity: NodeIdentity,
    pub router: Arc<MessageRouter>,
    pub remote: Arc<RemoteController>,
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<MinerManager>,
    pub profiles: Arc<ProfileStore>,
    pub settings: Arc<SettingsStore>,
    pub history: Option<Arc<HistoryStore>>,
    pub identity_store: Arc<IdentityStore>,
    pub registry: Arc<PeerRegistry>,
    pub overlay: Arc<RwLock<Option<OverlayState>>>,
}

impl AppState {
    /// The overlay handle, or `PreconditionFailed` when the node has no
    /// identity yet.
    pub async fn overlay(&self) -> Result<OverlayState, CoreError> {
        self.overlay
            .read()
            .await
            .clone()
            .ok_or_else(|| CoreError::PreconditionFailed("node not initialized".to_string()))
    }

    /// Bring up the overlay listener, keepalive, and remote controller
    /// for an initialized identity.
    pub async fn start_overlay(
        &self,
        identity: NodeIdentity,
        signing_key: SigningKey,
    ) -> Result<OverlayState, CoreError> {
        let settings = self.settings.get();
        let router = MessageRouter::new(
            identity.clone(),
            signing_key,
            Arc::clone(&self.registry),
            Arc::clone(&self.manager),
            Arc::clone(&self.profiles),
            Duration::from_secs(settings.node.request_timeout_secs),
        );
        MessageRouter::spawn_listener(Arc::clone(&router), &settings.node.listen_addr)
            .await
            .map_err(CoreError::from)?;
        MessageRouter::spawn_keepalive(Arc::clone(&router));

        let remote = Arc::new(RemoteController::new(
            Arc::clone(&router),
            Arc::clone(&self.registry),
        ));
        let overlay = OverlayState {
            identity,
            router,
            remote,
        };
        *self.overlay.write().await = Some(overlay.clone());
        Ok(overlay)
    }
}
