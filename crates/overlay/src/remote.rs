//! Remote controller: projects local manager operations onto peers and
//! aggregates fleet views.

use crate::{
    DeployAckPayload, DeployPayload, Envelope, GetLogsPayload, LogsPayload, MessageRouter,
    MessageType, OverlayError, PeerRegistry, Result, StartMinerPayload, StatsPayload,
    StopMinerPayload,
};
use minefleet_core::Profile;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Per-peer deadline inside fleet-wide fan-outs.
const AGGREGATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatsEntry {
    pub peer_id: String,
    pub peer_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetHashrate {
    pub local: f64,
    pub peers: Vec<PeerHashrateEntry>,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerHashrateEntry {
    pub peer_id: String,
    pub hashrate: f64,
}

pub struct RemoteController {
    router: Arc<MessageRouter>,
    registry: Arc<PeerRegistry>,
}

impl RemoteController {
    pub fn new(router: Arc<MessageRouter>, registry: Arc<PeerRegistry>) -> Self {
        Self { router, registry }
    }

    fn parse_reply<T: serde::de::DeserializeOwned>(reply: Envelope) -> Result<T> {
        serde_json::from_value(reply.payload)
            .map_err(|e| OverlayError::Internal(format!("malformed reply payload: {e}")))
    }

    pub async fn get_stats(&self, peer_id: &str) -> Result<StatsPayload> {
        let reply = self
            .router
            .request(peer_id, MessageType::GetStats, serde_json::json!({}))
            .await?;
        Self::parse_reply(reply)
    }

    /// Start a miner on a peer, by profile id or inline configuration.
    /// Returns the new instance name.
    pub async fn start_miner(&self, peer_id: &str, request: StartMinerPayload) -> Result<String> {
        let reply = self
            .router
            .request(
                peer_id,
                MessageType::StartMiner,
                serde_json::to_value(request)?,
            )
            .await?;
        let ack: crate::AckPayload = Self::parse_reply(reply)?;
        ack.miner_name
            .ok_or_else(|| OverlayError::Internal("ack carried no miner name".to_string()))
    }

    pub async fn stop_miner(&self, peer_id: &str, miner: &str) -> Result<()> {
        self.router
            .request(
                peer_id,
                MessageType::StopMiner,
                serde_json::to_value(StopMinerPayload {
                    name: miner.to_string(),
                })?,
            )
            .await?;
        Ok(())
    }

    pub async fn get_logs(
        &self,
        peer_id: &str,
        miner: &str,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        let reply = self
            .router
            .request(
                peer_id,
                MessageType::GetLogs,
                serde_json::to_value(GetLogsPayload {
                    miner: miner.to_string(),
                    limit,
                })?,
            )
            .await?;
        let logs: LogsPayload = Self::parse_reply(reply)?;
        Ok(logs.lines)
    }

    pub async fn ping(&self, peer_id: &str) -> Result<u64> {
        self.router.ping(peer_id).await
    }

    /// Transfer a configuration bundle; returns how many profiles the
    /// worker accepted.
    pub async fn deploy(&self, peer_id: &str, profiles: Vec<Profile>) -> Result<usize> {
        let reply = self
            .router
            .request(
                peer_id,
                MessageType::Deploy,
                serde_json::to_value(DeployPayload { profiles })?,
            )
            .await?;
        let ack: DeployAckPayload = Self::parse_reply(reply)?;
        Ok(ack.accepted)
    }

    /// Fan out to every known peer in parallel. Unreachable peers are
    /// reported as failed entries, never as an overall error.
    pub async fn all_stats(&self) -> Vec<PeerStatsEntry> {
        let peers = self.registry.list();
        let fetches = peers.into_iter().map(|peer| async move {
            let result =
                tokio::time::timeout(AGGREGATE_TIMEOUT, self.get_stats(&peer.id)).await;
            match result {
                Ok(Ok(stats)) => PeerStatsEntry {
                    peer_id: peer.id,
                    peer_name: peer.name,
                    stats: Some(stats),
                    error: None,
                },
                Ok(Err(e)) => {
                    debug!("Stats from {} failed: {}", peer.id, e);
                    PeerStatsEntry {
                        peer_id: peer.id,
                        peer_name: peer.name,
                        stats: None,
                        error: Some(e.to_string()),
                    }
                }
                Err(_) => PeerStatsEntry {
                    peer_id: peer.id,
                    peer_name: peer.name,
                    stats: None,
                    error: Some("deadline exceeded".to_string()),
                },
            }
        });
        futures::future::join_all(fetches).await
    }

    /// Fleet-wide hashrate: the local total plus every reachable peer's.
    pub async fn total_hashrate(&self, local: f64) -> FleetHashrate {
        let entries = self.all_stats().await;
        let peers: Vec<PeerHashrateEntry> = entries
            .into_iter()
            .filter_map(|entry| {
                entry.stats.map(|s| PeerHashrateEntry {
                    peer_id: entry.peer_id,
                    hashrate: s.total_hashrate,
                })
            })
            .collect();
        let total = local + peers.iter().map(|p| p.hashrate).sum::<f64>();
        FleetHashrate {
            local,
            peers,
            total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WeightedRanker;
    use minefleet_core::{
        node_id_from_public_key, ManagerConfig, MinerManager, NodeIdentity, NodeRole,
        ProfileStore,
    };
    use minefleet_miner_adapters::{FakeAdapter, MinerConfig, MinerKind};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::time::Duration;

    struct TestNode {
        identity: NodeIdentity,
        router: Arc<MessageRouter>,
        registry: Arc<PeerRegistry>,
        manager: Arc<MinerManager>,
        profiles: Arc<ProfileStore>,
        _dir: tempfile::TempDir,
    }

    fn make_identity(name: &str) -> (NodeIdentity, SigningKey) {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying = signing_key.verifying_key();
        (
            NodeIdentity {
                id: node_id_from_public_key(verifying.as_bytes()),
                name: name.to_string(),
                public_key: hex::encode(verifying.as_bytes()),
                created_at: 0,
                role: NodeRole::Dual,
            },
            signing_key,
        )
    }

    fn make_node(name: &str) -> TestNode {
        let dir = tempfile::tempdir().unwrap();
        let (identity, signing_key) = make_identity(name);
        let registry = Arc::new(PeerRegistry::load(
            dir.path().join("peers.json"),
            Box::new(WeightedRanker::default()),
        ));
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
        let profiles = Arc::new(ProfileStore::load(dir.path().join("mining_profiles.json")));
        let router = MessageRouter::new(
            identity.clone(),
            signing_key,
            Arc::clone(&registry),
            Arc::clone(&manager),
            Arc::clone(&profiles),
            Duration::from_secs(5),
        );
        TestNode {
            identity,
            router,
            registry,
            manager,
            profiles,
            _dir: dir,
        }
    }

    fn miner_config(worker: &str) -> MinerConfig {
        MinerConfig {
            kind: MinerKind::Xmrig,
            pool: "pool.example:3333".to_string(),
            worker: worker.to_string(),
            password: "x".to_string(),
            tls: false,
            threads: 1,
            extra_args: String::new(),
            algorithm: None,
            devices: Vec::new(),
        }
    }

    /// Controller and worker wired through a real TCP listener, with the
    /// controller registered on the worker (authorized) and vice versa.
    async fn linked_pair() -> (TestNode, TestNode, RemoteController) {
        let controller = make_node("controller");
        let worker = make_node("worker");

        let (addr, _listener) =
            MessageRouter::spawn_listener(Arc::clone(&worker.router), "127.0.0.1:0")
                .await
                .unwrap();

        worker
            .registry
            .add(
                "controller",
                "0.0.0.0:0",
                Some(&controller.identity.public_key),
                NodeRole::Controller,
            )
            .unwrap();
        controller
            .registry
            .add(
                "worker",
                &addr.to_string(),
                Some(&worker.identity.public_key),
                NodeRole::Worker,
            )
            .unwrap();

        let remote = RemoteController::new(
            Arc::clone(&controller.router),
            Arc::clone(&controller.registry),
        );
        (controller, worker, remote)
    }

    #[tokio::test]
    async fn remote_stats_round_trip() {
        let (_controller, worker, remote) = linked_pair().await;

        worker
            .manager
            .start_miner(MinerKind::Xmrig, miner_config("w1"))
            .await
            .unwrap();
        worker.manager.poll_once().await;

        let stats = remote.get_stats(&worker.identity.id).await.unwrap();
        assert_eq!(stats.miners.len(), 1);
        assert_eq!(stats.total_hashrate, 1234.0);
    }

    #[tokio::test]
    async fn remote_start_and_stop_by_profile() {
        let (_controller, worker, remote) = linked_pair().await;

        let profile = worker
            .profiles
            .create("rig-profile".to_string(), miner_config("w1"))
            .unwrap();

        let name = remote
            .start_miner(
                &worker.identity.id,
                StartMinerPayload {
                    profile_id: Some(profile.id),
                    kind: None,
                    config: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(name, "xmrig-001");
        assert_eq!(worker.manager.list_miners().await.len(), 1);

        remote.stop_miner(&worker.identity.id, &name).await.unwrap();
        assert!(worker.manager.list_miners().await.is_empty());
    }

    #[tokio::test]
    async fn remote_errors_carry_kind() {
        let (_controller, worker, remote) = linked_pair().await;

        let err = remote
            .stop_miner(&worker.identity.id, "xmrig-999")
            .await
            .unwrap_err();
        match err {
            OverlayError::Remote(core) => {
                assert!(matches!(core, minefleet_core::CoreError::NotFound(_)))
            }
            other => panic!("expected remote NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_sender_is_rejected() {
        let controller = make_node("controller");
        let worker = make_node("worker");

        let (addr, _listener) =
            MessageRouter::spawn_listener(Arc::clone(&worker.router), "127.0.0.1:0")
                .await
                .unwrap();

        // Worker does NOT register the controller.
        controller
            .registry
            .add(
                "worker",
                &addr.to_string(),
                Some(&worker.identity.public_key),
                NodeRole::Worker,
            )
            .unwrap();
        let remote = RemoteController::new(
            Arc::clone(&controller.router),
            Arc::clone(&controller.registry),
        );

        let err = remote.get_stats(&worker.identity.id).await.unwrap_err();
        match err {
            OverlayError::Remote(core) => assert!(matches!(
                core,
                minefleet_core::CoreError::IntegrityViolation(_)
            )),
            other => panic!("expected integrity violation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_updates_metrics_and_last_seen() {
        let (controller, worker, remote) = linked_pair().await;

        let rtt = remote.ping(&worker.identity.id).await.unwrap();
        // RTT on loopback can legitimately round to zero milliseconds.
        assert!(rtt < 5_000);

        let peer = controller.registry.get(&worker.identity.id).unwrap();
        assert!(peer.last_seen > 0);
    }

    #[tokio::test]
    async fn deploy_transfers_profiles() {
        let (controller, worker, remote) = linked_pair().await;

        let profile = controller
            .profiles
            .create("shared".to_string(), miner_config("w9"))
            .unwrap();

        let accepted = remote
            .deploy(&worker.identity.id, vec![profile.clone()])
            .await
            .unwrap();
        assert_eq!(accepted, 1);
        assert_eq!(worker.profiles.get(&profile.id).unwrap().name, "shared");
    }

    #[tokio::test]
    async fn aggregates_report_unreachable_peers_as_entries() {
        let (controller, worker, remote) = linked_pair().await;

        // A peer that will never answer.
        controller
            .registry
            .add("ghost", "127.0.0.1:1", None, NodeRole::Worker)
            .unwrap();

        worker
            .manager
            .start_miner(MinerKind::Xmrig, miner_config("w1"))
            .await
            .unwrap();
        worker.manager.poll_once().await;

        let entries = remote.all_stats().await;
        assert_eq!(entries.len(), 2);
        let ok: Vec<_> = entries.iter().filter(|e| e.stats.is_some()).collect();
        let failed: Vec<_> = entries.iter().filter(|e| e.error.is_some()).collect();
        assert_eq!(ok.len(), 1);
        assert_eq!(failed.len(), 1);

        let fleet = remote.total_hashrate(100.0).await;
        assert_eq!(fleet.local, 100.0);
        assert_eq!(fleet.total, 100.0 + 1234.0);
    }

    #[tokio::test]
    async fn provisional_peer_is_pinned_on_first_contact() {
        let controller = make_node("controller");
        let worker = make_node("worker");

        let (addr, _listener) =
            MessageRouter::spawn_listener(Arc::clone(&worker.router), "127.0.0.1:0")
                .await
                .unwrap();

        worker
            .registry
            .add(
                "controller",
                "0.0.0.0:0",
                Some(&controller.identity.public_key),
                NodeRole::Controller,
            )
            .unwrap();
        // Added without a public key: provisional id.
        let provisional = controller
            .registry
            .add("worker", &addr.to_string(), None, NodeRole::Worker)
            .unwrap();
        assert_ne!(provisional.id, worker.identity.id);

        let remote = RemoteController::new(
            Arc::clone(&controller.router),
            Arc::clone(&controller.registry),
        );
        remote.ping(&provisional.id).await.unwrap();

        // The record now carries the worker's real node id and key.
        let pinned = controller.registry.get(&worker.identity.id).unwrap();
        assert_eq!(
            pinned.public_key.as_deref(),
            Some(worker.identity.public_key.as_str())
        );
        assert!(controller.registry.get(&provisional.id).is_err());
    }
}
