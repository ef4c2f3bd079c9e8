//! Persisted configuration: mining profiles, autostart entries, retention
//! policy, and node settings. Every rewrite goes through write-temp-then-
//! rename so a crash never leaves a torn file behind.

use crate::{CoreError, Result};
use minefleet_miner_adapters::{MinerConfig, MinerKind};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// Persisted named configuration used to start instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub kind: MinerKind,
    pub config: MinerConfig,
}

impl Profile {
    fn validate(kind: MinerKind, config: &MinerConfig) -> Result<()> {
        if kind != config.kind {
            return Err(CoreError::PreconditionFailed(format!(
                "profile kind {} does not match configuration kind {}",
                kind, config.kind
            )));
        }
        Ok(())
    }
}

/// Atomically persist a JSON value: write a sibling temp file, then rename
/// over the target.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to parse {:?}: {}", path, e);
                T::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", path, e);
            T::default()
        }
    }
}

/// CRUD store over `mining_profiles.json`.
pub struct ProfileStore {
    path: PathBuf,
    profiles: RwLock<Vec<Profile>>,
}

impl ProfileStore {
    pub fn load(path: PathBuf) -> Self {
        let profiles: Vec<Profile> = load_json_or_default(&path);
        Self {
            path,
            profiles: RwLock::new(profiles),
        }
    }

    pub fn list(&self) -> Vec<Profile> {
        self.profiles.read().clone()
    }

    pub fn get(&self, id: &str) -> Result<Profile> {
        self.profiles
            .read()
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("profile {id}")))
    }

    pub fn create(&self, name: String, config: MinerConfig) -> Result<Profile> {
        let profile = Profile {
            id: Uuid::new_v4().to_string(),
            name,
            kind: config.kind,
            config,
        };
        let mut profiles = self.profiles.write();
        profiles.push(profile.clone());
        atomic_write_json(&self.path, &*profiles)?;
        Ok(profile)
    }

    pub fn update(&self, id: &str, name: String, config: MinerConfig) -> Result<Profile> {
        let mut profiles = self.profiles.write();
        let existing = profiles
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("profile {id}")))?;
        Profile::validate(existing.kind, &config)?;
        existing.name = name;
        existing.config = config;
        let updated = existing.clone();
        atomic_write_json(&self.path, &*profiles)?;
        Ok(updated)
    }

    /// Insert or replace a profile carrying its own id; used when a
    /// controller deploys a configuration bundle.
    pub fn upsert(&self, profile: Profile) -> Result<()> {
        Profile::validate(profile.kind, &profile.config)?;
        let mut profiles = self.profiles.write();
        match profiles.iter_mut().find(|p| p.id == profile.id) {
            Some(existing) => *existing = profile,
            None => profiles.push(profile),
        }
        atomic_write_json(&self.path, &*profiles)?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut profiles = self.profiles.write();
        let before = profiles.len();
        profiles.retain(|p| p.id != id);
        if profiles.len() == before {
            return Err(CoreError::NotFound(format!("profile {id}")));
        }
        atomic_write_json(&self.path, &*profiles)?;
        Ok(())
    }
}

/// One autostart entry in `miners.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerEntry {
    pub kind: MinerKind,
    #[serde(default)]
    pub autostart: bool,
    pub config: MinerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSettings {
    pub enabled: bool,
    pub retention_days: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 30,
        }
    }
}

/// Composite-score weights for peer ranking; lower score wins.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingWeights {
    pub rtt: f64,
    pub hops: f64,
    pub geo: f64,
    pub reliability: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            rtt: 0.4,
            hops: 0.2,
            geo: 0.2,
            reliability: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSettings {
    /// Bind address for the HTTP control surface.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// Route namespace the control surface is mounted under.
    #[serde(default = "default_api_namespace")]
    pub api_namespace: String,
    /// Bind address for the peer overlay listener.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub ranking: RankingWeights,
}

fn default_http_addr() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_api_namespace() -> String {
    "/api/v1/mining".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:9091".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            api_namespace: default_api_namespace(),
            listen_addr: default_listen_addr(),
            request_timeout_secs: default_request_timeout(),
            ranking: RankingWeights::default(),
        }
    }
}

/// Contents of `miners.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub miners: Vec<MinerEntry>,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub node: NodeSettings,
}

pub struct SettingsStore {
    path: PathBuf,
    settings: RwLock<Settings>,
}

impl SettingsStore {
    pub fn load(path: PathBuf) -> Self {
        let settings: Settings = load_json_or_default(&path);
        Self {
            path,
            settings: RwLock::new(settings),
        }
    }

    pub fn get(&self) -> Settings {
        self.settings.read().clone()
    }

    pub fn set_autostart(&self, kind: MinerKind, config: MinerConfig, autostart: bool) -> Result<()> {
        let mut settings = self.settings.write();
        let hash = config.config_hash();
        match settings
            .miners
            .iter_mut()
            .find(|e| e.kind == kind && e.config.config_hash() == hash)
        {
            Some(entry) => entry.autostart = autostart,
            None => settings.miners.push(MinerEntry {
                kind,
                autostart,
                config,
            }),
        }
        atomic_write_json(&self.path, &*settings)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minefleet_miner_adapters::MinerKind;

    fn config(kind: MinerKind, worker: &str) -> MinerConfig {
        MinerConfig {
            kind,
            pool: "pool.example:3333".to_string(),
            worker: worker.to_string(),
            password: "x".to_string(),
            tls: false,
            threads: 0,
            extra_args: String::new(),
            algorithm: None,
            devices: Vec::new(),
        }
    }

    #[test]
    fn profile_round_trip_modulo_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::load(dir.path().join("mining_profiles.json"));

        let created = store
            .create("rig-a".to_string(), config(MinerKind::Xmrig, "w1"))
            .unwrap();
        let fetched = store.get(&created.id).unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.kind, MinerKind::Xmrig);
        assert_eq!(fetched.config.worker, "w1");
    }

    #[test]
    fn profiles_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mining_profiles.json");

        let id = {
            let store = ProfileStore::load(path.clone());
            store
                .create("rig-a".to_string(), config(MinerKind::CpuminerOpt, "w1"))
                .unwrap()
                .id
        };

        let store = ProfileStore::load(path);
        assert_eq!(store.get(&id).unwrap().name, "rig-a");
    }

    #[test]
    fn update_rejects_kind_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::load(dir.path().join("mining_profiles.json"));
        let created = store
            .create("rig-a".to_string(), config(MinerKind::Xmrig, "w1"))
            .unwrap();

        let err = store
            .update(&created.id, "rig-a".to_string(), config(MinerKind::CpuminerOpt, "w1"))
            .unwrap_err();
        assert!(matches!(err, CoreError::PreconditionFailed(_)));
    }

    #[test]
    fn delete_missing_profile_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::load(dir.path().join("mining_profiles.json"));
        assert!(matches!(
            store.delete("nope"),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn settings_defaults_apply() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("miners.json"));
        let settings = store.get();
        assert!(settings.database.enabled);
        assert_eq!(settings.database.retention_days, 30);
        assert_eq!(settings.node.request_timeout_secs, 30);
        assert!(settings.miners.is_empty());
    }

    #[test]
    fn autostart_entries_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miners.json");
        {
            let store = SettingsStore::load(path.clone());
            store
                .set_autostart(MinerKind::Xmrig, config(MinerKind::Xmrig, "w1"), true)
                .unwrap();
        }
        let store = SettingsStore::load(path);
        let settings = store.get();
        assert_eq!(settings.miners.len(), 1);
        assert!(settings.miners[0].autostart);
    }

    #[test]
    fn corrupt_settings_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miners.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = SettingsStore::load(path);
        assert!(store.get().miners.is_empty());
    }
}
