//! Well-known locations for persisted state.

use std::path::PathBuf;

const APP_DIR: &str = "minefleet";

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn profiles_path() -> PathBuf {
    config_dir().join("mining_profiles.json")
}

pub fn settings_path() -> PathBuf {
    config_dir().join("miners.json")
}

pub fn node_identity_path() -> PathBuf {
    config_dir().join("node.json")
}

pub fn peers_path() -> PathBuf {
    config_dir().join("peers.json")
}

pub fn history_db_path() -> PathBuf {
    data_dir().join("mining.db")
}

pub fn private_key_path() -> PathBuf {
    data_dir().join("node").join("private.key")
}
