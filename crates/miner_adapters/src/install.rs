//! Shared artifact installer: download, verify, place, remove.

use crate::descriptor::MinerDescriptor;
use crate::{AdapterError, InstallStatus, MinerKind, Result};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::{info, warn};

/// Root directory for adapter-installed binaries:
/// `<data>/minefleet/miners/<kind>/`.
pub fn miners_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("minefleet")
        .join("miners")
}

pub(crate) fn install_dir(kind: MinerKind) -> PathBuf {
    miners_data_dir().join(kind.as_str())
}

pub(crate) fn binary_path(desc: &MinerDescriptor) -> PathBuf {
    install_dir(desc.kind).join(desc.executable)
}

pub(crate) async fn check_installed(desc: &MinerDescriptor) -> Result<InstallStatus> {
    let path = binary_path(desc);
    if !path.exists() {
        return Ok(InstallStatus::default());
    }
    Ok(InstallStatus {
        installed: true,
        version: Some(desc.version.to_string()),
        path: Some(path),
    })
}

/// Download and place the artifact. Idempotent: an existing binary that
/// passes verification is left alone.
pub(crate) async fn install(desc: &MinerDescriptor) -> Result<PathBuf> {
    let path = binary_path(desc);

    if path.exists() {
        let content = tokio::fs::read(&path).await?;
        if verify_artifact(desc, &content)? {
            info!("{} already installed at {:?}", desc.kind, path);
            return Ok(path);
        }
        warn!("{} artifact failed verification, redownloading", desc.kind);
    }

    let url = desc.resolved_url();
    info!("Downloading {} from {}", desc.kind, url);

    let resp = reqwest::get(&url)
        .await
        .map_err(|e| AdapterError::DownloadFailed(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(AdapterError::DownloadFailed(format!(
            "{} returned {}",
            url,
            resp.status()
        )));
    }
    let content = resp
        .bytes()
        .await
        .map_err(|e| AdapterError::DownloadFailed(e.to_string()))?;

    if !verify_artifact(desc, &content)? {
        return Err(AdapterError::ChecksumMismatch);
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Write-temp-then-rename so a crash mid-download never leaves a
    // half-written executable in place.
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &content).await?;
    tokio::fs::rename(&tmp, &path).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(&path).await?.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await?;
    }

    info!("Installed {} {} at {:?}", desc.kind, desc.version, path);
    Ok(path)
}

pub(crate) async fn uninstall(desc: &MinerDescriptor) -> Result<()> {
    let dir = install_dir(desc.kind);
    if dir.exists() {
        tokio::fs::remove_dir_all(&dir).await?;
        info!("Uninstalled {} from {:?}", desc.kind, dir);
    }
    Ok(())
}

/// Pinned sha256 when published for this platform, otherwise a sanity
/// check of the executable header.
fn verify_artifact(desc: &MinerDescriptor, content: &[u8]) -> Result<bool> {
    match desc.pinned_checksum() {
        Some(expected) => {
            let mut hasher = Sha256::new();
            hasher.update(content);
            let computed = hex::encode(hasher.finalize());
            if !computed.eq_ignore_ascii_case(expected) {
                warn!(
                    "Checksum mismatch for {}: expected {}, got {}",
                    desc.kind, expected, computed
                );
                return Ok(false);
            }
            Ok(true)
        }
        None => Ok(looks_like_executable(content)),
    }
}

fn looks_like_executable(content: &[u8]) -> bool {
    if content.len() < 4 {
        return false;
    }
    match &content[..4] {
        [0x7f, b'E', b'L', b'F'] => true,
        // Mach-O, both endiannesses, 64-bit
        [0xfe, 0xed, 0xfa, 0xcf] | [0xcf, 0xfa, 0xed, 0xfe] => true,
        // Mach-O universal
        [0xca, 0xfe, 0xba, 0xbe] => true,
        [b'M', b'Z', _, _] => true,
        _ => false,
    }
}
