use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, instrument, warn};

use super::archive::{extract, finalize};
use super::assets::{cudart_asset_name, resolve_asset, select_cuda_version, CudaVersion};
use super::download::{download_file, DOWNLOAD_END};
use super::libpath::register_library_path;
use super::marker::{read_marker, write_marker, InstalledMarker};
use super::{BackendId, Platform, Progress, ReleaseAsset, ReleaseClient, ReleaseInfo};
use crate::config::InstallerConfig;
use crate::error::{ErrorCode, ForgeError, Result};
use crate::telemetry::metrics::InstallMetrics;
use crate::toolkit::{ToolkitBackend, ToolkitDetector};

// ═══════════════════════════════════════════════════════════════════════════════
// Reports
// ═══════════════════════════════════════════════════════════════════════════════

/// Entry of [`BackendInstaller::get_available_backends`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub id: BackendId,
    pub name: String,
    pub description: String,
    pub installed: bool,
    pub installed_version: Option<String>,
    pub size_mb: u32,
    pub requires_gpu: bool,
    pub toolkit: Option<ToolkitBackend>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallStatus {
    pub backend_id: BackendId,
    pub installed: bool,
    pub installed_version: Option<String>,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledBackend {
    pub backend_id: BackendId,
    pub version: String,
    pub cuda_version: Option<String>,
    pub asset_name: String,
    pub path: PathBuf,
    pub installed_date: DateTime<Utc>,
}

impl InstalledBackend {
    fn from_marker(backend_id: BackendId, path: PathBuf, marker: InstalledMarker) -> Self {
        Self {
            backend_id,
            version: marker.version,
            cuda_version: marker.cuda_version,
            asset_name: marker.asset_name,
            path,
            installed_date: marker.installed_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UninstallOutcome {
    Removed { path: PathBuf },
    NotInstalled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendUpdate {
    pub id: BackendId,
    pub current_version: String,
    pub latest_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub latest_version: String,
    pub updates_available: Vec<BackendUpdate>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Installer
// ═══════════════════════════════════════════════════════════════════════════════

pub struct BackendInstaller {
    backends_dir: PathBuf,
    downloads_dir: PathBuf,
    platform: Platform,
    releases: ReleaseClient,
    http: reqwest::Client,
    config: InstallerConfig,
    detector: ToolkitDetector,
}

impl BackendInstaller {
    pub fn new(
        backends_dir: impl Into<PathBuf>,
        downloads_dir: impl Into<PathBuf>,
        config: InstallerConfig,
        detector: ToolkitDetector,
    ) -> Result<Self> {
        let user_agent = concat!("runforge/", env!("CARGO_PKG_VERSION"));
        let metadata_http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(config.download_timeout)
            .build()?;
        Ok(Self {
            backends_dir: backends_dir.into(),
            downloads_dir: downloads_dir.into(),
            platform: Platform::host(),
            releases: ReleaseClient::new(metadata_http, config.release_url.clone(), config.release_cache_ttl),
            http,
            config,
            detector,
        })
    }

    /// Select assets for `platform` instead of the host.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn backends_dir(&self) -> &Path {
        &self.backends_dir
    }

    pub fn releases(&self) -> &ReleaseClient {
        &self.releases
    }

    fn backend_dir(&self, id: BackendId) -> PathBuf {
        self.backends_dir.join(id.as_str())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Backends buildable for this platform with their install state.
    pub fn get_available_backends(&self) -> BTreeMap<BackendId, BackendInfo> {
        BackendId::ALL
            .into_iter()
            .filter(|id| id.supports(&self.platform))
            .map(|id| {
                let descriptor = id.descriptor();
                let status = self.check_backend_installed(id);
                let info = BackendInfo {
                    id,
                    name: descriptor.name.to_string(),
                    description: descriptor.description.to_string(),
                    installed: status.installed,
                    installed_version: status.installed_version,
                    size_mb: descriptor.size_mb,
                    requires_gpu: descriptor.requires_gpu,
                    toolkit: id.toolkit(),
                };
                (id, info)
            })
            .collect()
    }

    pub fn check_backend_installed(&self, id: BackendId) -> InstallStatus {
        let dir = self.backend_dir(id);
        match read_marker(&dir) {
            Some(marker) => InstallStatus {
                backend_id: id,
                installed: true,
                installed_version: Some(marker.version),
                path: Some(dir),
            },
            None => InstallStatus {
                backend_id: id,
                installed: false,
                installed_version: None,
                path: None,
            },
        }
    }

    pub fn list_installed(&self) -> Vec<InstalledBackend> {
        BackendId::ALL
            .into_iter()
            .filter_map(|id| {
                let dir = self.backend_dir(id);
                read_marker(&dir).map(|marker| InstalledBackend::from_marker(id, dir, marker))
            })
            .collect()
    }

    /// Compare installed release tags with the latest tag as opaque strings.
    pub async fn check_for_updates(&self) -> Result<UpdateReport> {
        let release = self.releases.latest().await?;
        let updates_available = self
            .list_installed()
            .into_iter()
            .filter(|b| b.version != release.tag_name)
            .map(|b| BackendUpdate {
                id: b.backend_id,
                current_version: b.version,
                latest_version: release.tag_name.clone(),
            })
            .collect();
        Ok(UpdateReport {
            latest_version: release.tag_name.clone(),
            updates_available,
        })
    }

    /// Put every installed backend on the library search path.
    pub fn register_installed(&self) {
        for backend in self.list_installed() {
            register_library_path(&backend.path);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Install / uninstall
    // ─────────────────────────────────────────────────────────────────────────

    #[instrument(skip(self, progress), fields(backend_id = %id))]
    pub async fn install_backend(&self, id: BackendId, progress: Progress<'_>) -> Result<InstalledBackend> {
        let started = Instant::now();
        let result = self.install_inner(id, progress).await;
        InstallMetrics::record_backend(id.as_str(), result.is_ok(), started.elapsed().as_secs_f64());
        self.detector.clear_cache();

        match &result {
            Ok(installed) => {
                progress(100, "Installed");
                info!(version = %installed.version, path = %installed.path.display(), "Backend installed");
            }
            Err(e) => warn!(error = %e, "Backend install failed"),
        }
        result
    }

    async fn install_inner(&self, id: BackendId, progress: Progress<'_>) -> Result<InstalledBackend> {
        if !id.supports(&self.platform) {
            return Err(ForgeError::new(
                ErrorCode::BackendUnsupported,
                format!("Backend '{}' is not available on {}/{}", id, self.platform.os, self.platform.arch),
            ));
        }

        progress(0, "Fetching release metadata");
        let release = self.releases.latest().await?;

        let cuda = if id == BackendId::Cuda {
            let version = select_cuda_version(release.asset_names(), &self.platform).ok_or_else(|| {
                let sample: Vec<String> = release.asset_names().take(10).map(str::to_string).collect();
                ForgeError::asset_not_found("cuda-<major>.<minor>", &sample)
            })?;
            info!(cuda_version = %version, "Selected CUDA build");
            Some(version)
        } else {
            None
        };

        let asset = resolve_asset(&release.assets, &release.tag_name, id, &self.platform, cuda)?;
        progress(5, &format!("Resolved {}", asset.name));

        let archive = self.fetch(asset, progress).await?;

        let staging = self
            .backends_dir
            .join(format!(".staging-{}-{}", id, uuid::Uuid::new_v4().simple()));
        let final_dir = self.backend_dir(id);
        let installed = self
            .unpack_and_mark(id, &release, asset, cuda, &archive, &staging, &final_dir, progress)
            .await;

        let _ = tokio::fs::remove_dir_all(&staging).await;
        let _ = tokio::fs::remove_file(&archive).await;
        installed
    }

    #[allow(clippy::too_many_arguments)]
    async fn unpack_and_mark(
        &self,
        id: BackendId,
        release: &ReleaseInfo,
        asset: &ReleaseAsset,
        cuda: Option<CudaVersion>,
        archive: &Path,
        staging: &Path,
        final_dir: &Path,
        progress: Progress<'_>,
    ) -> Result<InstalledBackend> {
        progress(DOWNLOAD_END + 2, "Extracting");
        extract(archive, staging).await?;
        finalize(staging, final_dir)?;

        let completed = self.complete_install(id, release, asset, cuda, final_dir, progress).await;
        if completed.is_err() {
            warn!(path = %final_dir.display(), "Rolling back partial backend install");
            let _ = tokio::fs::remove_dir_all(final_dir).await;
        }
        completed
    }

    async fn complete_install(
        &self,
        id: BackendId,
        release: &ReleaseInfo,
        asset: &ReleaseAsset,
        cuda: Option<CudaVersion>,
        final_dir: &Path,
        progress: Progress<'_>,
    ) -> Result<InstalledBackend> {
        if let Some(version) = cuda.filter(|_| self.platform.is_windows() && self.config.cuda_runtime) {
            progress(80, "Fetching CUDA runtime libraries");
            let runtime = self.fetch_cuda_runtime(release, version).await?;
            extract(&runtime, final_dir).await?;
            let _ = tokio::fs::remove_file(&runtime).await;
        }

        progress(90, "Writing install marker");
        let marker = write_marker(
            final_dir,
            &InstalledMarker {
                version: release.tag_name.clone(),
                backend_id: id.as_str().to_string(),
                cuda_version: cuda.map(|v| v.to_string()),
                asset_name: asset.name.clone(),
                installed_date: Utc::now(),
                platform: self.platform.os.clone(),
                arch: self.platform.arch.clone(),
            },
        )?;

        progress(95, "Registering library path");
        register_library_path(final_dir);
        Ok(InstalledBackend::from_marker(id, final_dir.to_path_buf(), marker))
    }

    async fn fetch(&self, asset: &ReleaseAsset, progress: Progress<'_>) -> Result<PathBuf> {
        let dest = self.downloads_dir.join(&asset.name);
        download_file(
            &self.http,
            &asset.browser_download_url,
            &dest,
            asset.sha256(),
            self.config.download_chunk_size,
            progress,
        )
        .await?;
        Ok(dest)
    }

    async fn fetch_cuda_runtime(&self, release: &ReleaseInfo, version: CudaVersion) -> Result<PathBuf> {
        let name = cudart_asset_name(version);
        let token = format!("cuda-{}", version);
        let asset = release
            .assets
            .iter()
            .find(|a| a.name == name)
            .or_else(|| release.assets.iter().find(|a| a.name.starts_with("cudart") && a.name.contains(&token)))
            .ok_or_else(|| {
                let sample: Vec<String> = release.asset_names().take(10).map(str::to_string).collect();
                ForgeError::asset_not_found(&name, &sample)
            })?;
        self.fetch(asset, &|_, _| {}).await
    }

    /// Remove the backend directory. Not being installed is an outcome.
    #[instrument(skip(self), fields(backend_id = %id))]
    pub async fn uninstall_backend(&self, id: BackendId) -> Result<UninstallOutcome> {
        let dir = self.backend_dir(id);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            info!("Backend not installed, nothing to remove");
            return Ok(UninstallOutcome::NotInstalled);
        }
        tokio::fs::remove_dir_all(&dir).await?;
        self.detector.clear_cache();
        info!(path = %dir.display(), "Backend uninstalled");
        Ok(UninstallOutcome::Removed { path: dir })
    }
}

impl std::fmt::Debug for BackendInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendInstaller")
            .field("backends_dir", &self.backends_dir)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}
