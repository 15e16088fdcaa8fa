use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{ErrorCode, ForgeError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
    /// `sha256:<hex>` when the feed publishes one
    #[serde(default)]
    pub digest: Option<String>,
}

impl ReleaseAsset {
    pub fn sha256(&self) -> Option<&str> {
        self.digest.as_deref().and_then(|d| d.strip_prefix("sha256:"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl ReleaseInfo {
    pub fn asset_names(&self) -> impl Iterator<Item = &str> {
        self.assets.iter().map(|a| a.name.as_str())
    }
}

/// Latest-release lookups with a TTL cache.
pub struct ReleaseClient {
    http: reqwest::Client,
    url: String,
    ttl: Duration,
    cached: Mutex<Option<(Instant, Arc<ReleaseInfo>)>>,
}

impl ReleaseClient {
    pub fn new(http: reqwest::Client, url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            http,
            url: url.into(),
            ttl,
            cached: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn latest(&self) -> Result<Arc<ReleaseInfo>> {
        let cached = self
            .cached
            .lock()
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, info)| info.clone());
        if let Some(info) = cached {
            debug!(tag = %info.tag_name, "Release metadata cache hit");
            return Ok(info);
        }

        let response = self
            .http
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| release_unavailable(&self.url, e.to_string()))?;
        if !response.status().is_success() {
            return Err(release_unavailable(&self.url, format!("HTTP {}", response.status())));
        }
        let info: ReleaseInfo = response
            .json()
            .await
            .map_err(|e| release_unavailable(&self.url, e.to_string()))?;

        info!(tag = %info.tag_name, assets = info.assets.len(), "Fetched latest release");
        let info = Arc::new(info);
        *self.cached.lock() = Some((Instant::now(), info.clone()));
        Ok(info)
    }

    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}

fn release_unavailable(url: &str, reason: String) -> ForgeError {
    ForgeError::new(ErrorCode::ReleaseUnavailable, "Release metadata unavailable")
        .with_internal_message(format!("{}: {}", url, reason))
        .with_context("url", url)
}
