//! Extension catalog: engine variants and package sets, cross-referenced
//! with toolkit availability and what each environment already holds.
//!
//! Extensions are always installed into an existing environment. There is
//! no standalone install target.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::environments::{
    normalize_package_name, read_runtime_marker, spec_package_name, EnvironmentStore, PackageInstallReport,
    RuntimeInstallOutcome, RUNTIME_PACKAGE,
};
use crate::error::{ForgeError, Result};
use crate::toolkit::{ToolkitBackend, ToolkitDetector, ToolkitStatus};

mod catalog;

use catalog::{CatalogEntry, CATALOG};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionKind {
    Engine,
    PackageSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extension {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: ExtensionKind,
    pub backend: Option<ToolkitBackend>,
    pub packages: Vec<String>,
    pub compatible: bool,
    pub compatibility_message: Option<String>,
    pub installed: bool,
    pub installed_environments: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionFilter {
    #[serde(default, rename = "type")]
    pub kind: Option<ExtensionKind>,
    #[serde(default)]
    pub installed: Option<bool>,
    #[serde(default)]
    pub compatible: Option<bool>,
}

impl ExtensionFilter {
    fn accepts(&self, ext: &Extension) -> bool {
        self.kind.map_or(true, |k| k == ext.kind)
            && self.installed.map_or(true, |i| i == ext.installed)
            && self.compatible.map_or(true, |c| c == ext.compatible)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtensionInstallOutcome {
    Runtime(RuntimeInstallOutcome),
    Packages(PackageInstallReport),
}

/// What one environment holds, as far as the catalog cares.
struct EnvironmentScan {
    name: String,
    packages: BTreeSet<String>,
    engine_backend: Option<ToolkitBackend>,
}

pub struct ExtensionCatalog {
    environments: Arc<EnvironmentStore>,
    detector: ToolkitDetector,
}

impl ExtensionCatalog {
    pub fn new(environments: Arc<EnvironmentStore>, detector: ToolkitDetector) -> Self {
        Self {
            environments,
            detector,
        }
    }

    pub async fn list_extensions(&self, filter: &ExtensionFilter) -> Result<Vec<Extension>> {
        let toolkits = self.detector.detect_all(false).await;
        let scans = self.scan_environments().await?;

        Ok(CATALOG
            .iter()
            .map(|entry| describe(entry, &toolkits, &scans))
            .filter(|ext| filter.accepts(ext))
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<Extension> {
        let entry = catalog::find(id).ok_or_else(|| ForgeError::extension_not_found(id))?;
        let toolkits = self.detector.detect_all(false).await;
        let scans = self.scan_environments().await?;
        Ok(describe(entry, &toolkits, &scans))
    }

    /// Install into an existing environment; never creates one.
    #[instrument(skip(self), fields(extension = %id, environment = %venv_name))]
    pub async fn install(
        &self,
        id: &str,
        venv_name: &str,
        model_id: Option<&str>,
    ) -> Result<ExtensionInstallOutcome> {
        let entry = catalog::find(id).ok_or_else(|| ForgeError::extension_not_found(id))?;
        self.environments.get(venv_name).await?;

        let outcome = match (entry.kind, entry.backend) {
            (ExtensionKind::Engine, Some(backend)) => ExtensionInstallOutcome::Runtime(
                self.environments
                    .install_backend_runtime(venv_name, backend, &self.detector, model_id)
                    .await?,
            ),
            _ => {
                let specs: Vec<String> = entry.packages.iter().map(|p| p.to_string()).collect();
                ExtensionInstallOutcome::Packages(self.environments.install_packages(venv_name, &specs).await?)
            }
        };
        info!("Extension install finished");
        Ok(outcome)
    }

    /// Forget cached toolkit results and probe everything again.
    pub async fn refresh(&self) -> BTreeMap<ToolkitBackend, ToolkitStatus> {
        self.detector.clear_cache();
        self.detector.detect_all(true).await
    }

    async fn scan_environments(&self) -> Result<Vec<EnvironmentScan>> {
        let runtime = normalize_package_name(RUNTIME_PACKAGE);
        let mut scans = Vec::new();
        for env in self.environments.list().await? {
            let packages = self.environments.installed_distributions(&env.name).await?;
            // A runtime installed without a marker came from a plain pip install.
            let engine_backend = packages.contains(&runtime).then(|| {
                read_runtime_marker(&env.path)
                    .map(|m| m.backend)
                    .unwrap_or(ToolkitBackend::Cpu)
            });
            scans.push(EnvironmentScan {
                name: env.name,
                packages,
                engine_backend,
            });
        }
        Ok(scans)
    }
}

fn describe(
    entry: &CatalogEntry,
    toolkits: &BTreeMap<ToolkitBackend, ToolkitStatus>,
    scans: &[EnvironmentScan],
) -> Extension {
    let (compatible, compatibility_message) = match entry.backend {
        Some(backend) => match toolkits.get(&backend) {
            Some(status) => (status.available, Some(status.message.clone())),
            None => (false, None),
        },
        None => (true, None),
    };

    let installed_environments: Vec<String> = scans
        .iter()
        .filter(|scan| match entry.kind {
            ExtensionKind::Engine => scan.engine_backend.is_some() && scan.engine_backend == entry.backend,
            ExtensionKind::PackageSet => entry
                .packages
                .iter()
                .all(|p| scan.packages.contains(&normalize_package_name(spec_package_name(p)))),
        })
        .map(|scan| scan.name.clone())
        .collect();

    Extension {
        id: entry.id.to_string(),
        name: entry.name.to_string(),
        description: entry.description.to_string(),
        kind: entry.kind,
        backend: entry.backend,
        packages: entry.packages.iter().map(|p| p.to_string()).collect(),
        compatible,
        compatibility_message,
        installed: !installed_environments.is_empty(),
        installed_environments,
    }
}
