//! Disk-backed toolkit detection cache.
//!
//! One JSON object maps backend id to its last [`ToolkitStatus`]. Every write
//! rewrites the whole file; a missing or unreadable file loads as empty.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{ToolkitBackend, ToolkitStatus};

/// Process-wide cache, owned by the detector and shared by reference.
#[derive(Debug)]
pub struct ToolkitCache {
    path: Option<PathBuf>,
    entries: RwLock<BTreeMap<ToolkitBackend, ToolkitStatus>>,
}

impl ToolkitCache {
    /// Load from `path`, starting empty if it is missing or corrupt.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = read_file(&path);
        debug!(path = %path.display(), entries = entries.len(), "Toolkit cache loaded");
        Self {
            path: Some(path),
            entries: RwLock::new(entries),
        }
    }

    /// A cache that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, backend: ToolkitBackend) -> Option<ToolkitStatus> {
        self.entries.read().get(&backend).cloned()
    }

    pub fn all(&self) -> BTreeMap<ToolkitBackend, ToolkitStatus> {
        self.entries.read().clone()
    }

    /// The file is rewritten while the write lock is held.
    pub fn insert(&self, backend: ToolkitBackend, status: ToolkitStatus) {
        let mut entries = self.entries.write();
        entries.insert(backend, status);
        self.persist(&entries);
    }

    /// Drop every entry, on disk too.
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        entries.clear();
        self.persist(&entries);
        debug!("Toolkit cache cleared");
    }

    fn persist(&self, entries: &BTreeMap<ToolkitBackend, ToolkitStatus>) {
        let Some(path) = &self.path else { return };
        if let Err(e) = write_file(path, entries) {
            warn!(path = %path.display(), error = %e, "Failed to write toolkit cache");
        }
    }
}

fn read_file(path: &Path) -> BTreeMap<ToolkitBackend, ToolkitStatus> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read toolkit cache");
            return BTreeMap::new();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring corrupt toolkit cache");
            BTreeMap::new()
        }
    }
}

fn write_file(path: &Path, entries: &BTreeMap<ToolkitBackend, ToolkitStatus>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("toolkit_cache.json");

        let cache = ToolkitCache::load(&path);
        cache.insert(ToolkitBackend::Cpu, ToolkitStatus::available("CPU", "Always available"));
        drop(cache);

        let reloaded = ToolkitCache::load(&path);
        assert!(reloaded.get(ToolkitBackend::Cpu).unwrap().available);

        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["cpu"]["toolkit_name"], "CPU");
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolkit_cache.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(ToolkitCache::load(&path).all().is_empty());
    }

    #[test]
    fn test_clear_empties_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolkit_cache.json");
        let cache = ToolkitCache::load(&path);
        cache.insert(ToolkitBackend::Cpu, ToolkitStatus::available("CPU", "ok"));
        cache.clear();
        assert!(ToolkitCache::load(&path).all().is_empty());
    }

    #[test]
    fn test_concurrent_inserts_leave_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolkit_cache.json");
        let cache = std::sync::Arc::new(ToolkitCache::load(&path));

        let workers: Vec<_> = ToolkitBackend::ALL
            .iter()
            .map(|backend| {
                let (cache, backend) = (cache.clone(), *backend);
                std::thread::spawn(move || {
                    for round in 0..20 {
                        cache.insert(backend, ToolkitStatus::available("toolkit", format!("round {}", round)));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let on_disk = ToolkitCache::load(&path).all();
        assert_eq!(on_disk.len(), ToolkitBackend::ALL.len());
        assert_eq!(on_disk, cache.all());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
