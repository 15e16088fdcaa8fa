//! Toolkit detection caching, in memory and on disk.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use runforge_core::process::ProcessOutput;
use runforge_core::toolkit::{HostProbe, ToolkitBackend, ToolkitCache, ToolkitDetector};

/// Answers from a fixed table and counts every command it is asked to run.
#[derive(Default)]
struct CountingProbe {
    outputs: HashMap<&'static str, ProcessOutput>,
    env: HashMap<&'static str, String>,
    runs: AtomicUsize,
}

impl CountingProbe {
    fn with_nvidia() -> Self {
        let mut probe = Self::default();
        probe.outputs.insert(
            "nvidia-smi",
            ProcessOutput {
                stdout: "Driver Version: 551.23   CUDA Version: 12.4".into(),
                ..Default::default()
            },
        );
        probe
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostProbe for CountingProbe {
    async fn run(&self, program: &str, _args: &[&str]) -> Option<ProcessOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.outputs.get(program).cloned()
    }

    fn env_var(&self, key: &str) -> Option<String> {
        self.env.get(key).cloned()
    }

    fn dir_exists(&self, _path: &Path) -> bool {
        true
    }

    fn os(&self) -> &str {
        "windows"
    }

    fn arch(&self) -> &str {
        "x86_64"
    }
}

#[tokio::test]
async fn test_second_detect_is_served_from_cache() {
    let probe = Arc::new(CountingProbe::with_nvidia());
    let detector = ToolkitDetector::new(Arc::new(ToolkitCache::in_memory()), probe.clone());

    let first = detector.detect(ToolkitBackend::Cuda, false).await;
    assert!(first.available);
    let after_first = probe.runs();
    assert!(after_first > 0);

    let second = detector.detect(ToolkitBackend::Cuda, false).await;
    assert_eq!(first, second);
    assert_eq!(probe.runs(), after_first);

    detector.detect(ToolkitBackend::Cuda, true).await;
    assert!(probe.runs() > after_first);
}

#[tokio::test]
async fn test_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("toolkit_cache.json");

    {
        let probe = Arc::new(CountingProbe::with_nvidia());
        let detector = ToolkitDetector::new(Arc::new(ToolkitCache::load(&path)), probe);
        detector.detect(ToolkitBackend::Cuda, false).await;
    }
    assert!(path.is_file());

    let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(raw["cuda"]["available"], true);
    assert_eq!(raw["cuda"]["details"]["cuda_version"], "12.4");

    // A fresh process with a probe that would report nothing.
    let probe = Arc::new(CountingProbe::default());
    let detector = ToolkitDetector::new(Arc::new(ToolkitCache::load(&path)), probe.clone());
    let status = detector.detect(ToolkitBackend::Cuda, false).await;
    assert!(status.available);
    assert_eq!(probe.runs(), 0);
}

#[tokio::test]
async fn test_clear_cache_forces_reprobe() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("toolkit_cache.json");
    let probe = Arc::new(CountingProbe::with_nvidia());
    let detector = ToolkitDetector::new(Arc::new(ToolkitCache::load(&path)), probe.clone());

    detector.detect_all(false).await;
    assert_eq!(detector.cached().len(), ToolkitBackend::ALL.len());

    detector.clear_cache();
    assert!(detector.cached().is_empty());
    assert!(ToolkitCache::load(&path).all().is_empty());

    let before = probe.runs();
    detector.detect(ToolkitBackend::Cuda, false).await;
    assert!(probe.runs() > before);
}

#[tokio::test]
async fn test_corrupt_cache_file_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("toolkit_cache.json");
    std::fs::write(&path, b"{ not json").unwrap();

    let cache = ToolkitCache::load(&path);
    assert!(cache.all().is_empty());
}
