use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info};

use super::{ToolkitBackend, ToolkitCache, ToolkitStatus};
use crate::process::{CommandRunner, CommandSpec, ProcessOutput};
use crate::telemetry::metrics::InstallMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Host Probe
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything the detector is allowed to ask of the host.
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Run a command. `None` when it cannot be started or times out.
    async fn run(&self, program: &str, args: &[&str]) -> Option<ProcessOutput>;

    fn env_var(&self, key: &str) -> Option<String>;

    fn dir_exists(&self, path: &Path) -> bool;

    /// `std::env::consts::OS` style name.
    fn os(&self) -> &str;

    /// `std::env::consts::ARCH` style name.
    fn arch(&self) -> &str;
}

/// Probes the real machine through a [`CommandRunner`].
pub struct SystemProbe {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl SystemProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

#[async_trait]
impl HostProbe for SystemProbe {
    async fn run(&self, program: &str, args: &[&str]) -> Option<ProcessOutput> {
        let spec = CommandSpec::new(program, self.timeout).args(args.iter().copied());
        match self.runner.run(spec).await {
            Ok(output) => Some(output),
            Err(e) => {
                debug!(program, error = %e, "Toolkit probe command unavailable");
                None
            }
        }
    }

    fn env_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }

    fn dir_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn os(&self) -> &str {
        std::env::consts::OS
    }

    fn arch(&self) -> &str {
        std::env::consts::ARCH
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Detector
// ═══════════════════════════════════════════════════════════════════════════════

/// Cached toolkit detection. Cheap to clone.
#[derive(Clone)]
pub struct ToolkitDetector {
    cache: Arc<ToolkitCache>,
    probe: Arc<dyn HostProbe>,
}

impl ToolkitDetector {
    pub fn new(cache: Arc<ToolkitCache>, probe: Arc<dyn HostProbe>) -> Self {
        Self { cache, probe }
    }

    pub fn cache(&self) -> &Arc<ToolkitCache> {
        &self.cache
    }

    pub fn probe(&self) -> &Arc<dyn HostProbe> {
        &self.probe
    }

    pub async fn detect(&self, backend: ToolkitBackend, force_refresh: bool) -> ToolkitStatus {
        if !force_refresh {
            if let Some(status) = self.cache.get(backend) {
                return status;
            }
        }

        let status = self.run_probe(backend).await;
        InstallMetrics::record_probe(backend.as_str());
        debug!(
            backend = %backend,
            available = status.available,
            message = %status.message,
            "Toolkit probed"
        );
        self.cache.insert(backend, status.clone());
        status
    }

    /// Probe whatever is missing from the cache (everything when forced).
    pub async fn detect_all(&self, force_refresh: bool) -> BTreeMap<ToolkitBackend, ToolkitStatus> {
        let mut results = BTreeMap::new();
        for backend in ToolkitBackend::ALL {
            results.insert(backend, self.detect(backend, force_refresh).await);
        }
        results
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
        info!("Toolkit detection cache invalidated");
    }

    pub fn cached(&self) -> BTreeMap<ToolkitBackend, ToolkitStatus> {
        self.cache.all()
    }

    async fn run_probe(&self, backend: ToolkitBackend) -> ToolkitStatus {
        match backend {
            ToolkitBackend::Cuda => self.probe_cuda().await,
            ToolkitBackend::Rocm => self.probe_rocm().await,
            ToolkitBackend::Vulkan => self.probe_vulkan().await,
            ToolkitBackend::Metal => self.probe_metal(),
            ToolkitBackend::Openblas => self.probe_openblas().await,
            ToolkitBackend::Cpu => ToolkitStatus::available(backend.toolkit_name(), "Always available"),
        }
    }

    async fn probe_cuda(&self) -> ToolkitStatus {
        let backend = ToolkitBackend::Cuda;
        let Some(banner) = self.probe.run("nvidia-smi", &[]).await.filter(ProcessOutput::success) else {
            return ToolkitStatus::unavailable(backend, "nvidia-smi not found or failed; no NVIDIA driver detected");
        };

        let cuda_version = capture(cuda_version_re(), &banner.stdout);
        let mut status = ToolkitStatus::available(
            backend.toolkit_name(),
            match &cuda_version {
                Some(v) => format!("NVIDIA driver present (CUDA {})", v),
                None => "NVIDIA driver present".to_string(),
            },
        );
        if let Some(v) = cuda_version {
            status = status.with_detail("cuda_version", v);
        }
        if let Some(driver) = capture(driver_version_re(), &banner.stdout) {
            status = status.with_detail("driver_version", driver);
        }

        if let Some(query) = self
            .probe
            .run("nvidia-smi", &["--query-gpu=name", "--format=csv,noheader"])
            .await
            .filter(ProcessOutput::success)
        {
            if let Some(name) = query.stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
                status = status.with_detail("gpu_name", name.to_string());
            }
        }
        if let Some(cuda_path) = self.probe.env_var("CUDA_PATH") {
            status = status.with_detail("cuda_path", cuda_path);
        }
        status
    }

    async fn probe_rocm(&self) -> ToolkitStatus {
        let backend = ToolkitBackend::Rocm;
        if self.probe.run("rocm-smi", &[]).await.is_some_and(|o| o.success()) {
            return ToolkitStatus::available(backend.toolkit_name(), "rocm-smi responded");
        }
        for var in ["ROCM_PATH", "HIP_PATH"] {
            if let Some(dir) = self.sdk_dir(var) {
                return ToolkitStatus::available(backend.toolkit_name(), format!("{} found", var))
                    .with_detail("sdk_path", dir);
            }
        }
        ToolkitStatus::unavailable(backend, "ROCm not found (no rocm-smi, ROCM_PATH or HIP_PATH)")
    }

    async fn probe_vulkan(&self) -> ToolkitStatus {
        let backend = ToolkitBackend::Vulkan;
        if let Some(dir) = self.sdk_dir("VULKAN_SDK") {
            return ToolkitStatus::available(backend.toolkit_name(), "Vulkan SDK found")
                .with_detail("sdk_path", dir);
        }
        if self.probe.run("vulkaninfo", &["--summary"]).await.is_some_and(|o| o.success()) {
            return ToolkitStatus::unavailable(backend, "Vulkan runtime present, SDK missing")
                .with_detail("runtime", true);
        }
        ToolkitStatus::unavailable(backend, "Vulkan SDK not found (VULKAN_SDK unset)")
    }

    fn probe_metal(&self) -> ToolkitStatus {
        let backend = ToolkitBackend::Metal;
        let (os, arch) = (self.probe.os(), self.probe.arch());
        if os == "macos" && arch == "aarch64" {
            ToolkitStatus::available(backend.toolkit_name(), "Apple Silicon with Metal")
        } else {
            ToolkitStatus::unavailable(backend, format!("Metal requires Apple Silicon (host is {}/{})", os, arch))
        }
    }

    async fn probe_openblas(&self) -> ToolkitStatus {
        let backend = ToolkitBackend::Openblas;
        if let Some(path) = self.probe.env_var("OPENBLAS_PATH") {
            return ToolkitStatus::available(backend.toolkit_name(), "OPENBLAS_PATH set")
                .with_detail("sdk_path", path);
        }
        if self
            .probe
            .run("pkg-config", &["--exists", "openblas"])
            .await
            .is_some_and(|o| o.success())
        {
            return ToolkitStatus::available(backend.toolkit_name(), "openblas found via pkg-config");
        }
        ToolkitStatus::unavailable(backend, "OpenBLAS not found")
    }

    fn sdk_dir(&self, var: &str) -> Option<String> {
        self.probe
            .env_var(var)
            .filter(|dir| self.probe.dir_exists(Path::new(dir)))
    }
}

fn cuda_version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"CUDA Version:\s*([0-9]+\.[0-9]+)").expect("static regex"))
}

fn driver_version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Driver Version:\s*([0-9.]+)").expect("static regex"))
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text).map(|c| c[1].to_string())
}
