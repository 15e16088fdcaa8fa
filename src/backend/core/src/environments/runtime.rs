//! Installing the inference runtime (`llama-cpp-python`) for one GPU backend.
//!
//! CUDA uses prebuilt wheels from an extra index. The other accelerated
//! backends build from source with `CMAKE_ARGS`, which only works when the
//! vendor SDK is present, so the detector is consulted first and a missing
//! SDK comes back as [`RuntimeInstallOutcome::ToolkitMissing`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::packages::tail;
use super::EnvironmentStore;
use crate::error::{ErrorCode, ForgeError, Result};
use crate::process::CommandSpec;
use crate::toolkit::{ToolkitBackend, ToolkitDetector};

/// Distribution installed by [`EnvironmentStore::install_backend_runtime`].
pub const RUNTIME_PACKAGE: &str = "llama-cpp-python";

const WHEEL_INDEX: &str = "https://abetlen.github.io/llama-cpp-python/whl";
const FALLBACK_CUDA_WHEEL: &str = "cu121";
const MARKER_DIR: &str = ".runforge";
const MARKER_FILE: &str = "runtime.json";

const VERIFY_SCRIPT: &str = r#"
import json, llama_cpp
lib = llama_cpp.llama_cpp._lib
names = ["ggml_backend_cuda_init", "ggml_backend_hip_init", "ggml_backend_vk_init",
         "ggml_backend_metal_init", "ggml_backend_blas_init"]
print(json.dumps({
    "version": getattr(llama_cpp, "__version__", None),
    "gpu_offload": bool(llama_cpp.llama_supports_gpu_offload()),
    "symbols": [n for n in names if hasattr(lib, n)],
}))
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RuntimeInstallOutcome {
    /// Installed and the backend's symbols are present.
    Verified {
        backend: ToolkitBackend,
        package_version: Option<String>,
        symbols: Vec<String>,
    },
    /// Installed, but the library was built without the requested backend.
    NoGpuSupport {
        backend: ToolkitBackend,
        package_version: Option<String>,
        warning: String,
    },
    /// Nothing was installed: the build needs an SDK the host lacks.
    ToolkitMissing {
        toolkit: String,
        install_url: Option<String>,
        message: String,
        auto_install_available: bool,
    },
}

/// `.runforge/runtime.json` inside an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeMarker {
    pub backend: ToolkitBackend,
    pub package_version: Option<String>,
    #[serde(default)]
    pub model_ids: Vec<String>,
    pub installed_date: DateTime<Utc>,
}

fn marker_path(env_dir: &Path) -> PathBuf {
    env_dir.join(MARKER_DIR).join(MARKER_FILE)
}

/// The runtime marker of an environment, if present and readable.
pub fn read_runtime_marker(env_dir: &Path) -> Option<RuntimeMarker> {
    let bytes = std::fs::read(marker_path(env_dir)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn write_runtime_marker(env_dir: &Path, marker: &RuntimeMarker) -> Result<()> {
    let path = marker_path(env_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_vec_pretty(marker)?)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct VerifyReport {
    version: Option<String>,
    #[serde(default)]
    gpu_offload: bool,
    #[serde(default)]
    symbols: Vec<String>,
}

/// Wheel index tag for a detected CUDA version (`12.4` -> `cu124`).
pub(crate) fn cuda_wheel_tag(cuda_version: Option<&str>) -> String {
    let parsed = cuda_version.and_then(|v| {
        let (major, minor) = v.split_once('.')?;
        Some((major.parse::<u32>().ok()?, minor.parse::<u32>().ok()?))
    });
    match parsed {
        // Published wheels cover 12.1 through 12.5.
        Some((12, minor)) if minor >= 1 => format!("cu12{}", minor.min(5)),
        _ => FALLBACK_CUDA_WHEEL.to_string(),
    }
}

fn cmake_args(backend: ToolkitBackend) -> Option<&'static str> {
    match backend {
        ToolkitBackend::Rocm => Some("-DGGML_HIPBLAS=on"),
        ToolkitBackend::Metal => Some("-DGGML_METAL=on"),
        ToolkitBackend::Vulkan => Some("-DGGML_VULKAN=on"),
        ToolkitBackend::Openblas => Some("-DGGML_BLAS=ON -DGGML_BLAS_VENDOR=OpenBLAS"),
        ToolkitBackend::Cuda | ToolkitBackend::Cpu => None,
    }
}

fn expected_symbols(backend: ToolkitBackend) -> &'static [&'static str] {
    match backend {
        ToolkitBackend::Cuda => &["ggml_backend_cuda_init"],
        // HIP builds export the CUDA entry points.
        ToolkitBackend::Rocm => &["ggml_backend_hip_init", "ggml_backend_cuda_init"],
        ToolkitBackend::Vulkan => &["ggml_backend_vk_init"],
        ToolkitBackend::Metal => &["ggml_backend_metal_init"],
        ToolkitBackend::Openblas => &["ggml_backend_blas_init"],
        ToolkitBackend::Cpu => &[],
    }
}

impl EnvironmentStore {
    #[instrument(skip(self, detector), fields(environment = %name, backend = %backend))]
    pub async fn install_backend_runtime(
        &self,
        name: &str,
        backend: ToolkitBackend,
        detector: &ToolkitDetector,
        model_id: Option<&str>,
    ) -> Result<RuntimeInstallOutcome> {
        let env = self.get(name).await?;

        let mut args = vec!["install".to_string(), RUNTIME_PACKAGE.to_string()];
        let mut env_vars = Vec::new();
        match backend {
            ToolkitBackend::Cpu => {}
            ToolkitBackend::Cuda => {
                let status = detector.detect(backend, false).await;
                let tag = cuda_wheel_tag(status.detail_str("cuda_version"));
                args.extend([
                    "--prefer-binary".to_string(),
                    "--extra-index-url".to_string(),
                    format!("{}/{}", WHEEL_INDEX, tag),
                ]);
            }
            _ => {
                let status = detector.detect(backend, false).await;
                if !status.available {
                    warn!(toolkit = %status.toolkit_name, "Required toolkit missing, skipping build");
                    return Ok(RuntimeInstallOutcome::ToolkitMissing {
                        auto_install_available: backend == ToolkitBackend::Vulkan
                            && detector.probe().os() == "windows",
                        toolkit: status.toolkit_name,
                        install_url: status.install_url,
                        message: status.message,
                    });
                }
                args.extend(["--no-cache-dir".to_string(), "--force-reinstall".to_string()]);
                if let Some(flags) = cmake_args(backend) {
                    env_vars.push(("CMAKE_ARGS", flags.to_string()));
                    env_vars.push(("FORCE_CMAKE", "1".to_string()));
                }
            }
        }

        self.pip_with_lock_retry(&env.python_path, &args, &env_vars)
            .await
            .map_err(|stderr| {
                ForgeError::new(
                    ErrorCode::PackageInstallFailed,
                    format!("Failed to install {} for {}", RUNTIME_PACKAGE, backend),
                )
                .with_internal_message(stderr)
            })?;

        let report = self.verify_runtime(&env.python_path).await?;
        let outcome = classify(backend, report);

        let mut model_ids = read_runtime_marker(&env.path)
            .filter(|m| m.backend == backend)
            .map(|m| m.model_ids)
            .unwrap_or_default();
        if let Some(id) = model_id {
            if !model_ids.iter().any(|m| m == id) {
                model_ids.push(id.to_string());
            }
        }
        let package_version = match &outcome {
            RuntimeInstallOutcome::Verified { package_version, .. }
            | RuntimeInstallOutcome::NoGpuSupport { package_version, .. } => package_version.clone(),
            RuntimeInstallOutcome::ToolkitMissing { .. } => None,
        };
        write_runtime_marker(
            &env.path,
            &RuntimeMarker {
                backend,
                package_version,
                model_ids,
                installed_date: Utc::now(),
            },
        )?;

        match &outcome {
            RuntimeInstallOutcome::NoGpuSupport { warning, .. } => warn!(%warning, "Runtime installed without GPU support"),
            _ => info!("Runtime installed and verified"),
        }
        Ok(outcome)
    }

    async fn verify_runtime(&self, python: &Path) -> Result<VerifyReport> {
        let spec = CommandSpec::new(python.to_string_lossy(), Duration::from_secs(60))
            .args(["-c", VERIFY_SCRIPT]);
        let output = self.runner().run(spec).await?;
        if !output.success() {
            return Err(ForgeError::new(
                ErrorCode::PackageInstallFailed,
                format!("{} installed but cannot be imported", RUNTIME_PACKAGE),
            )
            .with_internal_message(tail(&output.stderr, 2000)));
        }
        let line = output.stdout.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        serde_json::from_str(line.trim()).map_err(|e| {
            ForgeError::new(
                ErrorCode::PackageInstallFailed,
                format!("Unreadable {} verification output", RUNTIME_PACKAGE),
            )
            .with_source(e)
        })
    }
}

fn classify(backend: ToolkitBackend, report: VerifyReport) -> RuntimeInstallOutcome {
    let wanted = expected_symbols(backend);
    let found: Vec<String> = report
        .symbols
        .into_iter()
        .filter(|s| wanted.contains(&s.as_str()))
        .collect();

    let supported = match backend {
        ToolkitBackend::Cpu => true,
        ToolkitBackend::Openblas => !found.is_empty(),
        _ => report.gpu_offload && !found.is_empty(),
    };
    if supported {
        RuntimeInstallOutcome::Verified {
            backend,
            package_version: report.version,
            symbols: found,
        }
    } else {
        RuntimeInstallOutcome::NoGpuSupport {
            backend,
            package_version: report.version,
            warning: format!(
                "{} is installed but was built without {} support",
                RUNTIME_PACKAGE, backend
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environments::store::tests::{store, FakePython};
    use crate::toolkit::{HostProbe, ToolkitCache, ToolkitStatus};
    use crate::process::ProcessOutput;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NoHost;

    #[async_trait]
    impl HostProbe for NoHost {
        async fn run(&self, _program: &str, _args: &[&str]) -> Option<ProcessOutput> {
            None
        }
        fn env_var(&self, _key: &str) -> Option<String> {
            None
        }
        fn dir_exists(&self, _path: &Path) -> bool {
            false
        }
        fn os(&self) -> &str {
            "windows"
        }
        fn arch(&self) -> &str {
            "x86_64"
        }
    }

    fn detector() -> ToolkitDetector {
        ToolkitDetector::new(Arc::new(ToolkitCache::in_memory()), Arc::new(NoHost))
    }

    #[test]
    fn test_cuda_wheel_tag() {
        assert_eq!(cuda_wheel_tag(Some("12.4")), "cu124");
        assert_eq!(cuda_wheel_tag(Some("12.8")), "cu125");
        assert_eq!(cuda_wheel_tag(Some("11.8")), "cu121");
        assert_eq!(cuda_wheel_tag(None), "cu121");
    }

    #[tokio::test]
    async fn test_missing_sdk_is_structured() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakePython::default());
        let store = store(dir.path(), runner.clone());
        store.create("vision").await.unwrap();

        let outcome = store
            .install_backend_runtime("vision", ToolkitBackend::Vulkan, &detector(), None)
            .await
            .unwrap();
        match outcome {
            RuntimeInstallOutcome::ToolkitMissing { toolkit, install_url, auto_install_available, .. } => {
                assert_eq!(toolkit, "Vulkan SDK");
                assert!(install_url.is_some());
                assert!(auto_install_available);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(runner.install_calls().is_empty());
    }

    #[tokio::test]
    async fn test_cuda_install_verified_and_marked() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakePython::default());
        let store = store(dir.path(), runner.clone());
        store.create("chat").await.unwrap();

        let detector = detector();
        detector.cache().insert(
            ToolkitBackend::Cuda,
            ToolkitStatus::available("NVIDIA CUDA Toolkit", "ok").with_detail("cuda_version", "12.4"),
        );

        runner.queue(0, "", "");
        runner.queue(
            0,
            r#"{"version": "0.3.2", "gpu_offload": true, "symbols": ["ggml_backend_cuda_init"]}"#,
            "",
        );
        let outcome = store
            .install_backend_runtime("chat", ToolkitBackend::Cuda, &detector, Some("llama-3-8b"))
            .await
            .unwrap();

        assert!(matches!(outcome, RuntimeInstallOutcome::Verified { .. }));
        let install = &runner.install_calls()[0];
        assert!(install.iter().any(|a| a.ends_with("/whl/cu124")));

        let marker = read_runtime_marker(&store.env_dir("chat")).unwrap();
        assert_eq!(marker.backend, ToolkitBackend::Cuda);
        assert_eq!(marker.package_version.as_deref(), Some("0.3.2"));
        assert_eq!(marker.model_ids, vec!["llama-3-8b"]);
    }

    #[tokio::test]
    async fn test_cpu_only_build_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakePython::default());
        let store = store(dir.path(), runner.clone());
        store.create("chat").await.unwrap();

        runner.queue(0, "", "");
        runner.queue(0, r#"{"version": "0.3.2", "gpu_offload": false, "symbols": []}"#, "");
        let outcome = store
            .install_backend_runtime("chat", ToolkitBackend::Cuda, &detector(), None)
            .await
            .unwrap();
        assert!(matches!(outcome, RuntimeInstallOutcome::NoGpuSupport { .. }));
    }
}
