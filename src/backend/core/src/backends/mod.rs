//! Prebuilt llama.cpp backend installs.
//!
//! A backend lives in `{backends_dir}/{id}` and counts as installed only while
//! its `installed.json` marker is present, parses, and names that directory.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ForgeError;
use crate::toolkit::ToolkitBackend;

mod archive;
mod assets;
mod download;
mod installer;
mod libpath;
mod marker;
mod release;

pub use assets::{asset_name, cudart_asset_name, resolve_asset, select_cuda_version, CudaVersion};
pub use installer::{
    BackendInfo, BackendInstaller, BackendUpdate, InstallStatus, InstalledBackend, UninstallOutcome,
    UpdateReport,
};
pub use libpath::register_library_path;
pub use marker::{read_marker, InstalledMarker, MARKER_FILE};
pub use release::{ReleaseAsset, ReleaseClient, ReleaseInfo};

/// Progress sink: percent (0-100) and a status line.
pub type Progress<'a> = &'a (dyn Fn(u8, &str) + Send + Sync);

// ═══════════════════════════════════════════════════════════════════════════════
// Backend ids
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendId {
    Cpu,
    Cuda,
    Vulkan,
    Hip,
    Sycl,
    Metal,
    OpenclAdreno,
}

/// Static facts about a backend build.
#[derive(Debug, Clone, Copy)]
pub struct BackendDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub size_mb: u32,
    pub requires_gpu: bool,
    /// `(os, arch)` pairs in `std::env::consts` spelling
    pub platforms: &'static [(&'static str, &'static str)],
}

const DESKTOP: &[(&str, &str)] = &[
    ("windows", "x86_64"),
    ("windows", "aarch64"),
    ("linux", "x86_64"),
    ("linux", "aarch64"),
    ("macos", "x86_64"),
    ("macos", "aarch64"),
];

impl BackendId {
    pub const ALL: [BackendId; 7] = [
        Self::Cpu,
        Self::Cuda,
        Self::Vulkan,
        Self::Hip,
        Self::Sycl,
        Self::Metal,
        Self::OpenclAdreno,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Vulkan => "vulkan",
            Self::Hip => "hip",
            Self::Sycl => "sycl",
            Self::Metal => "metal",
            Self::OpenclAdreno => "opencl-adreno",
        }
    }

    pub fn descriptor(&self) -> BackendDescriptor {
        match self {
            Self::Cpu => BackendDescriptor {
                name: "CPU",
                description: "Portable CPU build, works everywhere",
                size_mb: 30,
                requires_gpu: false,
                platforms: DESKTOP,
            },
            Self::Cuda => BackendDescriptor {
                name: "NVIDIA CUDA",
                description: "NVIDIA GPUs via CUDA",
                size_mb: 250,
                requires_gpu: true,
                platforms: &[("windows", "x86_64")],
            },
            Self::Vulkan => BackendDescriptor {
                name: "Vulkan",
                description: "Cross-vendor GPU acceleration via Vulkan",
                size_mb: 40,
                requires_gpu: true,
                platforms: &[("windows", "x86_64"), ("linux", "x86_64")],
            },
            Self::Hip => BackendDescriptor {
                name: "AMD HIP",
                description: "AMD Radeon GPUs via ROCm/HIP",
                size_mb: 300,
                requires_gpu: true,
                platforms: &[("windows", "x86_64")],
            },
            Self::Sycl => BackendDescriptor {
                name: "Intel SYCL",
                description: "Intel GPUs via oneAPI SYCL",
                size_mb: 120,
                requires_gpu: true,
                platforms: &[("windows", "x86_64")],
            },
            Self::Metal => BackendDescriptor {
                name: "Apple Metal",
                description: "Apple Silicon GPUs via Metal",
                size_mb: 30,
                requires_gpu: true,
                platforms: &[("macos", "aarch64")],
            },
            Self::OpenclAdreno => BackendDescriptor {
                name: "OpenCL Adreno",
                description: "Qualcomm Adreno GPUs on Windows on ARM",
                size_mb: 40,
                requires_gpu: true,
                platforms: &[("windows", "aarch64")],
            },
        }
    }

    pub fn supports(&self, platform: &Platform) -> bool {
        self.descriptor()
            .platforms
            .iter()
            .any(|(os, arch)| *os == platform.os && *arch == platform.arch)
    }

    /// System toolkit the detector checks for this backend, if any.
    pub fn toolkit(&self) -> Option<ToolkitBackend> {
        match self {
            Self::Cpu => Some(ToolkitBackend::Cpu),
            Self::Cuda => Some(ToolkitBackend::Cuda),
            Self::Vulkan => Some(ToolkitBackend::Vulkan),
            Self::Hip => Some(ToolkitBackend::Rocm),
            Self::Metal => Some(ToolkitBackend::Metal),
            Self::Sycl | Self::OpenclAdreno => None,
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendId {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ForgeError::backend_not_found(s))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Platform
// ═══════════════════════════════════════════════════════════════════════════════

/// Target platform for asset selection. Injectable so that any host can
/// exercise any platform's naming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    pub fn host() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }

    /// OS part of upstream asset names.
    pub fn os_token(&self) -> &'static str {
        match self.os.as_str() {
            "windows" => "win",
            "macos" => "macos",
            _ => "ubuntu",
        }
    }

    /// Architecture part of upstream asset names.
    pub fn arch_token(&self) -> &'static str {
        match self.arch.as_str() {
            "aarch64" | "arm64" => "arm64",
            _ => "x64",
        }
    }

    pub fn archive_ext(&self) -> &'static str {
        if self.is_windows() {
            "zip"
        } else {
            "tar.gz"
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_id_parsing() {
        assert_eq!("opencl-adreno".parse::<BackendId>().unwrap(), BackendId::OpenclAdreno);
        assert_eq!("CUDA".parse::<BackendId>().unwrap(), BackendId::Cuda);
        let err = "tpu".parse::<BackendId>().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::BackendNotFound);
        assert_eq!(serde_json::to_value(BackendId::OpenclAdreno).unwrap(), "opencl-adreno");
    }

    #[test]
    fn test_platform_filtering() {
        let win = Platform::new("windows", "x86_64");
        let mac = Platform::new("macos", "aarch64");
        assert!(BackendId::Cuda.supports(&win));
        assert!(!BackendId::Cuda.supports(&mac));
        assert!(BackendId::Metal.supports(&mac));
        assert!(BackendId::Cpu.supports(&mac));
        assert_eq!(win.os_token(), "win");
        assert_eq!(mac.arch_token(), "arm64");
    }
}
