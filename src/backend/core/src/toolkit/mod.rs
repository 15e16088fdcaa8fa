//! Toolkit detection: which GPU/compute SDKs the host provides.
//!
//! Probes are slow (vendor CLIs) and results rarely change, so every result
//! goes through a [`ToolkitCache`] until it is cleared. A failed probe is a
//! negative result, never an error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::ForgeError;

mod cache;
mod detector;

pub use cache::ToolkitCache;
pub use detector::{HostProbe, SystemProbe, ToolkitDetector};

/// Backends the detector knows how to probe for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolkitBackend {
    Cuda,
    Rocm,
    Vulkan,
    Metal,
    Openblas,
    Cpu,
}

impl ToolkitBackend {
    pub const ALL: [ToolkitBackend; 6] = [
        Self::Cuda,
        Self::Rocm,
        Self::Vulkan,
        Self::Metal,
        Self::Openblas,
        Self::Cpu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Rocm => "rocm",
            Self::Vulkan => "vulkan",
            Self::Metal => "metal",
            Self::Openblas => "openblas",
            Self::Cpu => "cpu",
        }
    }

    /// Human name of the SDK this backend needs.
    pub fn toolkit_name(&self) -> &'static str {
        match self {
            Self::Cuda => "NVIDIA CUDA Toolkit",
            Self::Rocm => "AMD ROCm",
            Self::Vulkan => "Vulkan SDK",
            Self::Metal => "Apple Metal",
            Self::Openblas => "OpenBLAS",
            Self::Cpu => "CPU",
        }
    }

    pub fn install_url(&self) -> Option<&'static str> {
        match self {
            Self::Cuda => Some("https://developer.nvidia.com/cuda-downloads"),
            Self::Rocm => Some("https://rocm.docs.amd.com/projects/install-on-linux/en/latest/"),
            Self::Vulkan => Some("https://vulkan.lunarg.com/sdk/home"),
            Self::Metal => Some("https://developer.apple.com/metal/"),
            Self::Openblas => Some("https://www.openblas.net/"),
            Self::Cpu => None,
        }
    }
}

impl fmt::Display for ToolkitBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolkitBackend {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cuda" => Ok(Self::Cuda),
            "rocm" | "hip" => Ok(Self::Rocm),
            "vulkan" => Ok(Self::Vulkan),
            "metal" => Ok(Self::Metal),
            "openblas" => Ok(Self::Openblas),
            "cpu" => Ok(Self::Cpu),
            other => Err(ForgeError::validation(format!("Unknown toolkit backend '{}'", other))),
        }
    }
}

/// Detection result, stored verbatim in the cache file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolkitStatus {
    pub available: bool,
    pub toolkit_name: String,
    pub message: String,
    #[serde(default)]
    pub install_url: Option<String>,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl ToolkitStatus {
    pub fn available(toolkit_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            available: true,
            toolkit_name: toolkit_name.into(),
            message: message.into(),
            install_url: None,
            details: Map::new(),
        }
    }

    pub fn unavailable(backend: ToolkitBackend, message: impl Into<String>) -> Self {
        Self {
            available: false,
            toolkit_name: backend.toolkit_name().to_string(),
            message: message.into(),
            install_url: backend.install_url().map(str::to_string),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(Value::as_str)
    }
}
