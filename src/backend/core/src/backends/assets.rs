//! Upstream asset naming and lookup.
//!
//! Assets follow `llama-{tag}-bin-{os}[-{backend}]-{arch}.{ext}`. Names drift
//! between releases, so lookup falls back from the exact name through arch
//! aliases and the other archive extension to a substring match.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use super::{BackendId, Platform, ReleaseAsset};
use crate::error::{ForgeError, Result};

const ARCHIVE_EXTS: [&str; 2] = ["zip", "tar.gz"];
const SAMPLE_SIZE: usize = 10;

/// Backend tokens that mark a non-default build.
const BACKEND_TOKENS: [&str; 6] = ["cuda", "vulkan", "hip", "sycl", "opencl", "kompute"];

/// A CUDA sub-version such as 12.4, ordered numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CudaVersion {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for CudaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

fn cuda_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"cuda-(\d+)\.(\d+)").expect("static regex"))
}

/// Highest `cuda-M.m` token, compared as numbers, among the llama builds for
/// `platform`. Runtime (`cudart-*`) and other-platform assets are ignored.
pub fn select_cuda_version<'a>(
    names: impl IntoIterator<Item = &'a str>,
    platform: &Platform,
) -> Option<CudaVersion> {
    let os_marker = format!("bin-{}-", platform.os_token());
    let aliases = arch_aliases(platform.arch_token());
    names
        .into_iter()
        .filter(|name| {
            name.starts_with("llama-")
                && name.contains(&os_marker)
                && aliases.iter().any(|a| name.contains(&format!("-{}.", a)))
        })
        .flat_map(|name| cuda_token_re().captures_iter(name))
        .filter_map(|c| {
            Some(CudaVersion {
                major: c[1].parse().ok()?,
                minor: c[2].parse().ok()?,
            })
        })
        .max()
}

fn backend_token(backend: BackendId, platform: &Platform, cuda: Option<CudaVersion>) -> String {
    match backend {
        BackendId::Cpu if platform.is_windows() => "cpu".to_string(),
        BackendId::Cpu | BackendId::Metal => String::new(),
        BackendId::Cuda => match cuda {
            Some(v) => format!("cuda-{}", v),
            None => "cuda".to_string(),
        },
        BackendId::Vulkan => "vulkan".to_string(),
        BackendId::Hip => "hip-radeon".to_string(),
        BackendId::Sycl => "sycl".to_string(),
        BackendId::OpenclAdreno => "opencl-adreno".to_string(),
    }
}

fn compose(tag: &str, os: &str, backend: &str, arch: &str, ext: &str) -> String {
    if backend.is_empty() {
        format!("llama-{}-bin-{}-{}.{}", tag, os, arch, ext)
    } else {
        format!("llama-{}-bin-{}-{}-{}.{}", tag, os, backend, arch, ext)
    }
}

/// The expected asset name for `backend` on `platform`.
pub fn asset_name(tag: &str, backend: BackendId, platform: &Platform, cuda: Option<CudaVersion>) -> String {
    compose(
        tag,
        platform.os_token(),
        &backend_token(backend, platform, cuda),
        platform.arch_token(),
        platform.archive_ext(),
    )
}

pub fn cudart_asset_name(cuda: CudaVersion) -> String {
    format!("cudart-llama-bin-win-cuda-{}-x64.zip", cuda)
}

fn arch_aliases(arch_token: &str) -> &'static [&'static str] {
    match arch_token {
        "arm64" => &["arm64", "aarch64"],
        _ => &["x64", "x86_64", "amd64"],
    }
}

/// Find the release asset for `backend`. The error names the expected
/// pattern and a sample of what the release does contain.
pub fn resolve_asset<'a>(
    assets: &'a [ReleaseAsset],
    tag: &str,
    backend: BackendId,
    platform: &Platform,
    cuda: Option<CudaVersion>,
) -> Result<&'a ReleaseAsset> {
    let expected = asset_name(tag, backend, platform, cuda);
    let by_name = |name: &str| assets.iter().find(|a| a.name == name);

    if let Some(asset) = by_name(&expected) {
        return Ok(asset);
    }

    let os = platform.os_token();
    let token = backend_token(backend, platform, cuda);
    let ext = platform.archive_ext();
    let other_ext = ARCHIVE_EXTS.iter().copied().filter(|e| *e != ext);

    for alias in arch_aliases(platform.arch_token()) {
        for ext in std::iter::once(ext).chain(other_ext.clone()) {
            if let Some(asset) = by_name(&compose(tag, os, &token, alias, ext)) {
                return Ok(asset);
            }
        }
    }

    let os_marker = format!("bin-{}", os);
    let found = assets.iter().find(|asset| {
        let name = asset.name.to_ascii_lowercase();
        name.starts_with("llama-")
            && name.contains(&os_marker)
            && ARCHIVE_EXTS.iter().any(|e| name.ends_with(e))
            && arch_aliases(platform.arch_token()).iter().any(|a| name.contains(a))
            && if token.is_empty() {
                !BACKEND_TOKENS.iter().any(|t| name.contains(t))
            } else {
                name.contains(&token)
            }
    });

    found.ok_or_else(|| {
        let sample: Vec<String> = assets.iter().take(SAMPLE_SIZE).map(|a| a.name.clone()).collect();
        ForgeError::asset_not_found(&expected, &sample)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assets(names: &[&str]) -> Vec<ReleaseAsset> {
        names
            .iter()
            .map(|n| ReleaseAsset {
                name: n.to_string(),
                browser_download_url: format!("https://example.invalid/{}", n),
                size: 1,
                digest: None,
            })
            .collect()
    }

    #[test]
    fn test_cuda_version_numeric_max() {
        let names = [
            "llama-b1-bin-win-cuda-12.4-x64.zip",
            "llama-b1-bin-win-cuda-13.1-x64.zip",
            "llama-b1-bin-win-cuda-9.9-x64.zip",
        ];
        let win = Platform::new("windows", "x86_64");
        let v = select_cuda_version(names, &win).unwrap();
        assert_eq!(v.to_string(), "13.1");
        assert!(select_cuda_version(["llama-b1-bin-win-vulkan-x64.zip"], &win).is_none());
    }

    #[test]
    fn test_cuda_version_ignores_other_platforms_and_runtime() {
        let names = [
            "llama-b1-bin-win-cuda-12.4-x64.zip",
            "llama-b1-bin-ubuntu-cuda-13.0-x64.tar.gz",
            "llama-b1-bin-win-cuda-12.9-arm64.zip",
            "cudart-llama-bin-win-cuda-13.0-x64.zip",
        ];
        let win = Platform::new("windows", "x86_64");
        assert_eq!(select_cuda_version(names, &win).unwrap().to_string(), "12.4");

        let linux = Platform::new("linux", "x86_64");
        assert_eq!(select_cuda_version(names, &linux).unwrap().to_string(), "13.0");

        let mac = Platform::new("macos", "aarch64");
        assert!(select_cuda_version(names, &mac).is_none());
    }

    #[test]
    fn test_asset_names() {
        let win = Platform::new("windows", "x86_64");
        let linux = Platform::new("linux", "x86_64");
        let mac = Platform::new("macos", "aarch64");
        assert_eq!(asset_name("b4000", BackendId::Cpu, &win, None), "llama-b4000-bin-win-cpu-x64.zip");
        assert_eq!(asset_name("b4000", BackendId::Cpu, &linux, None), "llama-b4000-bin-ubuntu-x64.tar.gz");
        assert_eq!(asset_name("b4000", BackendId::Metal, &mac, None), "llama-b4000-bin-macos-arm64.tar.gz");
        let v = CudaVersion { major: 12, minor: 4 };
        assert_eq!(asset_name("b4000", BackendId::Cuda, &win, Some(v)), "llama-b4000-bin-win-cuda-12.4-x64.zip");
        assert_eq!(cudart_asset_name(v), "cudart-llama-bin-win-cuda-12.4-x64.zip");
    }

    #[test]
    fn test_extension_swap_fallback() {
        let list = assets(&["llama-b4000-bin-ubuntu-vulkan-x64.zip"]);
        let linux = Platform::new("linux", "x86_64");
        let found = resolve_asset(&list, "b4000", BackendId::Vulkan, &linux, None).unwrap();
        assert_eq!(found.name, "llama-b4000-bin-ubuntu-vulkan-x64.zip");
    }

    #[test]
    fn test_substring_fallback_skips_other_backends() {
        let list = assets(&[
            "llama-b4000-bin-ubuntu-vulkan-x64.tar.gz",
            "llama-b4000-bin-ubuntu-x64-static.tar.gz",
        ]);
        let linux = Platform::new("linux", "x86_64");
        let found = resolve_asset(&list, "b4000", BackendId::Cpu, &linux, None).unwrap();
        assert_eq!(found.name, "llama-b4000-bin-ubuntu-x64-static.tar.gz");
    }

    #[test]
    fn test_unresolved_lists_pattern_and_sample() {
        let list = assets(&["llama-b4000-bin-macos-arm64.zip"]);
        let win = Platform::new("windows", "x86_64");
        let err = resolve_asset(&list, "b4000", BackendId::Sycl, &win, None).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::AssetNotFound);
        assert!(err.user_message().contains("llama-b4000-bin-win-sycl-x64.zip"));
        assert!(err.user_message().contains("llama-b4000-bin-macos-arm64.zip"));
    }
}
