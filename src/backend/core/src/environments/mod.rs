//! Named Python virtual environments under the providers directory.
//!
//! An environment is usable only when its interpreter exists at the
//! platform-specific path; directories without one are ignored by
//! [`EnvironmentStore::list`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{ErrorCode, ForgeError, Result};

mod packages;
mod runtime;
mod store;

pub use runtime::{read_runtime_marker, RuntimeInstallOutcome, RuntimeMarker, RUNTIME_PACKAGE};
pub use store::EnvironmentStore;

/// One environment as listed by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub path: PathBuf,
    pub python_path: PathBuf,
    pub package_count: usize,
    pub size_bytes: u64,
}

/// An installed distribution as reported by pip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
}

/// Outcome of a multi-package install or uninstall.
///
/// `success` is false as soon as one spec failed; the other specs may still
/// have been applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInstallReport {
    pub success: bool,
    pub installed: Vec<String>,
    pub failed: Vec<String>,
    pub errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
    pub returncode: i32,
}

/// Interpreter location inside an environment root.
pub fn interpreter_path(env_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        env_dir.join("Scripts").join("python.exe")
    } else {
        env_dir.join("bin").join("python")
    }
}

pub fn is_valid_name(name: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-][A-Za-z0-9._-]*$").expect("static regex"))
        .is_match(name)
}

pub fn validate_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(ForgeError::new(
            ErrorCode::InvalidEnvironmentName,
            format!(
                "Invalid environment name '{}': use letters, digits, '.', '_' or '-' and do not start with '.'",
                name
            ),
        ))
    }
}

/// PEP 503 style normalization, with `_` as the separator used in
/// `.dist-info` directory names.
pub fn normalize_package_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            if !last_sep {
                out.push('_');
            }
            last_sep = true;
        } else {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        }
    }
    out
}

/// Distribution name of a requirement spec (`numpy>=1.26` -> `numpy`).
pub fn spec_package_name(spec: &str) -> &str {
    let end = spec
        .find(|c: char| matches!(c, '<' | '>' | '=' | '!' | '~' | '[' | ';' | '@' | ' '))
        .unwrap_or(spec.len());
    spec[..end].trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_rules() {
        assert!(is_valid_name("llama-7b_q4.v2"));
        assert!(!is_valid_name(".hidden"));
        assert!(!is_valid_name("a/b"));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name(""));
        assert_eq!(validate_name("..").unwrap_err().code(), ErrorCode::InvalidEnvironmentName);
    }

    #[test]
    fn test_normalize_package_name() {
        assert_eq!(normalize_package_name("Llama-CPP.python"), "llama_cpp_python");
        assert_eq!(normalize_package_name("llama_cpp__python"), "llama_cpp_python");
    }

    #[test]
    fn test_spec_package_name() {
        assert_eq!(spec_package_name("numpy>=1.26"), "numpy");
        assert_eq!(spec_package_name("uvicorn[standard]"), "uvicorn");
        assert_eq!(spec_package_name("torch"), "torch");
    }
}
