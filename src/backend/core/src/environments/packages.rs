use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::normalize_package_name;

/// stderr fragments of a Windows file lock held by another process.
const FILE_LOCK_SIGNATURES: [&str; 3] = [
    "WinError 32",
    "being used by another process",
    "PermissionError: [WinError 5]",
];

/// pip failures worth retrying: another process still holds a file.
pub(super) fn is_file_lock_error(stderr: &str) -> bool {
    FILE_LOCK_SIGNATURES.iter().any(|sig| stderr.contains(sig))
}

/// `site-packages` directories of an environment (normally one).
pub(super) fn site_packages_dirs(env_dir: &Path) -> Vec<PathBuf> {
    let windows = env_dir.join("Lib").join("site-packages");
    if windows.is_dir() {
        return vec![windows];
    }
    let Ok(entries) = std::fs::read_dir(env_dir.join("lib")) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path().join("site-packages"))
        .filter(|p| p.is_dir())
        .collect()
}

/// Normalized names of every distribution with a `.dist-info` directory.
pub(super) fn installed_distributions(env_dir: &Path) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for dir in site_packages_dirs(env_dir) {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(stem) = file_name.to_str().and_then(|n| n.strip_suffix(".dist-info")) else {
                continue;
            };
            // `{name}-{version}`; wheel names never contain '-' in the name part.
            let name = stem.split_once('-').map_or(stem, |(name, _)| name);
            names.insert(normalize_package_name(name));
        }
    }
    names
}

/// Total size of regular files below `dir`. Symlinks are not followed.
pub(super) fn dir_size(dir: &Path) -> u64 {
    let mut total = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else { continue };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else { continue };
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
    }
    total
}

/// Last `max` bytes of pip output; the error is at the end.
pub(super) fn tail(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_lock_signatures() {
        assert!(is_file_lock_error(
            "OSError: [WinError 32] The process cannot access the file because it is being used by another process"
        ));
        assert!(is_file_lock_error("PermissionError: [WinError 5] Access is denied"));
        assert!(!is_file_lock_error("ERROR: No matching distribution found for nope"));
    }

    #[test]
    fn test_installed_distributions_scan() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("lib").join("python3.11").join("site-packages");
        std::fs::create_dir_all(site.join("llama_cpp_python-0.2.90.dist-info")).unwrap();
        std::fs::create_dir_all(site.join("PyYAML-6.0.1.dist-info")).unwrap();
        std::fs::create_dir_all(site.join("llama_cpp")).unwrap();

        let names = installed_distributions(dir.path());
        assert!(names.contains("llama_cpp_python"));
        assert!(names.contains("pyyaml"));
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("0123456789abc", 3), "...abc");
    }
}
