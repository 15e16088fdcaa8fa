use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

const MAX_BIN_DEPTH: usize = 3;

fn library_path_var() -> &'static str {
    if cfg!(windows) {
        "PATH"
    } else if cfg!(target_os = "macos") {
        "DYLD_LIBRARY_PATH"
    } else {
        "LD_LIBRARY_PATH"
    }
}

/// `dir` plus every nested `bin` directory up to three levels down.
fn candidate_dirs(dir: &Path) -> Vec<PathBuf> {
    let mut found = vec![dir.to_path_buf()];
    let mut frontier = vec![dir.to_path_buf()];
    for _ in 0..MAX_BIN_DEPTH {
        let mut next = Vec::new();
        for current in &frontier {
            let Ok(entries) = std::fs::read_dir(current) else { continue };
            for entry in entries.flatten() {
                if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let path = entry.path();
                if entry.file_name().eq_ignore_ascii_case("bin") {
                    found.push(path.clone());
                }
                next.push(path);
            }
        }
        frontier = next;
    }
    found
}

/// Prepend `dir` and its nested `bin` directories to the host's dynamic
/// library search path for this process. Returns the directories added.
pub fn register_library_path(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    let var = library_path_var();
    let current: Vec<PathBuf> = std::env::var_os(var)
        .map(|v| std::env::split_paths(&v).collect())
        .unwrap_or_default();

    let added: Vec<PathBuf> = candidate_dirs(dir)
        .into_iter()
        .filter(|d| !current.contains(d))
        .collect();
    if added.is_empty() {
        return added;
    }

    let joined: OsString = match std::env::join_paths(added.iter().chain(current.iter())) {
        Ok(joined) => joined,
        Err(e) => {
            debug!(error = %e, "Cannot extend library path");
            return Vec::new();
        }
    };
    std::env::set_var(var, joined);
    debug!(var, added = added.len(), "Library search path extended");
    added
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_bin_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("build").join("bin")).unwrap();
        std::fs::create_dir_all(dir.path().join("a").join("b").join("c").join("d").join("bin")).unwrap();

        let found = candidate_dirs(dir.path());
        assert!(found.contains(&dir.path().join("build").join("bin")));
        assert!(!found.iter().any(|p| p.ends_with("d/bin")));
    }

    #[test]
    fn test_registration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        let first = register_library_path(dir.path());
        assert_eq!(first.len(), 2);
        assert!(register_library_path(dir.path()).is_empty());
    }
}
