use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{ErrorCode, ForgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
}

fn kind_of(path: &Path) -> Option<ArchiveKind> {
    let name = path.file_name()?.to_str()?.to_ascii_lowercase();
    if name.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else if name.ends_with(".tar") {
        Some(ArchiveKind::Tar)
    } else {
        None
    }
}

/// Unpack `archive` into `dest` on a blocking thread. Entries that would
/// escape `dest` are rejected by both extractors.
pub(super) async fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest))
        .await
        .map_err(|e| ForgeError::internal(format!("extraction task panicked: {}", e)))?
}

fn extract_blocking(archive: &Path, dest: &Path) -> Result<()> {
    let kind = kind_of(archive).ok_or_else(|| {
        ForgeError::new(
            ErrorCode::ExtractionFailed,
            format!("Unsupported archive format: {}", archive.display()),
        )
    })?;
    fs::create_dir_all(dest)?;
    info!(archive = %archive.display(), dest = %dest.display(), "Extracting archive");

    let file = BufReader::new(File::open(archive)?);
    let result = match kind {
        ArchiveKind::Zip => zip::ZipArchive::new(file)
            .and_then(|mut zip| zip.extract(dest))
            .map_err(|e| e.to_string()),
        ArchiveKind::TarGz => tar::Archive::new(GzDecoder::new(file))
            .unpack(dest)
            .map_err(|e| e.to_string()),
        ArchiveKind::Tar => tar::Archive::new(file).unpack(dest).map_err(|e| e.to_string()),
    };
    result.map_err(|reason| {
        ForgeError::new(ErrorCode::ExtractionFailed, "Failed to extract archive")
            .with_internal_message(format!("{}: {}", archive.display(), reason))
    })
}

/// Move the extracted tree from `staging` to `final_dir`. A single top-level
/// directory is hoisted so that the backend's files sit directly in
/// `final_dir`.
pub(super) fn finalize(staging: &Path, final_dir: &Path) -> Result<()> {
    let entries: Vec<PathBuf> = fs::read_dir(staging)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();

    let root = match entries.as_slice() {
        [only] if only.is_dir() => only.clone(),
        _ => staging.to_path_buf(),
    };
    if final_dir.exists() {
        fs::remove_dir_all(final_dir)?;
    }
    fs::rename(&root, final_dir)?;
    if root != staging {
        let _ = fs::remove_dir_all(staging);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// A zip with `files` as `(path, contents)`.
    pub(crate) fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (path, contents) in files {
                writer.start_file(*path, options).unwrap();
                writer.write_all(contents).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[tokio::test]
    async fn test_zip_extract_and_hoist() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg.zip");
        fs::write(&archive, zip_bytes(&[("build/bin/llama-server.exe", b"exe"), ("build/bin/ggml.dll", b"dll")])).unwrap();

        let staging = dir.path().join(".staging");
        extract(&archive, &staging).await.unwrap();
        let final_dir = dir.path().join("vulkan");
        finalize(&staging, &final_dir).unwrap();

        assert!(final_dir.join("bin").join("llama-server.exe").is_file());
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn test_tar_gz_extract() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg.tar.gz");
        {
            let gz = flate2::write::GzEncoder::new(File::create(&archive).unwrap(), flate2::Compression::fast());
            let mut builder = tar::Builder::new(gz);
            let mut header = tar::Header::new_gnu();
            header.set_size(3);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, "llama-server", &b"elf"[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let dest = dir.path().join("out");
        extract(&archive, &dest).await.unwrap();
        assert_eq!(fs::read(dest.join("llama-server")).unwrap(), b"elf");
    }

    #[tokio::test]
    async fn test_unknown_format_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg.rar");
        fs::write(&archive, b"x").unwrap();
        let err = extract(&archive, &dir.path().join("out")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExtractionFailed);
    }
}
