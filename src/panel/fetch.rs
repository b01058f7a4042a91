//! Code materialization strategies for the deploy pipeline.
//!
//! The pipeline only needs "populate this directory or fail"; the
//! [`SourceFetcher`] trait is that seam. [`DefaultFetcher`] extracts uploaded
//! archives (ZIP or gzip tarball, by magic bytes) and clones git repositories.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::models::DeploySource;

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Populate `workspace` (already empty) from `source`.
    async fn materialize(&self, source: &DeploySource, workspace: &Path) -> Result<()>;
}

/// Archive extraction plus `git2` clone.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFetcher;

#[async_trait]
impl SourceFetcher for DefaultFetcher {
    async fn materialize(&self, source: &DeploySource, workspace: &Path) -> Result<()> {
        let workspace = workspace.to_path_buf();
        match source {
            DeploySource::Archive { staged } => {
                let staged = staged.clone();
                tokio::task::spawn_blocking(move || extract_archive(&staged, &workspace))
                    .await
                    .context("Archive extraction task panicked")?
            }
            DeploySource::Repository { url } => {
                let url = url.clone();
                tokio::task::spawn_blocking(move || clone_repository(&url, &workspace))
                    .await
                    .context("Clone task panicked")?
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

/// Sniff the archive format from its leading bytes.
pub fn detect_format(header: &[u8]) -> Option<ArchiveFormat> {
    match header {
        [b'P', b'K', 0x03, 0x04, ..] | [b'P', b'K', 0x05, 0x06, ..] => Some(ArchiveFormat::Zip),
        [0x1f, 0x8b, ..] => Some(ArchiveFormat::TarGz),
        _ => None,
    }
}

/// Extract `archive` into `dest`, skipping entries whose names would land
/// outside `dest`.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let mut file = File::open(archive)
        .with_context(|| format!("Failed to open archive {}", archive.display()))?;
    let mut header = [0u8; 4];
    let read = file.read(&mut header).context("Failed to read archive header")?;
    file.seek(SeekFrom::Start(0))
        .context("Failed to rewind archive")?;

    match detect_format(&header[..read]) {
        Some(ArchiveFormat::Zip) => extract_zip(file, dest),
        Some(ArchiveFormat::TarGz) => extract_tar_gz(file, dest),
        None => anyhow::bail!("Unsupported archive format (expected ZIP or .tar.gz)"),
    }
}

fn extract_zip(file: File, dest: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(file).context("Failed to read ZIP archive")?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("Failed to read ZIP entry")?;
        let Some(relative) = entry.enclosed_name() else {
            tracing::warn!(name = entry.name(), "skipping ZIP entry with unsafe path");
            continue;
        };
        let outpath = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)
                .with_context(|| format!("Failed to create {}", outpath.display()))?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut outfile = File::create(&outpath)
            .with_context(|| format!("Failed to create {}", outpath.display()))?;
        std::io::copy(&mut entry, &mut outfile)
            .with_context(|| format!("Failed to extract {}", outpath.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode & 0o777))
                    .ok();
            }
        }
    }

    Ok(())
}

fn extract_tar_gz(file: File, dest: &Path) -> Result<()> {
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    // `unpack_in` refuses entries that would escape `dest`.
    for entry in archive.entries().context("Failed to read tar archive")? {
        let mut entry = entry.context("Failed to read tar entry")?;
        if !entry
            .unpack_in(dest)
            .context("Failed to extract tar entry")?
        {
            tracing::warn!("skipping tar entry with unsafe path");
        }
    }
    Ok(())
}

/// Clone `url` into the (empty) directory `dest`.
pub fn clone_repository(url: &str, dest: &Path) -> Result<()> {
    git2::Repository::clone(url, dest)
        .with_context(|| format!("Failed to clone {}", url))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zip(path: &Path, files: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, contents) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(contents.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(b"PK\x03\x04rest"), Some(ArchiveFormat::Zip));
        assert_eq!(detect_format(&[0x1f, 0x8b, 0x08, 0x00]), Some(ArchiveFormat::TarGz));
        assert_eq!(detect_format(b"not an archive"), None);
        assert_eq!(detect_format(b"P"), None);
    }

    #[test]
    fn test_extract_zip_with_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bot.zip");
        write_zip(
            &archive,
            &[("index.js", "console.log('hi')"), ("lib/util.js", "module.exports = {}")],
        );
        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();

        extract_archive(&archive, &dest).unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.join("index.js")).unwrap(),
            "console.log('hi')"
        );
        assert!(dest.join("lib/util.js").is_file());
    }

    #[test]
    fn test_extract_zip_skips_traversal_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../escaped.txt", "pwned"), ("ok.txt", "fine")]);
        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();

        extract_archive(&archive, &dest).unwrap();

        assert!(!dir.path().join("escaped.txt").exists());
        assert!(dest.join("ok.txt").is_file());
    }

    #[test]
    fn test_extract_tar_gz() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bot.tar.gz");
        {
            let file = File::create(&archive).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let data = b"print('hello')";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "main.py", &data[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();

        extract_archive(&archive, &dest).unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.join("main.py")).unwrap(),
            "print('hello')"
        );
    }

    #[test]
    fn test_extract_rejects_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bot.rar");
        std::fs::write(&archive, "Rar!").unwrap();
        let err = extract_archive(&archive, dir.path()).unwrap_err();
        assert!(err.to_string().contains("Unsupported archive format"));
    }

    #[test]
    fn test_clone_local_repository() {
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join("origin");
        let repo = git2::Repository::init(&origin).unwrap();
        std::fs::write(origin.join("index.js"), "console.log('cloned')").unwrap();
        {
            let mut index = repo.index().unwrap();
            index.add_path(Path::new("index.js")).unwrap();
            index.write().unwrap();
            let tree_id = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            let sig = git2::Signature::now("test", "test@example.com").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
                .unwrap();
        }

        let dest = dir.path().join("workspace");
        std::fs::create_dir_all(&dest).unwrap();
        let url = origin.to_string_lossy().to_string();
        clone_repository(&url, &dest).unwrap();

        assert!(dest.join("index.js").is_file());
    }

    #[test]
    fn test_clone_bad_url_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let err = clone_repository(&missing.to_string_lossy(), &dir.path().join("dest"));
        assert!(err.is_err());
    }
}
