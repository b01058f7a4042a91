//! File manager — list, upload and delete inside the workspace.
//!
//! Every operation goes through [`WorkspaceSandbox`]; error messages and log
//! entries only ever carry root-relative paths.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::logbuf::LogBroadcast;
use super::models::FileEntry;
use super::sandbox::WorkspaceSandbox;
use crate::errors::FileError;

pub struct FileManager {
    sandbox: WorkspaceSandbox,
    staging_dir: PathBuf,
    logs: Arc<LogBroadcast>,
}

impl FileManager {
    pub fn new(sandbox: WorkspaceSandbox, staging_dir: impl Into<PathBuf>, logs: Arc<LogBroadcast>) -> Self {
        Self {
            sandbox,
            staging_dir: staging_dir.into(),
            logs,
        }
    }

    pub fn sandbox(&self) -> &WorkspaceSandbox {
        &self.sandbox
    }

    /// Entries of the directory at `client_path`, directories first, then
    /// by name.
    pub async fn list(&self, client_path: &str) -> Result<Vec<FileEntry>, FileError> {
        let dir = self.sandbox.resolve(client_path)?;
        self.require_dir(&dir).await?;

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            // Follow symlinks for the type; fall back to the link itself.
            let metadata = match tokio::fs::metadata(entry.path()).await {
                Ok(metadata) => metadata,
                Err(_) => match entry.metadata().await {
                    Ok(metadata) => metadata,
                    // Removed since read_dir saw it (a deploy wipe, a delete).
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                },
            };
            let is_directory = metadata.is_dir();
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_directory,
                size_in_kilobytes: if is_directory { 0.0 } else { kilobytes(metadata.len()) },
            });
        }

        entries.sort_by(|a, b| b.is_directory.cmp(&a.is_directory).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    /// Write `bytes` as `name` inside the existing directory `client_dir`,
    /// replacing any file of the same name. Returns the root-relative path.
    pub async fn upload(&self, client_dir: &str, name: &str, bytes: Vec<u8>) -> Result<String, FileError> {
        if name.trim().is_empty() {
            return Err(FileError::InvalidName(name.to_string()));
        }
        let target = self.sandbox.resolve_child(client_dir, name)?;
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.sandbox.root().to_path_buf());
        self.require_dir(&dir).await?;

        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let staging = self.staging_dir.clone();
        let dest = target.clone();
        tokio::task::spawn_blocking(move || stage_and_persist(&staging, &dest, &bytes))
            .await
            .map_err(|e| FileError::Io(std::io::Error::other(e)))??;

        let relative = self.sandbox.display_relative(&target);
        self.logs.info(format!("Uploaded {}", relative));
        Ok(relative)
    }

    /// Recursively remove `name` inside `client_dir`. Symlinks are removed,
    /// never followed.
    pub async fn delete(&self, client_dir: &str, name: &str) -> Result<String, FileError> {
        let joined = format!("{}/{}", client_dir, name);
        let target = self.sandbox.resolve_entry(&joined)?;
        if self.sandbox.is_root(&target) {
            return Err(FileError::CannotDeleteRoot);
        }

        let relative = self.sandbox.display_relative(&target);
        let metadata = match tokio::fs::symlink_metadata(&target).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(FileError::NotFound { path: relative });
            }
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&target).await?;
        } else {
            tokio::fs::remove_file(&target).await?;
        }

        self.logs.warn(format!("Deleted {}", relative));
        Ok(relative)
    }

    async fn require_dir(&self, dir: &Path) -> Result<(), FileError> {
        match tokio::fs::metadata(dir).await {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(FileError::NotADirectory {
                path: self.sandbox.display_relative(dir),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(FileError::NotFound {
                path: self.sandbox.display_relative(dir),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// Size in KiB rounded to one decimal place.
fn kilobytes(len: u64) -> f64 {
    (len as f64 / 1024.0 * 10.0).round() / 10.0
}

/// Write to a temp file in `staging`, then move it over `dest`. The temp file
/// is removed on every failure path when it drops.
fn stage_and_persist(staging: &Path, dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut staged = tempfile::Builder::new()
        .prefix(".upload-")
        .tempfile_in(staging)?;
    staged.write_all(bytes)?;
    staged.flush()?;

    match staged.persist(dest) {
        Ok(_) => Ok(()),
        Err(e) if e.error.kind() == ErrorKind::CrossesDevices => copy_over(e.file.path(), dest),
        Err(e) => Err(e.error),
    }
}

/// Copy `src` to `dest`, replacing a symlink at `dest` instead of writing
/// through it.
fn copy_over(src: &Path, dest: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(dest) {
        Ok(metadata) if metadata.file_type().is_symlink() => std::fs::remove_file(dest)?,
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::copy(src, dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PathEscapeError;
    use crate::panel::models::LogKind;
    use std::fs;

    fn manager() -> (tempfile::TempDir, FileManager, Arc<LogBroadcast>) {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = WorkspaceSandbox::new(dir.path().join("workspace")).unwrap();
        let logs = Arc::new(LogBroadcast::new(50));
        let files = FileManager::new(sandbox, dir.path().join("staging"), Arc::clone(&logs));
        (dir, files, logs)
    }

    #[test]
    fn test_kilobytes_rounding() {
        assert_eq!(kilobytes(0), 0.0);
        assert_eq!(kilobytes(1024), 1.0);
        assert_eq!(kilobytes(1536), 1.5);
        assert_eq!(kilobytes(100), 0.1);
    }

    #[tokio::test]
    async fn test_list_sorts_directories_first() {
        let (_dir, files, _logs) = manager();
        let root = files.sandbox().root().to_path_buf();
        fs::write(root.join("b.txt"), vec![0u8; 2048]).unwrap();
        fs::write(root.join("a.txt"), "x").unwrap();
        fs::create_dir(root.join("zeta")).unwrap();
        fs::create_dir(root.join("alpha")).unwrap();

        let entries = files.list("/").await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta", "a.txt", "b.txt"]);
        assert!(entries[0].is_directory);
        assert_eq!(entries[3].size_in_kilobytes, 2.0);
    }

    #[tokio::test]
    async fn test_list_tolerates_entries_vanishing_mid_scan() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (_dir, files, _logs) = manager();
        let root = files.sandbox().root().to_path_buf();
        fs::write(root.join("stable.txt"), "x").unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let churn = {
            let done = Arc::clone(&done);
            let root = root.clone();
            std::thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    for i in 0..50 {
                        let _ = fs::write(root.join(format!("churn-{}.txt", i)), "x");
                    }
                    for i in 0..50 {
                        let _ = fs::remove_file(root.join(format!("churn-{}.txt", i)));
                    }
                }
            })
        };

        for _ in 0..500 {
            let entries = files.list("/").await.unwrap();
            assert!(entries.iter().any(|e| e.name == "stable.txt"));
        }

        done.store(true, Ordering::Relaxed);
        churn.join().unwrap();
    }

    #[tokio::test]
    async fn test_list_missing_and_non_directory() {
        let (_dir, files, _logs) = manager();
        fs::write(files.sandbox().root().join("file.txt"), "x").unwrap();

        match files.list("nope").await.unwrap_err() {
            FileError::NotFound { path } => assert_eq!(path, "/nope"),
            other => panic!("Expected NotFound, got {:?}", other),
        }
        assert!(matches!(
            files.list("file.txt").await.unwrap_err(),
            FileError::NotADirectory { .. }
        ));
    }

    #[tokio::test]
    async fn test_list_rejects_traversal() {
        let (_dir, files, _logs) = manager();
        assert!(matches!(
            files.list("../").await.unwrap_err(),
            FileError::PathEscape(PathEscapeError)
        ));
    }

    #[tokio::test]
    async fn test_upload_writes_and_overwrites() {
        let (_dir, files, logs) = manager();
        let root = files.sandbox().root().to_path_buf();

        let rel = files.upload("/", "a.txt", b"first".to_vec()).await.unwrap();
        assert_eq!(rel, "/a.txt");
        files.upload("", "a.txt", b"second".to_vec()).await.unwrap();

        assert_eq!(fs::read_to_string(root.join("a.txt")).unwrap(), "second");
        let last = logs.snapshot().pop().unwrap();
        assert_eq!(last.kind, LogKind::Info);
        assert_eq!(last.text, "Uploaded /a.txt");
    }

    #[tokio::test]
    async fn test_upload_into_existing_subdirectory() {
        let (_dir, files, _logs) = manager();
        fs::create_dir(files.sandbox().root().join("sub")).unwrap();
        let rel = files.upload("/sub", "a.txt", b"hi".to_vec()).await.unwrap();
        assert_eq!(rel, "/sub/a.txt");
    }

    #[tokio::test]
    async fn test_upload_to_missing_directory_is_not_found() {
        let (_dir, files, _logs) = manager();
        let err = files.upload("/sub", "a.txt", b"hi".to_vec()).await.unwrap_err();
        assert!(matches!(err, FileError::NotFound { ref path } if path == "/sub"));
        assert!(!files.sandbox().root().join("sub").exists());
    }

    #[tokio::test]
    async fn test_upload_leaves_no_staged_files() {
        let (dir, files, _logs) = manager();
        files.upload("/", "a.txt", b"hi".to_vec()).await.unwrap();
        // Failure path: target name is an existing directory.
        fs::create_dir(files.sandbox().root().join("taken")).unwrap();
        assert!(files.upload("/", "taken", b"hi".to_vec()).await.is_err());

        let leftovers = fs::read_dir(dir.path().join("staging")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_over_replaces_symlink_instead_of_following() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside.txt");
        fs::write(&outside, "untouched").unwrap();
        let src = dir.path().join("src.txt");
        fs::write(&src, "uploaded").unwrap();
        let dest = dir.path().join("dest.txt");
        std::os::unix::fs::symlink(&outside, &dest).unwrap();

        copy_over(&src, &dest).unwrap();

        assert_eq!(fs::read_to_string(&outside).unwrap(), "untouched");
        assert!(!fs::symlink_metadata(&dest).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "uploaded");
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_names() {
        let (_dir, files, _logs) = manager();
        assert!(matches!(
            files.upload("/", "", b"x".to_vec()).await.unwrap_err(),
            FileError::InvalidName(_)
        ));
        assert!(matches!(
            files.upload("/", "../escape.txt", b"x".to_vec()).await.unwrap_err(),
            FileError::PathEscape(_)
        ));
        assert!(matches!(
            files.upload("..", "a.txt", b"x".to_vec()).await.unwrap_err(),
            FileError::PathEscape(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_root_is_always_refused() {
        let (_dir, files, _logs) = manager();
        for (dir, name) in [(".", ""), ("", ""), ("./", ""), ("/", ""), ("/", "."), ("", "./")] {
            assert!(
                matches!(files.delete(dir, name).await.unwrap_err(), FileError::CannotDeleteRoot),
                "{:?} {:?}",
                dir,
                name
            );
        }
        assert!(files.sandbox().root().exists());
    }

    #[tokio::test]
    async fn test_delete_file_and_directory() {
        let (_dir, files, logs) = manager();
        let root = files.sandbox().root().to_path_buf();
        fs::create_dir_all(root.join("sub/nested")).unwrap();
        fs::write(root.join("sub/nested/f.txt"), "x").unwrap();
        fs::write(root.join("a.txt"), "x").unwrap();

        files.delete("/", "a.txt").await.unwrap();
        let rel = files.delete("/", "sub").await.unwrap();

        assert_eq!(rel, "/sub");
        assert!(!root.join("a.txt").exists());
        assert!(!root.join("sub").exists());
        let last = logs.snapshot().pop().unwrap();
        assert_eq!((last.kind, last.text.as_str()), (LogKind::Warn, "Deleted /sub"));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let (_dir, files, _logs) = manager();
        assert!(matches!(
            files.delete("/", "ghost.txt").await.unwrap_err(),
            FileError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_delete_rejects_traversal() {
        let (_dir, files, _logs) = manager();
        assert!(matches!(
            files.delete("/", "..").await.unwrap_err(),
            FileError::PathEscape(_)
        ));
        assert!(matches!(
            files.delete("../..", "etc").await.unwrap_err(),
            FileError::PathEscape(_)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_delete_symlink_does_not_follow() {
        let (dir, files, _logs) = manager();
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("keep.txt"), "x").unwrap();
        std::os::unix::fs::symlink(&outside, files.sandbox().root().join("link")).unwrap();

        files.delete("/", "link").await.unwrap();

        assert!(outside.join("keep.txt").exists());
        assert!(fs::symlink_metadata(files.sandbox().root().join("link")).is_err());
    }
}
