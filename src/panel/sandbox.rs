//! Workspace sandbox — confines client-supplied paths to the workspace root.
//!
//! Client paths are root-anchored: `""`, `"."`, `"/"` and `"./"` all name the
//! root itself, and `"/sub"` names `<root>/sub`. Resolution is lexical first
//! (any `..` component or platform prefix is refused outright), then the
//! deepest existing ancestor of the result is canonicalized and must still
//! sit under the canonical root, which catches symlinks pointing outside.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

use crate::errors::PathEscapeError;

#[derive(Debug, Clone)]
pub struct WorkspaceSandbox {
    root: PathBuf,
}

impl WorkspaceSandbox {
    /// Create the root directory if missing and pin its canonical form.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create workspace {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve workspace {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a client path to an absolute path inside the root.
    pub fn resolve(&self, client_path: &str) -> Result<PathBuf, PathEscapeError> {
        let resolved = self.lexical(client_path)?;
        self.check_existing_ancestor(&resolved)?;
        Ok(resolved)
    }

    /// Like [`resolve`](Self::resolve), but the final component is not
    /// followed: a symlink entry resolves to the link itself as long as its
    /// parent chain stays inside the root.
    pub fn resolve_entry(&self, client_path: &str) -> Result<PathBuf, PathEscapeError> {
        let resolved = self.lexical(client_path)?;
        match resolved.parent() {
            Some(parent) if resolved != self.root => self.check_existing_ancestor(parent)?,
            _ => self.check_existing_ancestor(&resolved)?,
        }
        Ok(resolved)
    }

    /// Resolve `name` as a single entry inside the directory `client_dir`.
    pub fn resolve_child(&self, client_dir: &str, name: &str) -> Result<PathBuf, PathEscapeError> {
        if !is_single_component(name) {
            return Err(PathEscapeError);
        }
        let dir = self.resolve(client_dir)?;
        Ok(dir.join(name))
    }

    fn lexical(&self, client_path: &str) -> Result<PathBuf, PathEscapeError> {
        if client_path.contains('\0') {
            return Err(PathEscapeError);
        }
        let normalized = client_path.replace('\\', "/");

        let mut resolved = self.root.clone();
        for component in Path::new(&normalized).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir | Component::Prefix(_) => return Err(PathEscapeError),
            }
        }
        Ok(resolved)
    }

    pub fn is_root(&self, path: &Path) -> bool {
        path == self.root
    }

    /// Root-relative display form (`/sub/a.txt`) for log messages.
    pub fn display_relative(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => "/".to_string(),
            Ok(rel) => {
                let parts: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                format!("/{}", parts.join("/"))
            }
            Err(_) => "/".to_string(),
        }
    }

    fn check_existing_ancestor(&self, resolved: &Path) -> Result<(), PathEscapeError> {
        for ancestor in resolved.ancestors() {
            if std::fs::symlink_metadata(ancestor).is_err() {
                continue;
            }
            return match ancestor.canonicalize() {
                Ok(real) if real.starts_with(&self.root) => Ok(()),
                Ok(_) => Err(PathEscapeError),
                // Dangling symlink: nothing reachable through it.
                Err(_) => match ancestor.parent().map(Path::canonicalize) {
                    Some(Ok(real)) if real.starts_with(&self.root) => Ok(()),
                    _ => Err(PathEscapeError),
                },
            };
        }
        Err(PathEscapeError)
    }
}

/// True when `name` is exactly one normal path component.
pub fn is_single_component(name: &str) -> bool {
    if name.is_empty() || name.contains('\0') || name.contains('/') || name.contains('\\') {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
