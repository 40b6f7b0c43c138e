// src/platform/storage.rs

//! Provisioned-file storage on the local filesystem
//!
//! Paths in the desired state are relative to a storage root and come from
//! the server, so they are treated as untrusted: `..` components are
//! rejected and leading slashes stripped before joining.

use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, hash_file};
use crate::reconcile::FileProbe;
use std::path::{Component, Path, PathBuf};

/// Normalize a server-supplied path to a relative one
pub fn sanitize_path(path: &str) -> Result<PathBuf> {
    let relative = path.trim_start_matches('/');
    let mut normalized = PathBuf::new();

    for component in Path::new(relative).components() {
        match component {
            Component::Normal(c) => normalized.push(c),
            Component::CurDir => {}
            Component::ParentDir => return Err(Error::PathTraversal(path.to_string())),
            Component::Prefix(_) | Component::RootDir => {}
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(Error::InvalidPath(format!("Empty path: {:?}", path)));
    }

    Ok(normalized)
}

/// Join `path` under `root` without letting it escape
pub fn safe_join(root: &Path, path: &str) -> Result<PathBuf> {
    let joined = root.join(sanitize_path(path)?);

    // Symlinks inside the root can still point outside it
    if let (Ok(canonical_root), Ok(canonical_joined)) = (root.canonicalize(), joined.canonicalize())
        && !canonical_joined.starts_with(&canonical_root)
    {
        return Err(Error::PathTraversal(format!(
            "{} escapes {}",
            joined.display(),
            root.display()
        )));
    }

    Ok(joined)
}

/// File probe over a directory on disk
#[derive(Debug, Clone)]
pub struct StorageProbe {
    root: PathBuf,
    algorithm: HashAlgorithm,
}

impl StorageProbe {
    pub fn new(root: impl Into<PathBuf>, algorithm: HashAlgorithm) -> Self {
        Self {
            root: root.into(),
            algorithm,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileProbe for StorageProbe {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_file()).unwrap_or(false)
    }

    fn checksum(&self, path: &str) -> Result<String> {
        let full = self.resolve(path)?;
        hash_file(self.algorithm, &full)
            .map_err(|e| Error::IoError(format!("Failed to hash {}: {}", full.display(), e)))
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        safe_join(&self.root, path)
    }
}
