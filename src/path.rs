//! Absolute path resolution.
//!
//! Paths are absolute, '/'-separated, and each component must pass name
//! validation for its role: every intermediate component is a directory,
//! the last one is whatever the caller is about to operate on. Nothing is
//! created implicitly; opening "/a/b.txt" while "/a" is absent fails.

use alloc::vec::Vec;

use crate::dir::{DirError, FoundEntry};
use crate::fs::FileSystem;
use crate::name::{validate_lfn_dir, validate_sfn_dir, NameError};
use crate::{Error, PATH_CAP};

/// Split an absolute path into validated components. The terminal
/// component is returned unvalidated; the caller knows whether a file or
/// a directory name is expected there.
pub(crate) fn split_path(path: &str) -> Result<Vec<&str>, Error> {
    if !path.starts_with('/') {
        return Err(NameError::InvalidPath.into());
    }
    if path.len() > PATH_CAP {
        return Err(NameError::PathTooLong.into());
    }

    let trimmed = path.strip_suffix('/').unwrap_or(path);
    let mut parts = Vec::new();
    if trimmed.len() <= 1 {
        return Ok(parts);
    }
    for component in trimmed[1..].split('/') {
        if component.is_empty() {
            return Err(NameError::InvalidPath.into());
        }
        parts.push(component);
    }
    Ok(parts)
}

fn validate_dir_component(component: &str) -> Result<(), Error> {
    if validate_sfn_dir(component).is_ok() {
        return Ok(());
    }
    validate_lfn_dir(component)?;
    Ok(())
}

impl FileSystem {
    /// Resolve a path whose every component is a directory, yielding the
    /// first cluster of the target. "/" resolves to the root cluster.
    pub(crate) fn resolve_dir(&self, path: &str) -> Result<u32, Error> {
        let parts = split_path(path)?;
        let mut cluster = self.layout.root_cluster;
        for component in parts {
            validate_dir_component(component)?;
            let found = self
                .lookup(cluster, component)?
                .ok_or(DirError::DirNotFound)?;
            if !found.sde.is_dir() {
                return Err(DirError::NotADirectory.into());
            }
            cluster = found.sde.first_cluster();
        }
        Ok(cluster)
    }

    /// Resolve everything but the last component, yielding the parent
    /// directory cluster and the leaf name. The leaf is validated by the
    /// caller for its intended kind.
    pub(crate) fn resolve_parent<'p>(&self, path: &'p str) -> Result<(u32, &'p str), Error> {
        let parts = split_path(path)?;
        let (leaf, dirs) = parts.split_last().ok_or(NameError::InvalidPath)?;

        let mut cluster = self.layout.root_cluster;
        for component in dirs {
            validate_dir_component(component)?;
            let found = self
                .lookup(cluster, component)?
                .ok_or(NameError::InvalidPath)?;
            if !found.sde.is_dir() {
                return Err(DirError::NotADirectory.into());
            }
            cluster = found.sde.first_cluster();
        }
        Ok((cluster, *leaf))
    }

    /// Resolve a full path to its entry, `None` when the leaf is absent.
    pub(crate) fn resolve_entry(&self, path: &str) -> Result<Option<FoundEntry>, Error> {
        let (parent, leaf) = self.resolve_parent(path)?;
        self.lookup(parent, leaf)
    }
}
