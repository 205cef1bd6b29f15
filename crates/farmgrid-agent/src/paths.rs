//! Mapping of coordinator file references to local paths.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use farm_core::split_file_ref;

use crate::error::LaunchError;

/// Path identifiers this node can reach and where they are mounted.
#[derive(Debug, Clone, Default)]
pub struct PathMap {
    roots: HashMap<String, PathBuf>,
}

impl PathMap {
    pub fn new(roots: HashMap<String, PathBuf>) -> Self {
        Self { roots }
    }

    /// Identifiers to announce in `task` requests, sorted.
    pub fn idents(&self) -> Vec<String> {
        let mut idents: Vec<String> = self.roots.keys().cloned().collect();
        idents.sort();
        idents
    }

    /// Resolve `<ident>::<relative path>` against the local mount of
    /// `ident`. The relative part may not escape the mount.
    pub fn resolve(&self, file_ref: &str) -> Result<PathBuf, LaunchError> {
        let (ident, rel) =
            split_file_ref(file_ref).ok_or_else(|| LaunchError::BadFileRef(file_ref.into()))?;
        let root = self
            .roots
            .get(ident)
            .ok_or_else(|| LaunchError::UnknownPath(ident.into()))?;

        let rel = Path::new(rel);
        if !rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(LaunchError::BadFileRef(file_ref.into()));
        }
        Ok(root.join(rel))
    }
}
