//! Persistent home of fully reassembled checkpoint entities.
//!
//! Layout of [`FsCheckpointStore`]:
//! ```text
//! <root>/<grid_search_id>/<experiment_id>/<checkpoint_id>/<entity_id>.<ext>
//! ```
//! Writes go to a sibling temp file first and are renamed into place, so a
//! reader never observes a half-written artifact. Deleting the last entity of
//! a checkpoint prunes the emptied directories up to (not including) the root.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use mlboard_core::CheckpointEntityKey;

/// Checkpoint storage errors.
#[derive(Debug)]
pub enum CheckpointStoreError {
    /// Filesystem failure at `path`
    Io { path: PathBuf, source: io::Error },
    /// A key component would escape the storage root
    InvalidKey(String),
}

impl CheckpointStoreError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl std::fmt::Display for CheckpointStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "I/O error at {}: {source}", path.display()),
            Self::InvalidKey(reason) => write!(f, "Invalid checkpoint key: {reason}"),
        }
    }
}

impl std::error::Error for CheckpointStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::InvalidKey(_) => None,
        }
    }
}

/// Storage collaborator for reassembled artifacts.
pub trait CheckpointStore: Send + Sync {
    /// Store `bytes` as the artifact of `key`, replacing any previous one.
    fn persist(&self, key: &CheckpointEntityKey, bytes: &[u8]) -> Result<(), CheckpointStoreError>;

    /// Remove the artifact of `key`. Returns `false` if nothing was stored.
    fn delete(&self, key: &CheckpointEntityKey) -> Result<bool, CheckpointStoreError>;
}

/// Filesystem-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    root: PathBuf,
    extension: String,
}

impl FsCheckpointStore {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the artifact for `key`.
    pub fn entity_path(&self, key: &CheckpointEntityKey) -> Result<PathBuf, CheckpointStoreError> {
        for component in key.components() {
            validate_component(component)?;
        }
        let file_name = if self.extension.is_empty() {
            key.entity_id.clone()
        } else {
            format!("{}.{}", key.entity_id, self.extension)
        };
        Ok(self
            .root
            .join(&key.grid_search_id)
            .join(&key.experiment_id)
            .join(&key.checkpoint_id)
            .join(file_name))
    }

    /// Remove empty directories from `dir` upward, stopping below the root.
    fn prune_empty_dirs(&self, mut dir: &Path) {
        while dir != self.root && dir.starts_with(&self.root) {
            // remove_dir refuses non-empty directories, which ends the walk
            if fs::remove_dir(dir).is_err() {
                break;
            }
            log::trace!("Pruned empty directory {}", dir.display());
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }
}

fn validate_component(component: &str) -> Result<(), CheckpointStoreError> {
    if component.is_empty() || component == "." || component == ".." {
        return Err(CheckpointStoreError::InvalidKey(format!(
            "component {component:?} is not a valid path segment"
        )));
    }
    if component.contains(['/', '\\', '\0']) {
        return Err(CheckpointStoreError::InvalidKey(format!(
            "component {component:?} contains a path separator"
        )));
    }
    Ok(())
}

impl CheckpointStore for FsCheckpointStore {
    fn persist(&self, key: &CheckpointEntityKey, bytes: &[u8]) -> Result<(), CheckpointStoreError> {
        let path = self.entity_path(key)?;
        let dir = path
            .parent()
            .ok_or_else(|| CheckpointStoreError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(dir).map_err(|e| CheckpointStoreError::io(dir, e))?;

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".partial");
        let tmp_path = PathBuf::from(tmp_name);

        let mut file = fs::File::create(&tmp_path).map_err(|e| CheckpointStoreError::io(&tmp_path, e))?;
        file.write_all(bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| CheckpointStoreError::io(&tmp_path, e))?;
        drop(file);
        fs::rename(&tmp_path, &path).map_err(|e| CheckpointStoreError::io(&path, e))?;

        log::debug!("Persisted checkpoint {key} ({} bytes) to {}", bytes.len(), path.display());
        Ok(())
    }

    fn delete(&self, key: &CheckpointEntityKey) -> Result<bool, CheckpointStoreError> {
        let path = self.entity_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                if let Some(dir) = path.parent() {
                    self.prune_empty_dirs(dir);
                }
                log::debug!("Deleted checkpoint {key}");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CheckpointStoreError::io(&path, e)),
        }
    }
}
