//! File-backed labour-access cache for the CLI.

use std::path::{Path, PathBuf};

use fundi_core::access::{AccessStore, LabourAccess};
use fundi_core::{ApiError, ApiResult};

/// Persists the access blob as one JSON file under the user data directory.
#[derive(Debug, Clone)]
pub struct FileAccessStore {
    path: PathBuf,
}

impl FileAccessStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default location: `<data dir>/fundi/labour_access.json`.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fundi")
            .join("labour_access.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AccessStore for FileAccessStore {
    fn load(&self) -> ApiResult<Option<LabourAccess>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(ApiError::Storage(error.to_string())),
        }
    }

    fn save(&self, access: &LabourAccess) -> ApiResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|error| ApiError::Storage(error.to_string()))?;
        }
        let raw = serde_json::to_string(access)?;
        std::fs::write(&self.path, raw).map_err(|error| ApiError::Storage(error.to_string()))
    }

    fn clear(&self) -> ApiResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(ApiError::Storage(error.to_string())),
        }
    }
}
