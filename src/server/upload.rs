//! Upload storage for the built-in `upload` command.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::ServiceError;
use crate::protocol::UploadResult;

/// Writes uploaded files under one directory.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: Arc<PathBuf>,
}

impl UploadStore {
    /// Creates a store rooted at `dir`. The directory is created on the
    /// first upload.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Arc::new(dir.into()),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stores `bytes` as `filename`, keeping only its last path component.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidParams`] if the name has no usable
    /// component and [`ServiceError::Internal`] if writing fails.
    pub async fn save(
        &self,
        filename: &str,
        bytes: &[u8],
    ) -> Result<UploadResult, ServiceError> {
        let name = sanitize(filename)
            .ok_or_else(|| ServiceError::InvalidParams(format!("invalid filename '{filename}'")))?;
        tokio::fs::create_dir_all(self.dir.as_path())
            .await
            .map_err(|e| ServiceError::Internal(format!("create upload dir: {e}")))?;
        let path = self.dir.join(name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ServiceError::Internal(format!("write {}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), size = bytes.len(), "upload stored");
        Ok(UploadResult {
            path: path.display().to_string(),
            filename: name.to_string(),
            size: bytes.len() as u64,
        })
    }
}

fn sanitize(filename: &str) -> Option<&str> {
    let name = filename.rsplit(['/', '\\']).next()?.trim();
    match name {
        "" | "." | ".." => None,
        name => Some(name),
    }
}
