//! Attachment byte access.
//!
//! The host owns vault I/O; the orchestrator only sees [`ImageStore`]. The
//! filesystem store resolves attachment ids relative to a vault root.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Image extensions worth sending to OCR.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp", "tif", "tiff"];

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("Attachment not found: {0}")]
    NotFound(String),

    #[error("Not an image attachment: {0}")]
    Unsupported(String),

    #[error("Attachment path escapes the vault: {0}")]
    OutsideVault(String),

    #[error("Attachment is empty: {0}")]
    Empty(String),

    #[error("IO error reading {file_id}: {source}")]
    Io {
        file_id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Source of attachment bytes.
#[async_trait::async_trait]
pub trait ImageStore: Send + Sync {
    async fn read_binary(&self, file_id: &str) -> Result<Vec<u8>, ReadError>;
}

/// Whether `file_id` names an image attachment by extension.
pub fn is_image_attachment(file_id: &str) -> bool {
    Path::new(file_id)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Reads attachments from a directory on disk.
#[derive(Debug, Clone)]
pub struct FsImageStore {
    root: PathBuf,
}

impl FsImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, file_id: &str) -> Result<PathBuf, ReadError> {
        let relative = Path::new(file_id);
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(ReadError::OutsideVault(file_id.to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Follow symlinks and check the target still lies under the vault root.
    async fn resolve_existing(&self, file_id: &str) -> Result<PathBuf, ReadError> {
        let path = self.resolve(file_id)?;
        let io_error = |source: std::io::Error| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ReadError::NotFound(file_id.to_string())
            } else {
                ReadError::Io {
                    file_id: file_id.to_string(),
                    source,
                }
            }
        };
        let root = tokio::fs::canonicalize(&self.root).await.map_err(io_error)?;
        let target = tokio::fs::canonicalize(&path).await.map_err(io_error)?;
        if !target.starts_with(&root) {
            debug!("FsImageStore: '{}' resolves to {:?}", file_id, target);
            return Err(ReadError::OutsideVault(file_id.to_string()));
        }
        Ok(target)
    }
}

#[async_trait::async_trait]
impl ImageStore for FsImageStore {
    async fn read_binary(&self, file_id: &str) -> Result<Vec<u8>, ReadError> {
        if !is_image_attachment(file_id) {
            return Err(ReadError::Unsupported(file_id.to_string()));
        }
        let path = self.resolve_existing(file_id).await?;

        let data = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ReadError::NotFound(file_id.to_string())
            } else {
                ReadError::Io {
                    file_id: file_id.to_string(),
                    source: e,
                }
            }
        })?;

        if data.is_empty() {
            return Err(ReadError::Empty(file_id.to_string()));
        }
        debug!("FsImageStore: read '{}' ({} bytes)", file_id, data.len());
        Ok(data)
    }
}
