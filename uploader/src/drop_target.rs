//! Destinations for finished export archives.
//!
//! A `DropConnector` opens a `DropTarget` from a tenant's drop settings. Only
//! the filesystem transport exists here; network transports plug in behind
//! the same traits.
use crate::config::DropType;
use async_trait::async_trait;
use exporter::types::DropSettings;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum DropError {
    #[error("drop target {0} is unreachable")]
    Unreachable(String),
    #[error("invalid remote path: {0:?}")]
    InvalidPath(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait DropTarget: Send + Sync {
    /// Copies `local_path` to `remote_path`, relative to the target root. A
    /// leading `/` names the root itself.
    async fn deliver(&self, local_path: &Path, remote_path: &str) -> Result<(), DropError>;
}

#[async_trait]
pub trait DropConnector: Send + Sync {
    async fn connect(&self, settings: &DropSettings) -> Result<Box<dyn DropTarget>, DropError>;
}

pub fn connector_from_config(drop: &DropType) -> Arc<dyn DropConnector> {
    match drop {
        DropType::Filesystem { base_dir } => Arc::new(FilesystemConnector::new(base_dir)),
    }
}

/// Resolves a drop host to the directory `<base_dir>/<host>`. Hosts without an
/// existing directory are treated as unreachable.
pub struct FilesystemConnector {
    base_dir: PathBuf,
}

impl FilesystemConnector {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        FilesystemConnector {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl DropConnector for FilesystemConnector {
    async fn connect(&self, settings: &DropSettings) -> Result<Box<dyn DropTarget>, DropError> {
        let host = relative_path(&settings.host)?;
        let root = self.base_dir.join(host);

        match tokio::fs::metadata(&root).await {
            Ok(metadata) if metadata.is_dir() => Ok(Box::new(FilesystemDrop { root })),
            _ => Err(DropError::Unreachable(settings.host.clone())),
        }
    }
}

pub struct FilesystemDrop {
    root: PathBuf,
}

impl FilesystemDrop {
    pub fn new(root: impl AsRef<Path>) -> Self {
        FilesystemDrop {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl DropTarget for FilesystemDrop {
    async fn deliver(&self, local_path: &Path, remote_path: &str) -> Result<(), DropError> {
        let remote = remote_path.trim_start_matches('/');
        let destination = self.root.join(relative_path(remote)?);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Readers polling the drop must never pick up a partial archive.
        let mut partial = destination.clone().into_os_string();
        partial.push(".partial");
        tokio::fs::copy(local_path, &partial).await?;
        tokio::fs::rename(&partial, &destination).await?;

        tracing::debug!(destination = %destination.display(), "Delivered archive");
        Ok(())
    }
}

// Only plain relative components may be used below a drop root.
fn relative_path(path: &str) -> Result<PathBuf, DropError> {
    let candidate = Path::new(path);
    let valid = !path.is_empty()
        && candidate
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if valid {
        Ok(candidate.to_path_buf())
    } else {
        Err(DropError::InvalidPath(path.to_string()))
    }
}
