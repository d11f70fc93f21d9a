//! Durable storage for backup files.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Named blob storage for backup payloads.
///
/// `write_new` never replaces an existing blob: it fails with
/// [`io::ErrorKind::AlreadyExists`] and the caller picks another name.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Durably writes `data` under `filename` and returns the stored size.
    async fn write_new(&self, filename: &str, data: &[u8]) -> io::Result<u64>;

    async fn read(&self, filename: &str) -> io::Result<Vec<u8>>;

    /// Returns `false` if there was nothing to delete.
    async fn delete(&self, filename: &str) -> io::Result<bool>;
}

/// Stores every artifact as a file in a single directory.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create backup directory {:?}", root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, filename: &str) -> io::Result<PathBuf> {
        let is_plain = !filename.is_empty()
            && !filename.starts_with('.')
            && !filename.contains(['/', '\\'])
            && !filename.contains("..");
        if !is_plain {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid artifact filename {:?}", filename),
            ));
        }
        Ok(self.root.join(filename))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn write_new(&self, filename: &str, data: &[u8]) -> io::Result<u64> {
        let path = self.resolve(filename)?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        let written = async {
            file.write_all(data).await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            drop(file);
            if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                warn!(
                    "Failed to remove partial artifact {:?}: {}",
                    path, remove_err
                );
            }
            return Err(e);
        }
        Ok(data.len() as u64)
    }

    async fn read(&self, filename: &str) -> io::Result<Vec<u8>> {
        let path = self.resolve(filename)?;
        tokio::fs::read(path).await
    }

    async fn delete(&self, filename: &str) -> io::Result<bool> {
        let path = self.resolve(filename)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
