use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use crate::error::AppError;

use super::{Manifest, MANIFEST_SUFFIX};

/// The only synchronization primitive between pipeline stages. Modeled as a
/// trait so the directory-of-JSON implementation can be swapped for a real
/// queue or broker without touching stage logic.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    async fn put(&self, manifest: &Manifest) -> Result<(), AppError>;
    async fn get(&self, safe_id: &str) -> Result<Option<Manifest>, AppError>;
    async fn list(&self) -> Result<Vec<Manifest>, AppError>;
    async fn delete(&self, safe_id: &str) -> Result<(), AppError>;
}

/// Directory of `<safe_id>.manifest.json` files. Writes go through a
/// temporary file plus rename so a reader on a network mount never observes a
/// torn JSON document.
#[derive(Debug, Clone)]
pub struct FsManifestStore {
    dir: PathBuf,
}

impl FsManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifest_path(&self, safe_id: &str) -> PathBuf {
        self.dir.join(format!("{safe_id}{MANIFEST_SUFFIX}"))
    }
}

#[async_trait]
impl ManifestStore for FsManifestStore {
    async fn put(&self, manifest: &Manifest) -> Result<(), AppError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let target = self.manifest_path(&manifest.safe_id);
        let tmp = target.with_extension("json.tmp");
        let body = serde_json::to_vec(manifest)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    async fn get(&self, safe_id: &str) -> Result<Option<Manifest>, AppError> {
        let path = self.manifest_path(safe_id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(err) => Err(AppError::Parse(format!(
                "malformed manifest {}: {err}",
                path.display()
            ))),
        }
    }

    async fn list(&self) -> Result<Vec<Manifest>, AppError> {
        let mut manifests = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(manifests),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(MANIFEST_SUFFIX) {
                continue;
            }
            let raw = match tokio::fs::read(entry.path()).await {
                Ok(raw) => raw,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            // A manifest mid-write or corrupted stays on disk for a later
            // cycle; it must never take the whole listing down.
            match serde_json::from_slice::<Manifest>(&raw) {
                Ok(manifest) => manifests.push(manifest),
                Err(err) => {
                    warn!(file = name, error = %err, "skipping unparseable manifest");
                }
            }
        }
        manifests.sort_by(|a, b| a.safe_id.cmp(&b.safe_id));
        Ok(manifests)
    }

    async fn delete(&self, safe_id: &str) -> Result<(), AppError> {
        match tokio::fs::remove_file(self.manifest_path(safe_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
