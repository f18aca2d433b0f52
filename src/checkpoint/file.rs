// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! File-backed checkpoint: one token file per namespace.
//!
//! Writes go to a temp file in the same directory, are fsynced, then renamed
//! over the token file, so a crash mid-write leaves the previous position
//! intact rather than a truncated blob.

use super::{CheckpointStore, LoadFuture};
use crate::error::MigrationError;
use crate::event::{Namespace, ResumePosition};
use crate::metrics;
use crate::store::BoxFuture;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Checkpoint stored at `<dir>/<db>.<coll>.token`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    namespace: Namespace,
    dir: PathBuf,
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl AsRef<Path>, namespace: Namespace) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(Self::file_name(&namespace));
        Self {
            namespace,
            dir,
            path,
        }
    }

    /// Deterministic token file name for a namespace.
    pub fn file_name(namespace: &Namespace) -> String {
        format!("{}.{}.token", namespace.db, namespace.coll)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Option<ResumePosition> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "Token file not found, starting from current position");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Token file unreadable, treating as absent");
                return None;
            }
        };

        if bytes.is_empty() {
            info!(path = %self.path.display(), "Token file empty, treating as absent");
            return None;
        }

        match ResumePosition::from_bytes(&bytes) {
            Ok(position) => {
                debug!(path = %self.path.display(), position = %position, "Loaded resume position");
                Some(position)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Token file corrupt, treating as absent");
                None
            }
        }
    }
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

impl CheckpointStore for FileCheckpointStore {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn load(&self) -> LoadFuture<'_> {
        Box::pin(self.read())
    }

    fn save(&self, position: &ResumePosition) -> BoxFuture<'_, ()> {
        let encoded = position.to_bytes();
        Box::pin(async move {
            let bytes = encoded?;
            let dir = self.dir.clone();
            let path = self.path.clone();
            let result = tokio::task::spawn_blocking(move || write_atomic(&dir, &path, &bytes))
                .await
                .map_err(|e| MigrationError::Internal(format!("checkpoint writer panicked: {}", e)))?;

            metrics::record_checkpoint_save(&self.namespace, result.is_ok());
            result?;
            debug!(path = %self.path.display(), "Resume position saved");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use tempfile::tempdir;

    fn ns() -> Namespace {
        Namespace::new("shop", "orders")
    }

    #[test]
    fn test_file_name_is_deterministic() {
        assert_eq!(FileCheckpointStore::file_name(&ns()), "shop.orders.token");
        let store = FileCheckpointStore::new("/tmp/tokens", ns());
        assert_eq!(store.path(), Path::new("/tmp/tokens/shop.orders.token"));
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), ns());
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_load_empty_file_is_none() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), ns());
        std::fs::write(store.path(), b"").unwrap();
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_load_corrupt_file_is_none() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), ns());
        std::fs::write(store.path(), b"\x05\x00garbage").unwrap();
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), ns());

        let first = ResumePosition::from_document(doc! { "_data": "01" });
        let second = ResumePosition::from_document(doc! { "_data": "02" });
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        assert_eq!(store.load().await, Some(second));
    }

    #[tokio::test]
    async fn test_save_creates_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("tokens").join("nested");
        let store = FileCheckpointStore::new(&nested, ns());

        let pos = ResumePosition::from_document(doc! { "_data": "03" });
        store.save(&pos).await.unwrap();
        assert!(nested.join("shop.orders.token").exists());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let pos = ResumePosition::from_document(doc! { "_data": "04" });
        {
            let store = FileCheckpointStore::new(dir.path(), ns());
            store.save(&pos).await.unwrap();
        }
        let store = FileCheckpointStore::new(dir.path(), ns());
        assert_eq!(store.load().await, Some(pos));
    }

    #[tokio::test]
    async fn test_namespaces_do_not_collide() {
        let dir = tempdir().unwrap();
        let orders = FileCheckpointStore::new(dir.path(), ns());
        let users = FileCheckpointStore::new(dir.path(), Namespace::new("shop", "users"));

        orders
            .save(&ResumePosition::from_document(doc! { "_data": "a" }))
            .await
            .unwrap();
        assert!(users.load().await.is_none());
    }
}
