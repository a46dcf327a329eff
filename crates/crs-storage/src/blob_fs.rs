//! Filesystem-backed blob container.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::{sha256_hex, validate_blob_name, BlobStore, StoreError, StoredBlob};

/// One directory acting as a blob container. Writes go to a temp file in the
/// same directory and are renamed over the target, so readers never observe
/// a half-written document. Content types are not persisted.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_blob_name(name)?;
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get_blob(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(name)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put_blob(
        &self,
        name: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<StoredBlob, StoreError> {
        let path = self.blob_path(name)?;
        fs::create_dir_all(&self.root).await?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }

        tracing::debug!(blob = name, bytes = bytes.len(), "blob written");
        Ok(StoredBlob {
            name: name.to_string(),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path().join("calc-settings"));
        let err = store.get_blob("settings.json").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn writes_replace_previous_content_atomically() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path().join("calc-settings"));

        let first = store
            .put_blob("settings.json", br#"{"v":1}"#, "application/json")
            .await
            .expect("first put");
        let second = store
            .put_blob("settings.json", br#"{"v":2}"#, "application/json")
            .await
            .expect("second put");

        assert_ne!(first.content_hash, second.content_hash);
        assert_eq!(
            store.get_blob("settings.json").await.expect("read"),
            br#"{"v":2}"#.to_vec()
        );

        let leftovers = std::fs::read_dir(store.root())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn rejects_names_outside_the_container() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        let err = store
            .put_blob("../escape.json", b"{}", "application/json")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidName(_)));
    }
}
