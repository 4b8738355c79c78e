//! Artifact store
//!
//! Blobs (raw extracts, reports, sampling packets, uploaded source files) are
//! kept outside the database. `FsArtifactStore` is content-addressed: the
//! locator is derived from the SHA-256 of the bytes, and `get` re-verifies it.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::{MigrationError, MigrationResult};
use crate::models::{ArtifactKind, ArtifactRef};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, kind: ArtifactKind, bytes: &[u8]) -> MigrationResult<ArtifactRef>;

    async fn get(&self, locator: &str) -> MigrationResult<Vec<u8>>;
}

/// Hex SHA-256 of `bytes`
pub fn checksum(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Filesystem store under `<root>/artifacts/<aa>/<sha256>`
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    base: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root_folder: &Path) -> Self {
        Self {
            base: root_folder.join("artifacts"),
        }
    }

    fn path_for(&self, locator: &str) -> MigrationResult<PathBuf> {
        let (prefix, hash) = locator
            .split_once('/')
            .ok_or_else(|| MigrationError::NotFound(format!("artifact {}", locator)))?;
        let well_formed = hash.len() == 64
            && hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
            && prefix == &hash[..2];
        if !well_formed {
            return Err(MigrationError::NotFound(format!("artifact {}", locator)));
        }
        Ok(self.base.join(prefix).join(hash))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, kind: ArtifactKind, bytes: &[u8]) -> MigrationResult<ArtifactRef> {
        let checksum = checksum(bytes);
        let locator = format!("{}/{}", &checksum[..2], checksum);
        let path = self.path_for(&locator)?;

        if tokio::fs::try_exists(&path)
            .await
            .map_err(cmig_common::Error::Io)?
        {
            tracing::debug!(kind = %kind, locator = %locator, "Artifact already stored");
            return Ok(ArtifactRef { locator, checksum });
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(cmig_common::Error::Io)?;
        }

        // Write then rename so a crash never leaves a truncated blob under its hash
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(cmig_common::Error::Io)?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(cmig_common::Error::Io)?;

        tracing::debug!(kind = %kind, locator = %locator, size = bytes.len(), "Artifact stored");
        Ok(ArtifactRef { locator, checksum })
    }

    async fn get(&self, locator: &str) -> MigrationResult<Vec<u8>> {
        let path = self.path_for(locator)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MigrationError::NotFound(format!("artifact {}", locator)));
            }
            Err(e) => return Err(cmig_common::Error::Io(e).into()),
        };

        let expected = locator.rsplit('/').next().unwrap_or_default();
        if checksum(&bytes) != expected {
            tracing::error!(locator = %locator, "Artifact checksum mismatch");
            return Err(MigrationError::System(format!(
                "artifact {} failed checksum verification",
                locator
            )));
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_then_get_verifies_content() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path());

        let stored = store.put(ArtifactKind::Report, b"{\"ok\":true}").await.unwrap();
        assert_eq!(stored.checksum, checksum(b"{\"ok\":true}"));
        assert_eq!(store.get(&stored.locator).await.unwrap(), b"{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_identical_content_shares_locator() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path());

        let a = store.put(ArtifactKind::RawExtract, b"same").await.unwrap();
        let b = store.put(ArtifactKind::Upload, b"same").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_tampered_blob_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path());

        let stored = store.put(ArtifactKind::Report, b"original").await.unwrap();
        let path = store.path_for(&stored.locator).unwrap();
        std::fs::write(&path, b"modified").unwrap();

        assert!(matches!(
            store.get(&stored.locator).await,
            Err(MigrationError::System(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_locator_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path());

        assert!(matches!(
            store.get("../../etc/passwd").await,
            Err(MigrationError::NotFound(_))
        ));
    }
}
