//! Filesystem blob store: content lives at `<root>/<hash[..2]>/<hash>`.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;

use super::error::{PipelineError, Result};
use super::ports::BlobStore;

pub struct FsBlobStore {
    root: PathBuf,
}

fn is_content_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl FsBlobStore {
    pub async fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| PipelineError::Persistence(format!("blob dir {:?}: {}", root, e)))?;
        Ok(Self { root })
    }

    fn blob_path(&self, hash: &str) -> Option<PathBuf> {
        is_content_hash(hash).then(|| self.root.join(&hash[..2]).join(hash))
    }

    /// Store `content` and return its sha256 hex hash.
    pub async fn put(&self, content: &[u8]) -> Result<String> {
        let hash = hex::encode(Sha256::digest(content));
        let path = self
            .blob_path(&hash)
            .ok_or_else(|| PipelineError::Persistence(format!("bad content hash {}", hash)))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::Persistence(e.to_string()))?;
        }
        fs::write(&path, content)
            .await
            .map_err(|e| PipelineError::Persistence(e.to_string()))?;
        Ok(hash)
    }

    pub async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.blob_path(hash) else {
            return Ok(None);
        };
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelineError::Persistence(e.to_string())),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn missing_blobs(&self, hashes: &[String]) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for hash in hashes {
            let present = match self.blob_path(hash) {
                Some(path) => fs::try_exists(&path)
                    .await
                    .map_err(|e| PipelineError::Persistence(e.to_string()))?,
                None => false,
            };
            if !present {
                missing.push(hash.clone());
            }
        }
        Ok(missing)
    }
}
