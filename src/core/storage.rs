//! Content-addressed storage commits for artifacts and volumes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

use super::error::{PipelineError, Result};
use super::model::{StorageFile, StorageType};
use super::ports::{BlobStore, StorageRepository, VersionWrite};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub storage_name: String,
    pub storage_type: StorageType,
    pub version_id: String,
    pub files: Vec<StorageFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageCommitOutcome {
    pub version_id: String,
    pub deduplicated: bool,
    pub file_count: u64,
}

/// Stable id for a user's named bucket of the given type.
pub fn storage_id_for(user_id: &str, name: &str, storage_type: StorageType) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(storage_type.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    format!("st_{}", &hex::encode(hasher.finalize())[..32])
}

/// Version id over the storage id and the file list. File order does not
/// matter.
pub fn compute_version_id(storage_id: &str, files: &[StorageFile]) -> String {
    let mut lines: Vec<String> = files
        .iter()
        .map(|f| format!("{}\t{}\t{}", f.path, f.hash, f.size))
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    hasher.update(storage_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(lines.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

pub struct StorageCommitter {
    repository: Arc<dyn StorageRepository>,
    blobs: Arc<dyn BlobStore>,
}

impl StorageCommitter {
    pub fn new(repository: Arc<dyn StorageRepository>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { repository, blobs }
    }

    pub async fn commit(&self, user_id: &str, request: &CommitRequest) -> Result<StorageCommitOutcome> {
        validate(request)?;

        let storage_id = storage_id_for(user_id, &request.storage_name, request.storage_type);
        let expected = compute_version_id(&storage_id, &request.files);
        if expected != request.version_id {
            return Err(PipelineError::VersionMismatch {
                expected,
                actual: request.version_id.clone(),
            });
        }

        let hashes: Vec<String> = request
            .files
            .iter()
            .map(|f| f.hash.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let (existing, missing) = tokio::try_join!(
            self.repository.find_version(&storage_id, &expected),
            self.blobs.missing_blobs(&hashes),
        )?;

        if !missing.is_empty() {
            if existing.is_some() {
                warn!(
                    storage = %request.storage_name,
                    version_id = %expected,
                    missing = missing.len(),
                    "Storage version exists without its content"
                );
                return Err(PipelineError::StorageConflict {
                    version_id: expected,
                    missing,
                });
            }
            let missing: BTreeSet<&String> = missing.iter().collect();
            let paths = request
                .files
                .iter()
                .filter(|f| missing.contains(&f.hash))
                .map(|f| f.path.clone())
                .collect();
            return Err(PipelineError::NotUploaded(paths));
        }

        let storage = self
            .repository
            .get_or_create_storage(&storage_id, user_id, &request.storage_name, request.storage_type)
            .await?;
        let write = self
            .repository
            .commit_version(&storage.id, &expected, &request.files)
            .await?;

        let deduplicated = write == VersionWrite::AlreadyExisted;
        info!(
            storage = %request.storage_name,
            storage_type = request.storage_type.as_str(),
            version_id = %expected,
            deduplicated,
            files = request.files.len(),
            "Storage version committed"
        );
        Ok(StorageCommitOutcome {
            version_id: expected,
            deduplicated,
            file_count: request.files.len() as u64,
        })
    }
}

fn validate(request: &CommitRequest) -> Result<()> {
    if request.storage_name.trim().is_empty() {
        return Err(PipelineError::bad_request("storageName is required"));
    }
    if request.version_id.trim().is_empty() {
        return Err(PipelineError::bad_request("versionId is required"));
    }
    let mut seen = BTreeMap::new();
    for file in &request.files {
        if file.path.is_empty() || file.hash.is_empty() {
            return Err(PipelineError::bad_request(
                "Every file needs a path and a content hash",
            ));
        }
        if seen.insert(file.path.as_str(), ()).is_some() {
            return Err(PipelineError::bad_request(format!(
                "Duplicate file path '{}'",
                file.path
            )));
        }
    }
    Ok(())
}
