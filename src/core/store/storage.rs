use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};

use super::SqliteStore;
use crate::core::error::{PipelineError, Result};
use crate::core::model::{StorageFile, StorageType, StorageVersion};
use crate::core::ports::{StorageRecord, StorageRepository, VersionWrite};

#[async_trait]
impl StorageRepository for SqliteStore {
    async fn get_or_create_storage(
        &self,
        storage_id: &str,
        user_id: &str,
        name: &str,
        storage_type: StorageType,
    ) -> Result<StorageRecord> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO storages (id, user_id, name, storage_type) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT DO NOTHING",
            params![storage_id, user_id, name, storage_type.as_str()],
        )?;
        let (id, user, stored_name, kind, head): (String, String, String, String, Option<String>) =
            db.query_row(
                "SELECT id, user_id, name, storage_type, head_version_id FROM storages
                 WHERE user_id = ?1 AND name = ?2 AND storage_type = ?3",
                params![user_id, name, storage_type.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )?;
        let storage_type = StorageType::from_kind(&kind).ok_or_else(|| {
            PipelineError::Persistence(format!("storage {} has unknown type '{}'", id, kind))
        })?;
        Ok(StorageRecord {
            id,
            user_id: user,
            name: stored_name,
            storage_type,
            head_version_id: head,
        })
    }

    async fn find_version(
        &self,
        storage_id: &str,
        version_id: &str,
    ) -> Result<Option<StorageVersion>> {
        let db = self.db.lock().await;
        Ok(db
            .query_row(
                "SELECT id, storage_id, file_count, total_size, created_at FROM storage_versions
                 WHERE id = ?1 AND storage_id = ?2",
                params![version_id, storage_id],
                |row| {
                    Ok(StorageVersion {
                        id: row.get(0)?,
                        storage_id: row.get(1)?,
                        file_count: row.get::<_, i64>(2)? as u64,
                        total_size: row.get::<_, i64>(3)? as u64,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    async fn version_files(&self, version_id: &str) -> Result<Vec<StorageFile>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT path, hash, size FROM storage_files WHERE version_id = ?1 ORDER BY path",
        )?;
        let rows = stmt.query_map(params![version_id], |row| {
            Ok(StorageFile {
                path: row.get(0)?,
                hash: row.get(1)?,
                size: row.get::<_, i64>(2)? as u64,
            })
        })?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    async fn commit_version(
        &self,
        storage_id: &str,
        version_id: &str,
        files: &[StorageFile],
    ) -> Result<VersionWrite> {
        let total_size: u64 = files.iter().map(|f| f.size).sum();
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let inserted = tx.execute(
            "INSERT INTO storage_versions (id, storage_id, file_count, total_size)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO NOTHING",
            params![version_id, storage_id, files.len() as i64, total_size as i64],
        )?;
        if inserted > 0 {
            let mut stmt = tx.prepare(
                "INSERT INTO storage_files (version_id, path, hash, size) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for file in files {
                stmt.execute(params![version_id, file.path, file.hash, file.size as i64])?;
            }
        }

        // The HEAD pointer must never reference a row this transaction cannot see.
        let visible: Option<String> = tx
            .query_row(
                "SELECT id FROM storage_versions WHERE id = ?1 AND storage_id = ?2",
                params![version_id, storage_id],
                |row| row.get(0),
            )
            .optional()?;
        if visible.is_none() {
            return Err(PipelineError::ConcurrencyFailure {
                version_id: version_id.to_string(),
            });
        }

        tx.execute(
            "UPDATE storages SET head_version_id = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![version_id, storage_id],
        )?;
        tx.commit()?;

        Ok(if inserted > 0 {
            VersionWrite::Inserted
        } else {
            VersionWrite::AlreadyExisted
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files() -> Vec<StorageFile> {
        vec![
            StorageFile {
                path: "src/main.rs".into(),
                hash: "aa".into(),
                size: 10,
            },
            StorageFile {
                path: "README.md".into(),
                hash: "bb".into(),
                size: 5,
            },
        ]
    }

    #[tokio::test]
    async fn commit_inserts_once_and_moves_head() {
        let store = SqliteStore::open_in_memory().unwrap();
        let storage = store
            .get_or_create_storage("st_1", "alice", "workspace", StorageType::Artifact)
            .await
            .unwrap();
        assert!(storage.head_version_id.is_none());

        let first = store.commit_version("st_1", "v1", &files()).await.unwrap();
        assert_eq!(first, VersionWrite::Inserted);
        let second = store.commit_version("st_1", "v1", &files()).await.unwrap();
        assert_eq!(second, VersionWrite::AlreadyExisted);

        let version = store.find_version("st_1", "v1").await.unwrap().unwrap();
        assert_eq!(version.file_count, 2);
        assert_eq!(version.total_size, 15);
        let listed = store.version_files("v1").await.unwrap();
        assert_eq!(listed[0].path, "README.md");

        let storage = store
            .get_or_create_storage("st_1", "alice", "workspace", StorageType::Artifact)
            .await
            .unwrap();
        assert_eq!(storage.head_version_id.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn version_owned_by_other_storage_is_not_visible() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (id, name) in [("st_a", "a"), ("st_b", "b")] {
            store
                .get_or_create_storage(id, "alice", name, StorageType::Volume)
                .await
                .unwrap();
        }
        store.commit_version("st_a", "v1", &files()).await.unwrap();
        let err = store
            .commit_version("st_b", "v1", &files())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ConcurrencyFailure { .. }));
        let b = store
            .get_or_create_storage("st_b", "alice", "b", StorageType::Volume)
            .await
            .unwrap();
        assert!(b.head_version_id.is_none());
    }
}
