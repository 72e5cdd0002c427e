//! SQLite persistence for runs, composes, conversations, checkpoints,
//! account settings and storage versions.

mod accounts;
mod runs;
mod storage;

use rusqlite::{Connection, ErrorCode, params};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::error::{PipelineError, Result};
use super::model::{ComposeVersion, Run, RunStatus};
use super::ports::{ConnectorRecord, ModelProviderRecord};

pub use accounts::VariableScope;

pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        prompt TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        compose_version_id TEXT,
        vars TEXT NOT NULL DEFAULT '{}',
        secret_names TEXT NOT NULL DEFAULT '[]',
        error TEXT,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS compose_versions (
        id TEXT PRIMARY KEY,
        compose_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL UNIQUE REFERENCES runs(id),
        cli_agent_type TEXT NOT NULL,
        cli_agent_session_id TEXT NOT NULL,
        cli_agent_session_history TEXT NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE INDEX IF NOT EXISTS idx_conversations_session
        ON conversations(cli_agent_session_id)",
    "CREATE TABLE IF NOT EXISTS checkpoints (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL UNIQUE REFERENCES runs(id),
        conversation_id TEXT NOT NULL REFERENCES conversations(id),
        agent_config_snapshot TEXT NOT NULL,
        artifact_snapshot TEXT,
        volume_versions_snapshot TEXT,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS user_variables (
        user_id TEXT NOT NULL,
        scope TEXT NOT NULL,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (user_id, scope, name)
    )",
    "CREATE TABLE IF NOT EXISTS model_providers (
        user_id TEXT NOT NULL,
        provider_type TEXT NOT NULL,
        framework TEXT NOT NULL,
        is_default INTEGER NOT NULL DEFAULT 0,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (user_id, provider_type)
    )",
    "CREATE TABLE IF NOT EXISTS connectors (
        user_id TEXT NOT NULL,
        connector_type TEXT NOT NULL,
        expires_at INTEGER,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (user_id, connector_type)
    )",
    "CREATE TABLE IF NOT EXISTS storages (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        storage_type TEXT NOT NULL,
        head_version_id TEXT REFERENCES storage_versions(id),
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (user_id, name, storage_type)
    )",
    "CREATE TABLE IF NOT EXISTS storage_versions (
        id TEXT PRIMARY KEY,
        storage_id TEXT NOT NULL REFERENCES storages(id),
        file_count INTEGER NOT NULL,
        total_size INTEGER NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS storage_files (
        version_id TEXT NOT NULL REFERENCES storage_versions(id),
        path TEXT NOT NULL,
        hash TEXT NOT NULL,
        size INTEGER NOT NULL,
        PRIMARY KEY (version_id, path)
    )",
];

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let db = Connection::open(path)?;
        info!("Opened pipeline database at {:?}", path);
        Self::from_connection(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(db: Connection) -> Result<Self> {
        db.execute_batch("PRAGMA foreign_keys = ON;")?;
        for statement in SCHEMA {
            db.execute(statement, [])?;
        }
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Shared handle, so the secret vault can live in the same database.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.db.clone()
    }

    pub async fn create_run(&self, user_id: &str, prompt: &str) -> Result<Run> {
        let id = uuid::Uuid::new_v4().to_string();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO runs (id, user_id, prompt, status) VALUES (?1, ?2, ?3, ?4)",
            params![id, user_id, prompt, RunStatus::Pending.as_str()],
        )?;
        runs::read_run(&db, &id)?
            .ok_or_else(|| PipelineError::Persistence(format!("run {} vanished after insert", id)))
    }

    /// Store a compose version. The id hashes the owner and the content, so
    /// saving the same content twice yields the same version.
    pub async fn save_compose_version(
        &self,
        user_id: &str,
        compose_id: &str,
        content: &str,
    ) -> Result<ComposeVersion> {
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(content.as_bytes());
        let id = format!("{:x}", hasher.finalize());

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO compose_versions (id, compose_id, user_id, content) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO NOTHING",
            params![id, compose_id, user_id, content],
        )?;
        let version = db.query_row(
            "SELECT id, compose_id, user_id, content, created_at FROM compose_versions WHERE id = ?1",
            params![id],
            |row| {
                Ok(ComposeVersion {
                    id: row.get(0)?,
                    compose_id: row.get(1)?,
                    user_id: row.get(2)?,
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )?;
        Ok(version)
    }

    pub async fn set_variable(
        &self,
        user_id: &str,
        scope: VariableScope,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO user_variables (user_id, scope, name, value) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, scope, name) DO UPDATE SET value=excluded.value",
            params![user_id, scope.as_str(), name, value],
        )?;
        Ok(())
    }

    /// Register a model provider. Marking one default clears the flag on the
    /// user's other providers for the same framework.
    pub async fn add_model_provider(&self, record: &ModelProviderRecord) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        if record.is_default {
            tx.execute(
                "UPDATE model_providers SET is_default = 0 WHERE user_id = ?1 AND framework = ?2",
                params![record.user_id, record.framework],
            )?;
        }
        tx.execute(
            "INSERT INTO model_providers (user_id, provider_type, framework, is_default)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, provider_type) DO UPDATE
             SET framework=excluded.framework, is_default=excluded.is_default",
            params![
                record.user_id,
                record.provider_type,
                record.framework,
                record.is_default
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn add_connector(&self, record: &ConnectorRecord) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO connectors (user_id, connector_type, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, connector_type) DO UPDATE SET expires_at=excluded.expires_at",
            params![record.user_id, record.connector_type, record.expires_at],
        )?;
        Ok(())
    }
}

/// Map unique-constraint violations to `Conflict` and dangling references
/// to `NotFound`; everything else is `Persistence`.
fn conflict_or_persistence(err: rusqlite::Error, conflict: impl FnOnce() -> String) -> PipelineError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
        {
            PipelineError::not_found(format!("referenced row does not exist: {}", err))
        }
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            PipelineError::Conflict(conflict())
        }
        _ => err.into(),
    }
}
