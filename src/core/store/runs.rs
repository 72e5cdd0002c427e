use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;

use super::{SqliteStore, conflict_or_persistence};
use crate::core::error::{PipelineError, Result};
use crate::core::model::{
    AgentConfigSnapshot, ArtifactSnapshot, Checkpoint, ComposeVersion, Conversation, Run,
    RunStatus, VolumeVersionsSnapshot,
};
use crate::core::ports::{NewCheckpoint, NewConversation, PipelineStore};

/// Terminal runs never change status again.
const OPEN_RUN: &str = "status NOT IN ('completed', 'failed', 'timeout', 'cancelled')";

struct RunRow {
    id: String,
    user_id: String,
    prompt: String,
    status: String,
    compose_version_id: Option<String>,
    vars: String,
    secret_names: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

/// Why a guarded run update touched no rows.
fn closed_run_error(db: &Connection, run_id: &str) -> PipelineError {
    match read_run(db, run_id) {
        Ok(Some(run)) => PipelineError::Conflict(format!(
            "Run {} is already {}",
            run.id,
            run.status.as_str()
        )),
        Ok(None) => PipelineError::not_found(format!("Run {} not found", run_id)),
        Err(err) => err,
    }
}

pub(super) fn read_run(db: &Connection, id: &str) -> Result<Option<Run>> {
    let row = db
        .query_row(
            "SELECT id, user_id, prompt, status, compose_version_id, vars, secret_names, error,
                    created_at, updated_at
             FROM runs WHERE id = ?1",
            params![id],
            |row| {
                Ok(RunRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    prompt: row.get(2)?,
                    status: row.get(3)?,
                    compose_version_id: row.get(4)?,
                    vars: row.get(5)?,
                    secret_names: row.get(6)?,
                    error: row.get(7)?,
                    created_at: row.get(8)?,
                    updated_at: row.get(9)?,
                })
            },
        )
        .optional()?;

    let Some(row) = row else {
        return Ok(None);
    };
    let status = RunStatus::from_status(&row.status).ok_or_else(|| {
        PipelineError::Persistence(format!("run {} has unknown status '{}'", row.id, row.status))
    })?;
    Ok(Some(Run {
        id: row.id,
        user_id: row.user_id,
        prompt: row.prompt,
        status,
        compose_version_id: row.compose_version_id,
        vars: serde_json::from_str(&row.vars)?,
        secret_names: serde_json::from_str(&row.secret_names)?,
        error: row.error,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }))
}

const CONVERSATION_COLUMNS: &str =
    "id, run_id, cli_agent_type, cli_agent_session_id, cli_agent_session_history, created_at";

fn map_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        run_id: row.get(1)?,
        cli_agent_type: row.get(2)?,
        cli_agent_session_id: row.get(3)?,
        cli_agent_session_history: row.get(4)?,
        created_at: row.get(5)?,
    })
}

struct CheckpointRow {
    id: String,
    run_id: String,
    conversation_id: String,
    agent_config_snapshot: String,
    artifact_snapshot: Option<String>,
    volume_versions_snapshot: Option<String>,
    created_at: String,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> Result<Checkpoint> {
        let config: AgentConfigSnapshot = serde_json::from_str(&self.agent_config_snapshot)?;
        let artifact: Option<ArtifactSnapshot> = self
            .artifact_snapshot
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let volumes: Option<VolumeVersionsSnapshot> = self
            .volume_versions_snapshot
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Checkpoint {
            id: self.id,
            run_id: self.run_id,
            conversation_id: self.conversation_id,
            agent_config_snapshot: config,
            artifact_snapshot: artifact,
            volume_versions_snapshot: volumes,
            created_at: self.created_at,
        })
    }
}

fn read_checkpoint(db: &Connection, column: &str, value: &str) -> Result<Option<Checkpoint>> {
    let sql = format!(
        "SELECT id, run_id, conversation_id, agent_config_snapshot, artifact_snapshot,
                volume_versions_snapshot, created_at
         FROM checkpoints WHERE {} = ?1",
        column
    );
    let row = db
        .query_row(&sql, params![value], |row| {
            Ok(CheckpointRow {
                id: row.get(0)?,
                run_id: row.get(1)?,
                conversation_id: row.get(2)?,
                agent_config_snapshot: row.get(3)?,
                artifact_snapshot: row.get(4)?,
                volume_versions_snapshot: row.get(5)?,
                created_at: row.get(6)?,
            })
        })
        .optional()?;
    row.map(CheckpointRow::into_checkpoint).transpose()
}

#[async_trait]
impl PipelineStore for SqliteStore {
    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let db = self.db.lock().await;
        read_run(&db, run_id)
    }

    async fn record_dispatch(
        &self,
        run_id: &str,
        compose_version_id: &str,
        vars: &BTreeMap<String, String>,
        secret_names: &[String],
    ) -> Result<()> {
        let vars = serde_json::to_string(vars)?;
        let names = serde_json::to_string(secret_names)?;
        let db = self.db.lock().await;
        let sql = format!(
            "UPDATE runs SET compose_version_id = ?1, vars = ?2, secret_names = ?3, status = ?4,
                    updated_at = CURRENT_TIMESTAMP
             WHERE id = ?5 AND {}",
            OPEN_RUN
        );
        let rows = db.execute(
            &sql,
            params![
                compose_version_id,
                vars,
                names,
                RunStatus::Running.as_str(),
                run_id
            ],
        )?;
        if rows == 0 {
            return Err(closed_run_error(&db, run_id));
        }
        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        let sql = format!(
            "UPDATE runs SET status = ?1, error = ?2, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?3 AND {}",
            OPEN_RUN
        );
        let rows = db.execute(&sql, params![status.as_str(), error, run_id])?;
        if rows == 0 {
            return Err(closed_run_error(&db, run_id));
        }
        Ok(())
    }

    async fn get_compose_version(&self, id: &str) -> Result<Option<ComposeVersion>> {
        let db = self.db.lock().await;
        let version = db
            .query_row(
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
            )
            .optional()?;
        Ok(version)
    }

    async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        let db = self.db.lock().await;
        read_checkpoint(&db, "id", id)
    }

    async fn get_checkpoint_by_run(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let db = self.db.lock().await;
        read_checkpoint(&db, "run_id", run_id)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS);
        Ok(db.query_row(&sql, params![id], map_conversation).optional()?)
    }

    async fn find_conversation_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Conversation>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM conversations WHERE cli_agent_session_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            CONVERSATION_COLUMNS
        );
        Ok(db.query_row(&sql, params![session_id], map_conversation).optional()?)
    }

    async fn persist_checkpoint(
        &self,
        conversation: NewConversation,
        checkpoint: NewCheckpoint,
    ) -> Result<(Conversation, Checkpoint)> {
        let config = serde_json::to_string(&checkpoint.agent_config_snapshot)?;
        let artifact = checkpoint
            .artifact_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let volumes = checkpoint
            .volume_versions_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conversation_id = uuid::Uuid::new_v4().to_string();
        let checkpoint_id = uuid::Uuid::new_v4().to_string();
        let run_id = conversation.run_id.clone();

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM runs WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(status) = status.as_deref().and_then(RunStatus::from_status)
            && status.is_terminal()
        {
            return Err(PipelineError::Conflict(format!(
                "Run {} is {} and cannot be checkpointed",
                run_id,
                status.as_str()
            )));
        }
        tx.execute(
            "INSERT INTO conversations
                (id, run_id, cli_agent_type, cli_agent_session_id, cli_agent_session_history)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                conversation_id,
                conversation.run_id,
                conversation.cli_agent_type,
                conversation.cli_agent_session_id,
                conversation.cli_agent_session_history
            ],
        )
        .map_err(|e| {
            conflict_or_persistence(e, || format!("Run {} already has a conversation", run_id))
        })?;
        tx.execute(
            "INSERT INTO checkpoints
                (id, run_id, conversation_id, agent_config_snapshot, artifact_snapshot,
                 volume_versions_snapshot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                checkpoint_id,
                checkpoint.run_id,
                conversation_id,
                config,
                artifact,
                volumes
            ],
        )
        .map_err(|e| {
            conflict_or_persistence(e, || format!("Run {} already has a checkpoint", run_id))
        })?;

        let sql = format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS);
        let stored_conversation = tx.query_row(&sql, params![conversation_id], map_conversation)?;
        let stored_checkpoint = read_checkpoint(&tx, "id", &checkpoint_id)?.ok_or_else(|| {
            PipelineError::Persistence(format!("checkpoint {} vanished after insert", checkpoint_id))
        })?;
        tx.commit()?;
        Ok((stored_conversation, stored_checkpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::VolumeSnapshot;

    fn conversation(run_id: &str, session: &str) -> NewConversation {
        NewConversation {
            run_id: run_id.into(),
            cli_agent_type: "claude-code".into(),
            cli_agent_session_id: session.into(),
            cli_agent_session_history: "{}\n".into(),
        }
    }

    fn checkpoint(run_id: &str) -> NewCheckpoint {
        NewCheckpoint {
            run_id: run_id.into(),
            agent_config_snapshot: AgentConfigSnapshot {
                compose_version_id: "cv".into(),
                vars: BTreeMap::from([("env".to_string(), "prod".to_string())]),
                secret_names: vec!["TOKEN".into()],
            },
            artifact_snapshot: Some(ArtifactSnapshot {
                artifact_name: "workspace".into(),
                artifact_version: "v1".into(),
            }),
            volume_versions_snapshot: Some(VolumeVersionsSnapshot::from([(
                "repo".to_string(),
                VolumeSnapshot {
                    version_id: None,
                    branch: Some("run-branch".into()),
                },
            )])),
        }
    }

    #[tokio::test]
    async fn checkpoint_round_trips_through_sqlite() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store.create_run("alice", "go").await.unwrap();
        let (conv, cp) = store
            .persist_checkpoint(conversation(&run.id, "sess-1"), checkpoint(&run.id))
            .await
            .unwrap();

        let loaded = store.get_checkpoint(&cp.id).await.unwrap().unwrap();
        assert_eq!(loaded.conversation_id, conv.id);
        assert_eq!(loaded.agent_config_snapshot.vars["env"], "prod");
        assert_eq!(
            loaded.volume_versions_snapshot.unwrap()["repo"].branch.as_deref(),
            Some("run-branch")
        );
        let by_run = store.get_checkpoint_by_run(&run.id).await.unwrap().unwrap();
        assert_eq!(by_run.id, cp.id);
        let by_session = store
            .find_conversation_by_session("sess-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_session.id, conv.id);
    }

    #[tokio::test]
    async fn duplicate_checkpoint_is_conflict_and_leaves_no_partial_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store.create_run("alice", "go").await.unwrap();
        store
            .persist_checkpoint(conversation(&run.id, "sess-1"), checkpoint(&run.id))
            .await
            .unwrap();
        let err = store
            .persist_checkpoint(conversation(&run.id, "sess-2"), checkpoint(&run.id))
            .await
            .unwrap_err();
        assert_eq!(err.status_class(), "conflict");
        assert!(
            store
                .find_conversation_by_session("sess-2")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn checkpoint_for_unknown_run_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .persist_checkpoint(conversation("ghost", "s"), checkpoint("ghost"))
            .await
            .unwrap_err();
        assert_eq!(err.status_class(), "not_found");
    }

    #[tokio::test]
    async fn dispatch_stores_vars_and_names() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store.create_run("alice", "go").await.unwrap();
        store
            .record_dispatch(
                &run.id,
                "cv",
                &BTreeMap::from([("env".to_string(), "prod".to_string())]),
                &["TOKEN".to_string()],
            )
            .await
            .unwrap();
        let run = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.vars["env"], "prod");
        assert_eq!(run.secret_names, vec!["TOKEN"]);

        let err = store
            .record_dispatch("ghost", "cv", &BTreeMap::new(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancelled_run_stays_cancelled() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store.create_run("alice", "go").await.unwrap();
        store
            .update_run_status(&run.id, RunStatus::Cancelled, None)
            .await
            .unwrap();

        let err = store
            .record_dispatch(&run.id, "cv", &BTreeMap::new(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
        let err = store
            .update_run_status(&run.id, RunStatus::Failed, Some("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
        let err = store
            .persist_checkpoint(conversation(&run.id, "sess-1"), checkpoint(&run.id))
            .await
            .unwrap_err();
        assert_eq!(err.status_class(), "conflict");

        let run = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.error.is_none());
        assert!(store.get_checkpoint_by_run(&run.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_update_on_unknown_run_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .update_run_status("ghost", RunStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }
}
