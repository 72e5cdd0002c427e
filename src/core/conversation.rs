//! Conversation resolution: turns a checkpoint id, an agent session id or a
//! direct (conversation, compose version) pair into one normalized shape.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::error::{PipelineError, Result};
use super::model::{
    AgentConfigSnapshot, ArtifactSnapshot, CliAgentType, Checkpoint, Conversation, ResumeSession,
    Run, VolumeVersionsSnapshot,
};
use super::ports::PipelineStore;

/// Exactly one way to locate the conversation a run continues from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationSource {
    /// Resume from an immutable checkpoint; artifact pinned to the snapshot.
    Checkpoint { checkpoint_id: String },
    /// Continue an agent session; artifact follows the storage HEAD.
    Session { session_id: String },
    /// Administrative replay of a known conversation.
    Direct {
        conversation_id: String,
        compose_version_id: String,
    },
}

impl ConversationSource {
    pub fn kind(&self) -> &'static str {
        match self {
            ConversationSource::Checkpoint { .. } => "checkpoint",
            ConversationSource::Session { .. } => "session",
            ConversationSource::Direct { .. } => "direct",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationResolution {
    pub source_run_id: String,
    pub compose_version_id: String,
    pub compose_content: String,
    pub artifact_name: Option<String>,
    /// `None` means the artifact's current HEAD.
    pub artifact_version: Option<String>,
    /// Whether the artifact must be restored from exactly `artifact_version`.
    pub artifact_pinned: bool,
    pub vars: BTreeMap<String, String>,
    pub secret_names: Vec<String>,
    pub volume_versions: Option<VolumeVersionsSnapshot>,
    pub session: ResumeSession,
}

pub struct ConversationResolver {
    store: Arc<dyn PipelineStore>,
}

impl ConversationResolver {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        user_id: &str,
        source: &ConversationSource,
    ) -> Result<ConversationResolution> {
        let resolution = match source {
            ConversationSource::Checkpoint { checkpoint_id } => {
                self.by_checkpoint(user_id, checkpoint_id).await?
            }
            ConversationSource::Session { session_id } => {
                self.by_session(user_id, session_id).await?
            }
            ConversationSource::Direct {
                conversation_id,
                compose_version_id,
            } => {
                self.by_conversation(user_id, conversation_id, compose_version_id)
                    .await?
            }
        };
        info!(
            user_id,
            source = source.kind(),
            source_run_id = %resolution.source_run_id,
            compose_version_id = %resolution.compose_version_id,
            "Resolved conversation"
        );
        Ok(resolution)
    }

    async fn by_checkpoint(
        &self,
        user_id: &str,
        checkpoint_id: &str,
    ) -> Result<ConversationResolution> {
        let not_found = || PipelineError::not_found(format!("Checkpoint {} not found", checkpoint_id));
        let checkpoint = self
            .store
            .get_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(not_found)?;
        let run = self.owned_run(user_id, &checkpoint.run_id).await?.ok_or_else(not_found)?;
        let conversation = self
            .store
            .get_conversation(&checkpoint.conversation_id)
            .await?
            .ok_or_else(|| {
                PipelineError::not_found(format!(
                    "Conversation {} for checkpoint {} not found",
                    checkpoint.conversation_id, checkpoint_id
                ))
            })?;

        self.assemble(&run, &conversation, Some(&checkpoint), SnapshotUse::Pinned)
            .await
    }

    async fn by_session(&self, user_id: &str, session_id: &str) -> Result<ConversationResolution> {
        let not_found = || PipelineError::not_found(format!("Session {} not found", session_id));
        let conversation = self
            .store
            .find_conversation_by_session(session_id)
            .await?
            .ok_or_else(not_found)?;
        let run = self
            .owned_run(user_id, &conversation.run_id)
            .await?
            .ok_or_else(not_found)?;
        let checkpoint = self
            .store
            .get_checkpoint_by_run(&run.id)
            .await?
            .ok_or_else(|| {
                PipelineError::not_found(format!(
                    "Session {} has no checkpoint to continue from",
                    session_id
                ))
            })?;

        self.assemble(&run, &conversation, Some(&checkpoint), SnapshotUse::Head)
            .await
    }

    async fn by_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
        compose_version_id: &str,
    ) -> Result<ConversationResolution> {
        let not_found =
            || PipelineError::not_found(format!("Conversation {} not found", conversation_id));
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(not_found)?;
        let run = self
            .owned_run(user_id, &conversation.run_id)
            .await?
            .ok_or_else(not_found)?;
        let checkpoint = self.store.get_checkpoint_by_run(&run.id).await?;

        let recorded = checkpoint
            .as_ref()
            .map(|cp| cp.agent_config_snapshot.compose_version_id.as_str())
            .or(run.compose_version_id.as_deref());
        if recorded != Some(compose_version_id) {
            return Err(PipelineError::bad_request(format!(
                "Conversation {} does not belong to compose version {}",
                conversation_id, compose_version_id
            )));
        }

        self.assemble(&run, &conversation, checkpoint.as_ref(), SnapshotUse::Pinned)
            .await
    }

    /// The run, if it exists and belongs to `user_id`. Runs owned by other
    /// users are indistinguishable from missing ones.
    async fn owned_run(&self, user_id: &str, run_id: &str) -> Result<Option<Run>> {
        Ok(self
            .store
            .get_run(run_id)
            .await?
            .filter(|run| run.user_id == user_id))
    }

    async fn assemble(
        &self,
        run: &Run,
        conversation: &Conversation,
        checkpoint: Option<&Checkpoint>,
        snapshot_use: SnapshotUse,
    ) -> Result<ConversationResolution> {
        // Fail on an unknown CLI type before touching volumes or sessions.
        let cli_agent_type = CliAgentType::parse(&conversation.cli_agent_type)?;

        let config = match checkpoint {
            Some(cp) => cp.agent_config_snapshot.clone(),
            None => AgentConfigSnapshot {
                compose_version_id: run.compose_version_id.clone().ok_or_else(|| {
                    PipelineError::not_found(format!("Run {} has no compose version", run.id))
                })?,
                vars: run.vars.clone(),
                secret_names: run.secret_names.clone(),
            },
        };

        let compose = self
            .store
            .get_compose_version(&config.compose_version_id)
            .await?
            .ok_or_else(|| {
                PipelineError::not_found(format!(
                    "Compose version {} not found",
                    config.compose_version_id
                ))
            })?;

        let artifact: Option<&ArtifactSnapshot> =
            checkpoint.and_then(|cp| cp.artifact_snapshot.as_ref());
        let pinned = snapshot_use == SnapshotUse::Pinned;
        let (artifact_version, volume_versions) = if pinned {
            (
                artifact.map(|a| a.artifact_version.clone()),
                checkpoint.and_then(|cp| cp.volume_versions_snapshot.clone()),
            )
        } else {
            (None, None)
        };

        Ok(ConversationResolution {
            source_run_id: run.id.clone(),
            compose_version_id: config.compose_version_id,
            compose_content: compose.content,
            artifact_name: artifact.map(|a| a.artifact_name.clone()),
            artifact_version,
            artifact_pinned: pinned && artifact.is_some(),
            vars: config.vars,
            secret_names: config.secret_names,
            volume_versions,
            session: ResumeSession {
                session_id: conversation.cli_agent_session_id.clone(),
                cli_agent_type,
                history: conversation.cli_agent_session_history.clone(),
                working_dir: cli_agent_type.working_dir().to_string(),
                session_dir: cli_agent_type.session_dir().to_string(),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnapshotUse {
    Pinned,
    Head,
}
