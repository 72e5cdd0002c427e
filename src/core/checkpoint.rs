//! Checkpoint engine: captures a finished run so it can be resumed exactly.
//!
//! A run only counts as successful once its checkpoint is stored. Any
//! failure to store one demotes the run to `failed`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::error::{PipelineError, Result};
use super::model::{
    AgentConfigSnapshot, ArtifactSnapshot, Checkpoint, CliAgentType, RunStatus,
    VolumeVersionsSnapshot,
};
use super::ports::{NewCheckpoint, NewConversation, PipelineStore};

/// Checkpoint webhook body sent by the sandbox executor.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRequest {
    pub run_id: String,
    pub cli_agent_type: String,
    pub cli_agent_session_id: String,
    pub cli_agent_session_history: String,
    #[serde(default)]
    pub artifact_snapshot: Option<ArtifactSnapshot>,
    #[serde(default)]
    pub volume_versions_snapshot: Option<VolumeVersionsSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointResponse {
    pub checkpoint_id: String,
    pub agent_session_id: String,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<VolumeVersionsSnapshot>,
}

/// Exit report for a sandboxed run.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCompletion {
    pub run_id: String,
    pub exit_code: i32,
    #[serde(default)]
    pub error: Option<String>,
    /// Session capture; required for a zero exit code.
    #[serde(default)]
    pub checkpoint: Option<CheckpointRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionOutcome {
    pub status: RunStatus,
    pub checkpoint: Option<CheckpointResponse>,
}

pub struct CheckpointEngine {
    store: Arc<dyn PipelineStore>,
}

impl CheckpointEngine {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    pub async fn create_checkpoint(&self, request: &CheckpointRequest) -> Result<CheckpointResponse> {
        for (field, value) in [
            ("runId", &request.run_id),
            ("cliAgentSessionId", &request.cli_agent_session_id),
            ("cliAgentSessionHistory", &request.cli_agent_session_history),
        ] {
            if value.trim().is_empty() {
                return Err(PipelineError::bad_request(format!("{} is required", field)));
            }
        }
        let cli_agent_type = CliAgentType::parse(&request.cli_agent_type)?;

        let run = self
            .store
            .get_run(&request.run_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("Run {} not found", request.run_id)))?;
        if run.status.is_terminal() {
            return Err(PipelineError::Conflict(format!(
                "Run {} is {} and cannot be checkpointed",
                run.id,
                run.status.as_str()
            )));
        }
        let compose_version_id = run.compose_version_id.clone().ok_or_else(|| {
            PipelineError::Conflict(format!("Run {} was never dispatched", run.id))
        })?;

        let (conversation, checkpoint) = self
            .store
            .persist_checkpoint(
                NewConversation {
                    run_id: run.id.clone(),
                    cli_agent_type: cli_agent_type.as_str().to_string(),
                    cli_agent_session_id: request.cli_agent_session_id.clone(),
                    cli_agent_session_history: request.cli_agent_session_history.clone(),
                },
                NewCheckpoint {
                    run_id: run.id.clone(),
                    agent_config_snapshot: AgentConfigSnapshot {
                        compose_version_id,
                        vars: run.vars.clone(),
                        secret_names: run.secret_names.clone(),
                    },
                    artifact_snapshot: request.artifact_snapshot.clone(),
                    volume_versions_snapshot: request.volume_versions_snapshot.clone(),
                },
            )
            .await?;

        info!(
            run_id = %run.id,
            checkpoint_id = %checkpoint.id,
            conversation_id = %conversation.id,
            "Checkpoint created"
        );
        Ok(CheckpointResponse {
            checkpoint_id: checkpoint.id,
            agent_session_id: conversation.cli_agent_session_id,
            conversation_id: conversation.id,
            artifact: checkpoint.artifact_snapshot,
            volumes: checkpoint.volume_versions_snapshot,
        })
    }

    async fn response_for(&self, checkpoint: Checkpoint) -> Result<CheckpointResponse> {
        let conversation = self
            .store
            .get_conversation(&checkpoint.conversation_id)
            .await?
            .ok_or_else(|| {
                PipelineError::Persistence(format!(
                    "Conversation {} of checkpoint {} is missing",
                    checkpoint.conversation_id, checkpoint.id
                ))
            })?;
        Ok(CheckpointResponse {
            checkpoint_id: checkpoint.id,
            agent_session_id: conversation.cli_agent_session_id,
            conversation_id: conversation.id,
            artifact: checkpoint.artifact_snapshot,
            volumes: checkpoint.volume_versions_snapshot,
        })
    }

    /// Settle a run from its exit report.
    ///
    /// Reports are idempotent: a checkpoint already stored by the webhook
    /// counts as success, and a repeated success report for a completed
    /// run returns the same outcome. Terminal runs never change status.
    pub async fn complete_run(&self, report: &RunCompletion) -> Result<CompletionOutcome> {
        let run = self
            .store
            .get_run(&report.run_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("Run {} not found", report.run_id)))?;

        if run.status.is_terminal() {
            if run.status == RunStatus::Completed && report.exit_code == 0 {
                let checkpoint = match self.store.get_checkpoint_by_run(&run.id).await? {
                    Some(checkpoint) => Some(self.response_for(checkpoint).await?),
                    None => None,
                };
                info!(run_id = %run.id, "Run already completed");
                return Ok(CompletionOutcome {
                    status: RunStatus::Completed,
                    checkpoint,
                });
            }
            return Err(PipelineError::Conflict(format!(
                "Run {} is already {}",
                run.id,
                run.status.as_str()
            )));
        }

        if report.exit_code != 0 {
            let message = report
                .error
                .clone()
                .unwrap_or_else(|| format!("Agent exited with code {}", report.exit_code));
            warn!(run_id = %run.id, exit_code = report.exit_code, "Run failed");
            self.store
                .update_run_status(&run.id, RunStatus::Failed, Some(&message))
                .await?;
            return Ok(CompletionOutcome {
                status: RunStatus::Failed,
                checkpoint: None,
            });
        }

        let created = match self.store.get_checkpoint_by_run(&run.id).await? {
            Some(existing) => self.response_for(existing).await,
            None => match &report.checkpoint {
                Some(request) if request.run_id == run.id => self.create_checkpoint(request).await,
                Some(request) => Err(PipelineError::bad_request(format!(
                    "Checkpoint is for run {}, not {}",
                    request.run_id, run.id
                ))),
                None => Err(PipelineError::bad_request("No agent session was reported")),
            },
        };

        match created {
            Ok(checkpoint) => {
                self.store
                    .update_run_status(&run.id, RunStatus::Completed, None)
                    .await?;
                info!(run_id = %run.id, checkpoint_id = %checkpoint.checkpoint_id, "Run completed");
                Ok(CompletionOutcome {
                    status: RunStatus::Completed,
                    checkpoint: Some(checkpoint),
                })
            }
            Err(err) => {
                let reason = err.to_string();
                error!(run_id = %run.id, error = %reason, "Checkpoint failed; marking run failed");
                self.store
                    .update_run_status(
                        &run.id,
                        RunStatus::Failed,
                        Some(&format!("Checkpoint creation failed: {}", reason)),
                    )
                    .await?;
                Err(PipelineError::CheckpointFailed {
                    run_id: run.id,
                    reason,
                })
            }
        }
    }
}
