use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::{PipelineError, Result};
use super::masking::SecretMasker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Timeout => "timeout",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "timeout" => Some(RunStatus::Timeout),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Timeout | RunStatus::Cancelled
        )
    }
}

/// One execution attempt. Created by the API layer; the pipeline records the
/// resolved compose version, vars and secret names on dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub user_id: String,
    pub prompt: String,
    pub status: RunStatus,
    pub compose_version_id: Option<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub secret_names: Vec<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Agent CLI flavours that can produce a resumable session transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CliAgentType {
    ClaudeCode,
    Codex,
}

impl CliAgentType {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "claude-code" => Ok(CliAgentType::ClaudeCode),
            "codex" => Ok(CliAgentType::Codex),
            other => Err(PipelineError::bad_request(format!(
                "Unknown agent CLI type '{}'; expected one of: claude-code, codex",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CliAgentType::ClaudeCode => "claude-code",
            CliAgentType::Codex => "codex",
        }
    }

    pub fn working_dir(self) -> &'static str {
        "/home/user/workspace"
    }

    /// Where the CLI keeps its session transcripts inside the sandbox.
    pub fn session_dir(self) -> &'static str {
        match self {
            CliAgentType::ClaudeCode => "/home/user/.claude/projects/-home-user-workspace",
            CliAgentType::Codex => "/home/user/.codex/sessions",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub run_id: String,
    pub cli_agent_type: String,
    pub cli_agent_session_id: String,
    pub cli_agent_session_history: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfigSnapshot {
    pub compose_version_id: String,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// Names only; values are never persisted.
    #[serde(default)]
    pub secret_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSnapshot {
    pub artifact_name: String,
    pub artifact_version: String,
}

/// State of one volume at checkpoint time. Git volumes record the branch the
/// run pushed to; managed-storage volumes record a content version id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

pub type VolumeVersionsSnapshot = BTreeMap<String, VolumeSnapshot>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub run_id: String,
    pub conversation_id: String,
    pub agent_config_snapshot: AgentConfigSnapshot,
    pub artifact_snapshot: Option<ArtifactSnapshot>,
    pub volume_versions_snapshot: Option<VolumeVersionsSnapshot>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeVersion {
    pub id: String,
    pub compose_id: String,
    pub user_id: String,
    /// Raw YAML as authored.
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeSession {
    pub session_id: String,
    pub cli_agent_type: CliAgentType,
    pub history: String,
    pub working_dir: String,
    pub session_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeArtifact {
    pub artifact_name: String,
    pub artifact_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "kebab-case")]
pub enum ResolvedVolume {
    #[serde(rename_all = "camelCase")]
    Git {
        name: String,
        mount_path: String,
        uri: String,
        branch: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ManagedStorage {
        name: String,
        mount_path: String,
        storage_name: String,
        /// `None` means the storage's current HEAD.
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
}

impl ResolvedVolume {
    pub fn name(&self) -> &str {
        match self {
            ResolvedVolume::Git { name, .. } | ResolvedVolume::ManagedStorage { name, .. } => name,
        }
    }

    pub fn mount_path(&self) -> &str {
        match self {
            ResolvedVolume::Git { mount_path, .. }
            | ResolvedVolume::ManagedStorage { mount_path, .. } => mount_path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Artifact,
    Volume,
}

impl StorageType {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageType::Artifact => "artifact",
            StorageType::Volume => "volume",
        }
    }

    pub fn from_kind(value: &str) -> Option<Self> {
        match value {
            "artifact" => Some(StorageType::Artifact),
            "volume" => Some(StorageType::Volume),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageFile {
    pub path: String,
    pub hash: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageVersion {
    pub id: String,
    pub storage_id: String,
    pub file_count: u64,
    pub total_size: u64,
    pub created_at: String,
}

/// Everything the sandbox executor needs for one run attempt. Built once,
/// handed off, then dropped; never persisted as a whole.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub run_id: String,
    pub user_id: String,
    pub compose_version_id: String,
    pub compose_content: String,
    pub agent_name: String,
    pub prompt: String,
    pub vars: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    pub secret_names: Vec<String>,
    pub sandbox_token: String,
    pub artifact_name: Option<String>,
    pub artifact_version: Option<String>,
    pub volume_versions: BTreeMap<String, String>,
    pub volumes: Vec<ResolvedVolume>,
    pub environment: BTreeMap<String, String>,
    pub resume_session: Option<ResumeSession>,
    pub resume_artifact: Option<ResumeArtifact>,
}

impl ExecutionContext {
    /// A masker over every secret value this context carries, including
    /// volume tokens and the sandbox token.
    pub fn masker(&self) -> SecretMasker {
        let mut values: Vec<String> = self.secrets.values().cloned().collect();
        values.push(self.sandbox_token.clone());
        for volume in &self.volumes {
            if let ResolvedVolume::Git {
                token: Some(token), ..
            } = volume
            {
                values.push(token.clone());
            }
        }
        SecretMasker::new(values)
    }

    pub fn agent_config_snapshot(&self) -> AgentConfigSnapshot {
        AgentConfigSnapshot {
            compose_version_id: self.compose_version_id.clone(),
            vars: self.vars.clone(),
            secret_names: self.secret_names.clone(),
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("user_id", &self.user_id)
            .field("compose_version_id", &self.compose_version_id)
            .field("agent_name", &self.agent_name)
            .field("secret_names", &self.secret_names)
            .field("artifact_name", &self.artifact_name)
            .field("artifact_version", &self.artifact_version)
            .field("volumes", &self.volumes.len())
            .field("environment_keys", &self.environment.keys().collect::<Vec<_>>())
            .field("resume_session", &self.resume_session.as_ref().map(|s| &s.session_id))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips_through_strings() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Timeout,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::from_status(status.as_str()), Some(status));
        }
        assert!(RunStatus::from_status("canceled").is_none());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn unknown_cli_agent_type_is_bad_request() {
        let err = CliAgentType::parse("cursor").unwrap_err();
        assert_eq!(err.status_class(), "bad_request");
        assert_eq!(
            CliAgentType::parse("codex").unwrap().session_dir(),
            "/home/user/.codex/sessions"
        );
    }

    #[test]
    fn resolved_volume_serializes_with_driver_tag() {
        let vol = ResolvedVolume::ManagedStorage {
            name: "data".into(),
            mount_path: "/data".into(),
            storage_name: "datasets".into(),
            version: None,
        };
        let json = serde_json::to_value(&vol).unwrap();
        assert_eq!(json["driver"], "managed-storage");
        assert_eq!(json["storageName"], "datasets");
        assert!(json.get("version").is_none());
    }

    #[test]
    fn debug_output_never_contains_secret_values() {
        let ctx = ExecutionContext {
            run_id: "run-1".into(),
            user_id: "u".into(),
            compose_version_id: "v".into(),
            compose_content: String::new(),
            agent_name: "main".into(),
            prompt: "p".into(),
            vars: BTreeMap::new(),
            secrets: BTreeMap::from([("TOKEN".to_string(), "hunter2".to_string())]),
            secret_names: vec!["TOKEN".into()],
            sandbox_token: "sbx_abc".into(),
            artifact_name: None,
            artifact_version: None,
            volume_versions: BTreeMap::new(),
            volumes: vec![],
            environment: BTreeMap::from([("TOKEN".to_string(), "hunter2".to_string())]),
            resume_session: None,
            resume_artifact: None,
        };
        let debug = format!("{:?}", ctx);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("TOKEN"));
        assert_eq!(ctx.masker().mask("key=hunter2"), "key=***");
    }
}
