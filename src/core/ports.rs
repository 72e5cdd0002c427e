//! Collaborator interfaces. Every component receives these explicitly at
//! construction; nothing in the pipeline reaches for ambient globals.

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::error::Result;
use super::model::{
    AgentConfigSnapshot, ArtifactSnapshot, Checkpoint, ComposeVersion, Conversation, Run,
    RunStatus, StorageFile, StorageType, StorageVersion, VolumeVersionsSnapshot,
};
use super::providers::ConnectorDef;

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub run_id: String,
    pub cli_agent_type: String,
    pub cli_agent_session_id: String,
    pub cli_agent_session_history: String,
}

#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub run_id: String,
    pub agent_config_snapshot: AgentConfigSnapshot,
    pub artifact_snapshot: Option<ArtifactSnapshot>,
    pub volume_versions_snapshot: Option<VolumeVersionsSnapshot>,
}

/// Relational persistence for runs, composes, conversations and checkpoints.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// Record what a run was dispatched with and mark it running.
    async fn record_dispatch(
        &self,
        run_id: &str,
        compose_version_id: &str,
        vars: &BTreeMap<String, String>,
        secret_names: &[String],
    ) -> Result<()>;

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()>;

    async fn get_compose_version(&self, id: &str) -> Result<Option<ComposeVersion>>;

    async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>>;

    async fn get_checkpoint_by_run(&self, run_id: &str) -> Result<Option<Checkpoint>>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    /// Most recent conversation carrying this agent-side session id.
    async fn find_conversation_by_session(&self, session_id: &str)
    -> Result<Option<Conversation>>;

    /// Insert the conversation, then the checkpoint that references it, as
    /// one unit. A second checkpoint for the same run is a `Conflict`.
    async fn persist_checkpoint(
        &self,
        conversation: NewConversation,
        checkpoint: NewCheckpoint,
    ) -> Result<(Conversation, Checkpoint)>;
}

/// User-level variables merged across the user's scopes.
#[async_trait]
pub trait VariableStore: Send + Sync {
    async fn merged_vars(&self, user_id: &str) -> Result<BTreeMap<String, String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SecretScope {
    User,
    ModelProvider(String),
    Connector(String),
}

impl SecretScope {
    pub fn key_prefix(&self) -> String {
        match self {
            SecretScope::User => "user".to_string(),
            SecretScope::ModelProvider(id) => format!("model-provider:{}", id),
            SecretScope::Connector(id) => format!("connector:{}", id),
        }
    }
}

/// Durable secret values by user and scope.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Values for the requested names that exist; absent names are omitted.
    async fn get_secrets(
        &self,
        user_id: &str,
        scope: &SecretScope,
        names: &[String],
    ) -> Result<BTreeMap<String, String>>;

    async fn set_secret(
        &self,
        user_id: &str,
        scope: &SecretScope,
        name: &str,
        value: &str,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelProviderRecord {
    pub user_id: String,
    pub provider_type: String,
    pub framework: String,
    pub is_default: bool,
}

#[async_trait]
pub trait ModelProviderStore: Send + Sync {
    async fn get_model_provider(
        &self,
        user_id: &str,
        provider_type: &str,
    ) -> Result<Option<ModelProviderRecord>>;

    async fn get_default_model_provider(
        &self,
        user_id: &str,
        framework: &str,
    ) -> Result<Option<ModelProviderRecord>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorRecord {
    pub user_id: String,
    pub connector_type: String,
    /// Unix seconds; `None` for tokens that never expire.
    pub expires_at: Option<i64>,
}

#[async_trait]
pub trait ConnectorStore: Send + Sync {
    async fn list_connectors(&self, user_id: &str) -> Result<Vec<ConnectorRecord>>;

    async fn update_connector_expiry(
        &self,
        user_id: &str,
        connector_type: &str,
        expires_at: Option<i64>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
}

/// Exchanges a refresh token for a fresh access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, connector: &ConnectorDef, refresh_token: &str)
    -> Result<RefreshedToken>;
}

/// Content-addressed blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// The subset of `hashes` with no stored content.
    async fn missing_blobs(&self, hashes: &[String]) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRecord {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub storage_type: StorageType,
    pub head_version_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionWrite {
    Inserted,
    AlreadyExisted,
}

#[async_trait]
pub trait StorageRepository: Send + Sync {
    /// `storage_id` is derived from the owner, name and type, so the same
    /// bucket always gets the same id.
    async fn get_or_create_storage(
        &self,
        storage_id: &str,
        user_id: &str,
        name: &str,
        storage_type: StorageType,
    ) -> Result<StorageRecord>;

    async fn find_version(&self, storage_id: &str, version_id: &str)
    -> Result<Option<StorageVersion>>;

    async fn version_files(&self, version_id: &str) -> Result<Vec<StorageFile>>;

    /// Insert the version (a no-op when it already exists), confirm the row
    /// is visible, then move the storage HEAD to it, all in one transaction.
    /// A row still absent after the no-op insert is `ConcurrencyFailure`.
    async fn commit_version(
        &self,
        storage_id: &str,
        version_id: &str,
        files: &[StorageFile],
    ) -> Result<VersionWrite>;
}
