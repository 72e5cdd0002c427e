//! In-memory port implementations for unit tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use super::error::{PipelineError, Result};
use super::model::{
    Checkpoint, ComposeVersion, Conversation, Run, RunStatus, StorageFile, StorageType,
    StorageVersion,
};
use super::ports::{
    BlobStore, ConnectorRecord, ConnectorStore, ModelProviderRecord, ModelProviderStore,
    NewCheckpoint, NewConversation, PipelineStore, RefreshedToken, SecretScope, SecretStore,
    StorageRecord, StorageRepository, TokenRefresher, VariableStore, VersionWrite,
};
use super::providers::ConnectorDef;

pub const TS: &str = "2026-01-01 00:00:00";

#[derive(Default)]
pub struct FakeSecrets {
    values: Mutex<BTreeMap<(String, SecretScope, String), String>>,
}

impl FakeSecrets {
    pub fn put(&self, user_id: &str, scope: SecretScope, name: &str, value: &str) {
        self.values.lock().unwrap().insert(
            (user_id.to_string(), scope, name.to_string()),
            value.to_string(),
        );
    }

    pub fn value(&self, user_id: &str, scope: &SecretScope, name: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), scope.clone(), name.to_string()))
            .cloned()
    }
}

#[async_trait]
impl SecretStore for FakeSecrets {
    async fn get_secrets(
        &self,
        user_id: &str,
        scope: &SecretScope,
        names: &[String],
    ) -> Result<BTreeMap<String, String>> {
        Ok(names
            .iter()
            .filter_map(|name| {
                self.value(user_id, scope, name)
                    .map(|value| (name.clone(), value))
            })
            .collect())
    }

    async fn set_secret(
        &self,
        user_id: &str,
        scope: &SecretScope,
        name: &str,
        value: &str,
    ) -> Result<()> {
        self.put(user_id, scope.clone(), name, value);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeProviders {
    records: Mutex<Vec<ModelProviderRecord>>,
}

impl FakeProviders {
    pub fn add(&self, record: ModelProviderRecord) {
        self.records.lock().unwrap().push(record);
    }
}

#[async_trait]
impl ModelProviderStore for FakeProviders {
    async fn get_model_provider(
        &self,
        user_id: &str,
        provider_type: &str,
    ) -> Result<Option<ModelProviderRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.user_id == user_id && r.provider_type == provider_type)
            .cloned())
    }

    async fn get_default_model_provider(
        &self,
        user_id: &str,
        framework: &str,
    ) -> Result<Option<ModelProviderRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.user_id == user_id && r.framework == framework && r.is_default)
            .cloned())
    }
}

#[derive(Default)]
pub struct FakeConnectors {
    records: Mutex<Vec<ConnectorRecord>>,
}

impl FakeConnectors {
    pub fn add(&self, record: ConnectorRecord) {
        self.records.lock().unwrap().push(record);
    }

    pub fn expiry(&self, user_id: &str, connector_type: &str) -> Option<i64> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.user_id == user_id && r.connector_type == connector_type)
            .and_then(|r| r.expires_at)
    }
}

#[async_trait]
impl ConnectorStore for FakeConnectors {
    async fn list_connectors(&self, user_id: &str) -> Result<Vec<ConnectorRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn update_connector_expiry(
        &self,
        user_id: &str,
        connector_type: &str,
        expires_at: Option<i64>,
    ) -> Result<()> {
        for record in self.records.lock().unwrap().iter_mut() {
            if record.user_id == user_id && record.connector_type == connector_type {
                record.expires_at = expires_at;
            }
        }
        Ok(())
    }
}

/// Fails every refresh unless configured with [`FakeRefresher::succeed_with`].
#[derive(Default)]
pub struct FakeRefresher {
    outcome: Mutex<Option<RefreshedToken>>,
}

impl FakeRefresher {
    pub fn succeed_with(&self, access_token: &str, expires_at: Option<i64>) {
        *self.outcome.lock().unwrap() = Some(RefreshedToken {
            access_token: access_token.to_string(),
            refresh_token: None,
            expires_at,
        });
    }
}

#[async_trait]
impl TokenRefresher for FakeRefresher {
    async fn refresh(&self, connector: &ConnectorDef, _refresh_token: &str) -> Result<RefreshedToken> {
        self.outcome
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PipelineError::Refresh(format!("{} refresh rejected", connector.id)))
    }
}

#[derive(Default)]
struct StoreState {
    runs: BTreeMap<String, Run>,
    composes: BTreeMap<String, ComposeVersion>,
    conversations: Vec<Conversation>,
    checkpoints: Vec<Checkpoint>,
    vars: BTreeMap<String, BTreeMap<String, String>>,
    fail_checkpoints: bool,
}

#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    pub fn add_run(&self, id: &str, user_id: &str, status: RunStatus) {
        self.state.lock().unwrap().runs.insert(
            id.to_string(),
            Run {
                id: id.to_string(),
                user_id: user_id.to_string(),
                prompt: "do the thing".to_string(),
                status,
                compose_version_id: None,
                vars: BTreeMap::new(),
                secret_names: Vec::new(),
                error: None,
                created_at: TS.to_string(),
                updated_at: TS.to_string(),
            },
        );
    }

    pub fn add_compose(&self, id: &str, user_id: &str, content: &str) {
        self.state.lock().unwrap().composes.insert(
            id.to_string(),
            ComposeVersion {
                id: id.to_string(),
                compose_id: format!("compose-{}", id),
                user_id: user_id.to_string(),
                content: content.to_string(),
                created_at: TS.to_string(),
            },
        );
    }

    pub fn set_user_vars(&self, user_id: &str, vars: &[(&str, &str)]) {
        self.state.lock().unwrap().vars.insert(
            user_id.to_string(),
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }

    pub fn fail_checkpoints(&self) {
        self.state.lock().unwrap().fail_checkpoints = true;
    }

    pub fn run(&self, id: &str) -> Option<Run> {
        self.state.lock().unwrap().runs.get(id).cloned()
    }

    pub fn checkpoint_count(&self) -> usize {
        self.state.lock().unwrap().checkpoints.len()
    }
}

/// Same guard as the SQLite store: terminal runs are never updated.
fn open_run<'a>(state: &'a mut StoreState, run_id: &str) -> Result<&'a mut Run> {
    let run = state
        .runs
        .get_mut(run_id)
        .ok_or_else(|| PipelineError::not_found(format!("Run {} not found", run_id)))?;
    if run.status.is_terminal() {
        return Err(PipelineError::Conflict(format!(
            "Run {} is already {}",
            run.id,
            run.status.as_str()
        )));
    }
    Ok(run)
}

#[async_trait]
impl PipelineStore for FakeStore {
    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.run(run_id))
    }

    async fn record_dispatch(
        &self,
        run_id: &str,
        compose_version_id: &str,
        vars: &BTreeMap<String, String>,
        secret_names: &[String],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let run = open_run(&mut state, run_id)?;
        run.compose_version_id = Some(compose_version_id.to_string());
        run.vars = vars.clone();
        run.secret_names = secret_names.to_vec();
        run.status = RunStatus::Running;
        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let run = open_run(&mut state, run_id)?;
        run.status = status;
        run.error = error.map(str::to_string);
        Ok(())
    }

    async fn get_compose_version(&self, id: &str) -> Result<Option<ComposeVersion>> {
        Ok(self.state.lock().unwrap().composes.get(id).cloned())
    }

    async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .checkpoints
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn get_checkpoint_by_run(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .checkpoints
            .iter()
            .find(|c| c.run_id == run_id)
            .cloned())
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn find_conversation_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Conversation>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .conversations
            .iter()
            .rev()
            .find(|c| c.cli_agent_session_id == session_id)
            .cloned())
    }

    async fn persist_checkpoint(
        &self,
        conversation: NewConversation,
        checkpoint: NewCheckpoint,
    ) -> Result<(Conversation, Checkpoint)> {
        let mut state = self.state.lock().unwrap();
        if state.fail_checkpoints {
            return Err(PipelineError::Persistence("disk full".to_string()));
        }
        if let Some(run) = state.runs.get(&conversation.run_id)
            && run.status.is_terminal()
        {
            return Err(PipelineError::Conflict(format!(
                "Run {} is {} and cannot be checkpointed",
                run.id,
                run.status.as_str()
            )));
        }
        if state
            .conversations
            .iter()
            .any(|c| c.run_id == conversation.run_id)
        {
            return Err(PipelineError::Conflict(format!(
                "Run {} already has a conversation",
                conversation.run_id
            )));
        }
        let conv = Conversation {
            id: format!("conv-{}", state.conversations.len() + 1),
            run_id: conversation.run_id,
            cli_agent_type: conversation.cli_agent_type,
            cli_agent_session_id: conversation.cli_agent_session_id,
            cli_agent_session_history: conversation.cli_agent_session_history,
            created_at: TS.to_string(),
        };
        let cp = Checkpoint {
            id: format!("cp-{}", state.checkpoints.len() + 1),
            run_id: checkpoint.run_id,
            conversation_id: conv.id.clone(),
            agent_config_snapshot: checkpoint.agent_config_snapshot,
            artifact_snapshot: checkpoint.artifact_snapshot,
            volume_versions_snapshot: checkpoint.volume_versions_snapshot,
            created_at: TS.to_string(),
        };
        state.conversations.push(conv.clone());
        state.checkpoints.push(cp.clone());
        Ok((conv, cp))
    }
}

#[async_trait]
impl VariableStore for FakeStore {
    async fn merged_vars(&self, user_id: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .vars
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeBlobs {
    present: Mutex<BTreeSet<String>>,
}

impl FakeBlobs {
    pub fn add(&self, hash: &str) {
        self.present.lock().unwrap().insert(hash.to_string());
    }

    pub fn remove(&self, hash: &str) {
        self.present.lock().unwrap().remove(hash);
    }
}

#[async_trait]
impl BlobStore for FakeBlobs {
    async fn missing_blobs(&self, hashes: &[String]) -> Result<Vec<String>> {
        let present = self.present.lock().unwrap();
        Ok(hashes
            .iter()
            .filter(|h| !present.contains(*h))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct RepositoryState {
    storages: BTreeMap<String, StorageRecord>,
    versions: BTreeMap<String, (StorageVersion, Vec<StorageFile>)>,
    lose_inserts: bool,
}

#[derive(Default)]
pub struct FakeRepository {
    state: Mutex<RepositoryState>,
}

impl FakeRepository {
    /// Simulate a concurrent transaction hiding the inserted version row.
    pub fn lose_inserts(&self) {
        self.state.lock().unwrap().lose_inserts = true;
    }

    pub fn version_count(&self) -> usize {
        self.state.lock().unwrap().versions.len()
    }

    pub fn storage_count(&self) -> usize {
        self.state.lock().unwrap().storages.len()
    }
}

#[async_trait]
impl StorageRepository for FakeRepository {
    async fn get_or_create_storage(
        &self,
        storage_id: &str,
        user_id: &str,
        name: &str,
        storage_type: StorageType,
    ) -> Result<StorageRecord> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .storages
            .entry(storage_id.to_string())
            .or_insert_with(|| StorageRecord {
                id: storage_id.to_string(),
                user_id: user_id.to_string(),
                name: name.to_string(),
                storage_type,
                head_version_id: None,
            })
            .clone())
    }

    async fn find_version(
        &self,
        _storage_id: &str,
        version_id: &str,
    ) -> Result<Option<StorageVersion>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .versions
            .get(version_id)
            .map(|(version, _)| version.clone()))
    }

    async fn version_files(&self, version_id: &str) -> Result<Vec<StorageFile>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .versions
            .get(version_id)
            .map(|(_, files)| files.clone())
            .unwrap_or_default())
    }

    async fn commit_version(
        &self,
        storage_id: &str,
        version_id: &str,
        files: &[StorageFile],
    ) -> Result<VersionWrite> {
        let mut state = self.state.lock().unwrap();
        if state.lose_inserts {
            return Err(PipelineError::ConcurrencyFailure {
                version_id: version_id.to_string(),
            });
        }
        let write = if state.versions.contains_key(version_id) {
            VersionWrite::AlreadyExisted
        } else {
            let version = StorageVersion {
                id: version_id.to_string(),
                storage_id: storage_id.to_string(),
                file_count: files.len() as u64,
                total_size: files.iter().map(|f| f.size).sum(),
                created_at: TS.to_string(),
            };
            state
                .versions
                .insert(version_id.to_string(), (version, files.to_vec()));
            VersionWrite::Inserted
        };
        if let Some(storage) = state.storages.get_mut(storage_id) {
            storage.head_version_id = Some(version_id.to_string());
        }
        Ok(write)
    }
}
