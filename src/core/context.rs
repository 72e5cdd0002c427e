//! Execution context builder: the top-level orchestration for one run attempt.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::compose::ComposeDocument;
use super::conversation::{ConversationResolution, ConversationResolver, ConversationSource};
use super::credentials::{CredentialChain, CredentialRequest, ProviderInjection};
use super::error::{PipelineError, Result};
use super::model::{ExecutionContext, ResolvedVolume, ResumeArtifact, RunStatus};
use super::ports::{PipelineStore, VariableStore};
use super::template::{expand_environment, extract_references, ExpansionPools};
use super::volumes::{resolve_volumes, VolumeDefinitions, VolumeOverrides};

/// Inbound build parameters as the API layer receives them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildParams {
    pub run_id: String,
    #[serde(default)]
    pub prompt: String,
    pub checkpoint_id: Option<String>,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
    pub agent_compose_version_id: Option<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub volume_versions: BTreeMap<String, String>,
    pub artifact_name: Option<String>,
    pub artifact_version: Option<String>,
    pub model_provider: Option<String>,
    pub check_env: Option<bool>,
}

/// Where a run's configuration comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunSource {
    New { compose_version_id: String },
    Resume(ConversationSource),
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub run_id: String,
    pub user_id: String,
    pub prompt: String,
    pub source: RunSource,
    pub vars: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    pub volume_versions: BTreeMap<String, String>,
    pub artifact_name: Option<String>,
    pub artifact_version: Option<String>,
    pub model_provider: Option<String>,
    pub check_env: bool,
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl BuildParams {
    /// Validate the request shape. Exactly one source must be given; this
    /// runs before any lookup.
    pub fn into_request(self, user_id: &str, default_check_env: bool) -> Result<BuildRequest> {
        if self.run_id.trim().is_empty() {
            return Err(PipelineError::bad_request("runId is required"));
        }
        if user_id.trim().is_empty() {
            return Err(PipelineError::bad_request("An authenticated user is required"));
        }

        let checkpoint = present(self.checkpoint_id);
        let session = present(self.session_id);
        let conversation = present(self.conversation_id);
        let compose = present(self.agent_compose_version_id);

        let mut sources = Vec::new();
        if let Some(checkpoint_id) = checkpoint {
            sources.push(RunSource::Resume(ConversationSource::Checkpoint { checkpoint_id }));
        }
        if let Some(session_id) = session {
            sources.push(RunSource::Resume(ConversationSource::Session { session_id }));
        }
        match (conversation, compose) {
            (Some(conversation_id), Some(compose_version_id)) => {
                sources.push(RunSource::Resume(ConversationSource::Direct {
                    conversation_id,
                    compose_version_id,
                }))
            }
            (None, Some(compose_version_id)) => {
                sources.push(RunSource::New { compose_version_id })
            }
            (Some(_), None) => {
                return Err(PipelineError::bad_request(
                    "conversationId requires agentComposeVersionId",
                ));
            }
            (None, None) => {}
        }

        if sources.len() > 1 {
            return Err(PipelineError::bad_request(
                "Provide only one of checkpointId, sessionId or agentComposeVersionId",
            ));
        }
        let source = sources.pop().ok_or_else(|| {
            PipelineError::bad_request(
                "One of checkpointId, sessionId or agentComposeVersionId is required",
            )
        })?;

        Ok(BuildRequest {
            run_id: self.run_id,
            user_id: user_id.to_string(),
            prompt: self.prompt,
            source,
            vars: self.vars,
            secrets: self.secrets,
            volume_versions: self.volume_versions,
            artifact_name: present(self.artifact_name),
            artifact_version: present(self.artifact_version),
            model_provider: present(self.model_provider),
            check_env: self.check_env.unwrap_or(default_check_env),
        })
    }
}

pub fn new_sandbox_token() -> String {
    format!("sbx_{}", hex::encode(rand::random::<[u8; 24]>()))
}

pub struct ExecutionContextBuilder {
    store: Arc<dyn PipelineStore>,
    variables: Arc<dyn VariableStore>,
    credentials: CredentialChain,
    resolver: ConversationResolver,
}

impl ExecutionContextBuilder {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        variables: Arc<dyn VariableStore>,
        credentials: CredentialChain,
    ) -> Self {
        Self {
            resolver: ConversationResolver::new(store.clone()),
            store,
            variables,
            credentials,
        }
    }

    pub async fn build(&self, request: &BuildRequest) -> Result<ExecutionContext> {
        let run = self
            .store
            .get_run(&request.run_id)
            .await?
            .filter(|run| run.user_id == request.user_id)
            .ok_or_else(|| PipelineError::not_found(format!("Run {} not found", request.run_id)))?;
        if run.status.is_terminal() {
            return Err(PipelineError::Conflict(format!(
                "Run {} is already {}",
                run.id,
                run.status.as_str()
            )));
        }

        let resolution = match &request.source {
            RunSource::New { .. } => None,
            RunSource::Resume(source) => {
                Some(self.resolver.resolve(&request.user_id, source).await?)
            }
        };

        let (compose_version_id, compose_content) = match (&request.source, &resolution) {
            (_, Some(res)) => (res.compose_version_id.clone(), res.compose_content.clone()),
            (RunSource::New { compose_version_id }, None) => {
                let compose = self
                    .store
                    .get_compose_version(compose_version_id)
                    .await?
                    .filter(|c| c.user_id == request.user_id)
                    .ok_or_else(|| {
                        PipelineError::not_found(format!(
                            "Compose version {} not found",
                            compose_version_id
                        ))
                    })?;
                (compose.id, compose.content)
            }
            (RunSource::Resume(_), None) => {
                return Err(PipelineError::not_found("Conversation could not be resolved"));
            }
        };
        if compose_version_id.is_empty() || compose_content.trim().is_empty() {
            return Err(PipelineError::not_found(format!(
                "Compose version {} has no content",
                compose_version_id
            )));
        }

        let document = ComposeDocument::parse(&compose_content)?;
        let (agent_name, agent) = document.primary_agent()?;
        let references = extract_references(&agent.environment);

        let credential_request = CredentialRequest {
            user_id: &request.user_id,
            framework: &agent.framework,
            environment: &agent.environment,
            references: &references,
            caller_secrets: &request.secrets,
            model_provider: request.model_provider.as_deref(),
        };
        let (credentials, user_vars) = tokio::try_join!(
            self.credentials.resolve(credential_request),
            self.variables.merged_vars(&request.user_id),
        )?;

        // User-level vars < vars recorded on the resumed run < caller vars.
        let mut vars = user_vars;
        if let Some(res) = &resolution {
            vars.extend(res.vars.clone());
        }
        vars.extend(request.vars.clone());

        let secrets = credentials.secrets();
        let mut environment = expand_environment(
            &agent.environment,
            ExpansionPools {
                vars: &vars,
                secrets: &secrets,
                credentials: &credentials.credentials,
            },
            request.check_env,
        )?;
        for (key, value) in &credentials.env_injections {
            environment
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }

        let volumes = resolve_volumes(
            &agent.volumes,
            VolumeDefinitions {
                volumes: &document.volumes,
                dynamic_volumes: &document.dynamic_volumes,
            },
            &vars,
            VolumeOverrides {
                snapshot: resolution.as_ref().and_then(|r| r.volume_versions.as_ref()),
                versions: Some(&request.volume_versions),
            },
        );
        if !volumes.is_ok() {
            warn!(
                run_id = %request.run_id,
                errors = volumes.errors.len(),
                "Volume resolution failed"
            );
            return Err(PipelineError::VolumeResolution(volumes.errors));
        }

        let (artifact_name, artifact_version, resume_artifact) =
            artifact_selection(request, resolution.as_ref(), agent.artifact.as_deref());

        let volume_versions = volumes
            .volumes
            .iter()
            .filter_map(|v| match v {
                ResolvedVolume::ManagedStorage {
                    name,
                    version: Some(version),
                    ..
                } => Some((name.clone(), version.clone())),
                _ => None,
            })
            .collect();

        match &credentials.provider {
            ProviderInjection::Injected { provider, .. } => {
                info!(run_id = %request.run_id, provider = %provider, "Model provider injected")
            }
            ProviderInjection::SkippedIncomplete { provider, .. } => warn!(
                run_id = %request.run_id,
                provider = %provider,
                "No model provider variables injected; credentials incomplete"
            ),
            ProviderInjection::NotNeeded { .. } => {}
        }

        let context = ExecutionContext {
            run_id: request.run_id.clone(),
            user_id: request.user_id.clone(),
            compose_version_id,
            compose_content,
            agent_name: agent_name.to_string(),
            prompt: request.prompt.clone(),
            vars,
            secret_names: credentials.pool.names(),
            secrets,
            sandbox_token: new_sandbox_token(),
            artifact_name,
            artifact_version,
            volume_versions,
            volumes: volumes.volumes,
            environment,
            resume_session: resolution.map(|r| r.session),
            resume_artifact,
        };
        info!(
            run_id = %context.run_id,
            user_id = %context.user_id,
            compose_version_id = %context.compose_version_id,
            volumes = context.volumes.len(),
            resumed = context.resume_session.is_some(),
            "Built execution context"
        );
        Ok(context)
    }

    /// Record what the run was dispatched with and mark it running.
    pub async fn dispatch(&self, context: &ExecutionContext) -> Result<()> {
        self.store
            .record_dispatch(
                &context.run_id,
                &context.compose_version_id,
                &context.vars,
                &context.secret_names,
            )
            .await?;
        info!(run_id = %context.run_id, status = RunStatus::Running.as_str(), "Run dispatched");
        Ok(())
    }
}

fn artifact_selection(
    request: &BuildRequest,
    resolution: Option<&ConversationResolution>,
    declared: Option<&str>,
) -> (Option<String>, Option<String>, Option<ResumeArtifact>) {
    let name = request
        .artifact_name
        .clone()
        .or_else(|| resolution.and_then(|r| r.artifact_name.clone()))
        .or_else(|| declared.map(str::to_string));
    let version = request
        .artifact_version
        .clone()
        .or_else(|| resolution.and_then(|r| r.artifact_version.clone()));

    let resume = match (resolution, &name, &version) {
        (Some(res), Some(name), Some(version)) if res.artifact_pinned => Some(ResumeArtifact {
            artifact_name: name.clone(),
            artifact_version: version.clone(),
        }),
        _ => None,
    };
    (name, version, resume)
}
