//! Credential resolution chain.
//!
//! Produces the secrets pool used for expansion and masking, plus model
//! provider env injections. Sources are ranked explicitly
//! (see [`SecretSource`]) so the outcome does not depend on lookup order:
//! caller secrets beat stored secrets, which beat model-provider credentials,
//! which beat connector tokens.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use super::error::{PipelineError, Result};
use super::ports::{
    ConnectorRecord, ConnectorStore, ModelProviderStore, SecretScope, SecretStore, TokenRefresher,
};
use super::providers::{ConnectorDef, ProviderCatalog, ProviderDef};
use super::template::References;

/// Log target for provider injections skipped because credentials were
/// incomplete. Kept separate from general debug output.
pub const PROVIDER_INJECTION_TARGET: &str = "agentrun::provider_injection";

const ACCESS_TOKEN: &str = "access_token";
const REFRESH_TOKEN: &str = "refresh_token";

/// Where a pooled secret came from, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecretSource {
    Connector,
    ModelProvider,
    StoredSecret,
    CallerSecret,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderInjection {
    /// Compose sets provider variables itself, or the framework does not
    /// support automatic injection.
    NotNeeded { reason: String },
    Injected {
        provider: String,
        variables: Vec<String>,
    },
    /// Credentials for the provider were incomplete; nothing was injected.
    SkippedIncomplete {
        provider: String,
        missing: Vec<String>,
    },
}

/// Named secret values with the source that supplied each one.
#[derive(Clone, Default)]
pub struct SecretPool {
    entries: BTreeMap<String, (String, SecretSource)>,
}

impl std::fmt::Debug for SecretPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(name, (_, source))| (name, source)))
            .finish()
    }
}

impl SecretPool {
    /// Insert unless a higher-ranked source already supplied `name`.
    /// Returns whether the value was taken.
    pub fn offer(&mut self, name: &str, value: String, source: SecretSource) -> bool {
        match self.entries.get(name) {
            Some((_, existing)) if *existing > source => false,
            _ => {
                self.entries.insert(name.to_string(), (value, source));
                true
            }
        }
    }

    pub fn source_of(&self, name: &str) -> Option<SecretSource> {
        self.entries.get(name).map(|(_, source)| *source)
    }

    /// Whether `name` is already held by a source ranked above `source`.
    pub fn satisfied_above(&self, name: &str, source: SecretSource) -> bool {
        self.source_of(name).is_some_and(|existing| existing > source)
    }

    pub fn values(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(name, (value, _))| (name.clone(), value.clone()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct CredentialRequest<'a> {
    pub user_id: &'a str,
    pub framework: &'a str,
    pub environment: &'a BTreeMap<String, String>,
    pub references: &'a References,
    pub caller_secrets: &'a BTreeMap<String, String>,
    pub model_provider: Option<&'a str>,
}

#[derive(Clone)]
pub struct CredentialResolution {
    pub pool: SecretPool,
    /// Stored values for `${{ credentials.X }}` references.
    pub credentials: BTreeMap<String, String>,
    /// Env vars added on behalf of the model provider.
    pub env_injections: BTreeMap<String, String>,
    pub provider: ProviderInjection,
}

impl std::fmt::Debug for CredentialResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialResolution")
            .field("pool", &self.pool)
            .field("credentials", &self.credentials.keys().collect::<Vec<_>>())
            .field("env_injections", &self.env_injections.keys().collect::<Vec<_>>())
            .field("provider", &self.provider)
            .finish()
    }
}

impl CredentialResolution {
    pub fn secrets(&self) -> BTreeMap<String, String> {
        self.pool.values()
    }
}

pub struct CredentialChain {
    catalog: Arc<ProviderCatalog>,
    secrets: Arc<dyn SecretStore>,
    providers: Arc<dyn ModelProviderStore>,
    connectors: Arc<dyn ConnectorStore>,
    refresher: Arc<dyn TokenRefresher>,
    refresh_skew_secs: i64,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

impl CredentialChain {
    pub fn new(
        catalog: Arc<ProviderCatalog>,
        secrets: Arc<dyn SecretStore>,
        providers: Arc<dyn ModelProviderStore>,
        connectors: Arc<dyn ConnectorStore>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            catalog,
            secrets,
            providers,
            connectors,
            refresher,
            refresh_skew_secs: 60,
        }
    }

    pub fn with_refresh_skew(mut self, secs: i64) -> Self {
        self.refresh_skew_secs = secs;
        self
    }

    pub async fn resolve(&self, request: CredentialRequest<'_>) -> Result<CredentialResolution> {
        let lookup_names = request.references.stored_lookup_names();

        let (stored, provider_outcome, connected) = tokio::try_join!(
            self.lookup_stored(request.user_id, &lookup_names),
            self.resolve_model_provider(&request),
            self.connectors.list_connectors(request.user_id),
        )?;

        let mut pool = SecretPool::default();
        let mut credentials = BTreeMap::new();

        for (name, value) in stored {
            if request.references.credentials.contains(&name) {
                credentials.insert(name.clone(), value.clone());
            }
            if request.references.secrets.contains(&name) {
                pool.offer(&name, value, SecretSource::StoredSecret);
            }
        }

        for (name, value) in request.caller_secrets {
            pool.offer(name, value.clone(), SecretSource::CallerSecret);
        }

        let (provider, env_injections) = match provider_outcome {
            ProviderOutcome::Injected {
                def,
                values,
                environment,
            } => {
                for (name, value) in values {
                    pool.offer(&name, value, SecretSource::ModelProvider);
                }
                let variables = environment.keys().cloned().collect();
                info!(
                    user_id = request.user_id,
                    provider = %def.id,
                    "Injecting model provider credentials"
                );
                (
                    ProviderInjection::Injected {
                        provider: def.id.clone(),
                        variables,
                    },
                    environment,
                )
            }
            ProviderOutcome::Skipped(injection) => (injection, BTreeMap::new()),
        };

        self.apply_connectors(&request, &connected, &mut pool).await?;

        Ok(CredentialResolution {
            pool,
            credentials,
            env_injections,
            provider,
        })
    }

    async fn lookup_stored(
        &self,
        user_id: &str,
        names: &[String],
    ) -> Result<BTreeMap<String, String>> {
        if names.is_empty() {
            return Ok(BTreeMap::new());
        }
        self.secrets
            .get_secrets(user_id, &SecretScope::User, names)
            .await
    }

    fn provider_def(&self, provider_type: &str) -> Result<&ProviderDef> {
        self.catalog.get_provider(provider_type).ok_or_else(|| {
            PipelineError::bad_request(format!(
                "Unknown model provider type '{}'",
                provider_type
            ))
        })
    }

    async fn resolve_model_provider(&self, request: &CredentialRequest<'_>) -> Result<ProviderOutcome> {
        if self.catalog.sets_provider_env(request.environment) {
            return Ok(ProviderOutcome::Skipped(ProviderInjection::NotNeeded {
                reason: "compose environment configures a model provider".to_string(),
            }));
        }
        if !self.catalog.supports_auto_injection(request.framework) {
            return Ok(ProviderOutcome::Skipped(ProviderInjection::NotNeeded {
                reason: format!(
                    "framework '{}' does not support provider injection",
                    request.framework
                ),
            }));
        }

        let def = match request.model_provider {
            Some(provider_type) => {
                let def = self.provider_def(provider_type)?;
                if def.framework != request.framework {
                    return Err(PipelineError::bad_request(format!(
                        "Model provider '{}' is for framework '{}', but the agent uses '{}'",
                        def.id, def.framework, request.framework
                    )));
                }
                let configured = self
                    .providers
                    .get_model_provider(request.user_id, &def.id)
                    .await?;
                if configured.is_none() {
                    return Err(PipelineError::bad_request(format!(
                        "Model provider '{}' is not configured for this account",
                        def.id
                    )));
                }
                def
            }
            None => {
                let record = self
                    .providers
                    .get_default_model_provider(request.user_id, request.framework)
                    .await?
                    .ok_or_else(|| {
                        PipelineError::bad_request(format!(
                            "No model provider configured for framework '{}'. Configure a default \
                             model provider, pass an explicit modelProvider, or set the provider \
                             environment variables in the compose.",
                            request.framework
                        ))
                    })?;
                self.provider_def(&record.provider_type)?
            }
        };

        let values = self
            .secrets
            .get_secrets(
                request.user_id,
                &SecretScope::ModelProvider(def.id.clone()),
                &def.credentials,
            )
            .await?;

        match def.render_environment(&values) {
            Ok(environment) => Ok(ProviderOutcome::Injected {
                def: def.clone(),
                values,
                environment,
            }),
            Err(missing) => {
                warn!(
                    target: PROVIDER_INJECTION_TARGET,
                    user_id = request.user_id,
                    provider = %def.id,
                    multi_auth = def.is_multi_auth(),
                    missing = ?missing,
                    "Skipping model provider injection: credentials incomplete"
                );
                Ok(ProviderOutcome::Skipped(ProviderInjection::SkippedIncomplete {
                    provider: def.id.clone(),
                    missing,
                }))
            }
        }
    }

    async fn apply_connectors(
        &self,
        request: &CredentialRequest<'_>,
        connected: &[ConnectorRecord],
        pool: &mut SecretPool,
    ) -> Result<()> {
        for record in connected {
            let Some(def) = self.catalog.get_connector(&record.connector_type) else {
                warn!(
                    connector = %record.connector_type,
                    "Ignoring connector with no catalog entry"
                );
                continue;
            };

            // Connectors only fill names the compose asks for.
            let wanted: Vec<(&String, &String)> = def
                .secrets
                .iter()
                .filter(|(name, _)| request.references.references_secret(name))
                .filter(|(name, _)| !pool.satisfied_above(name, SecretSource::Connector))
                .collect();
            if wanted.is_empty() {
                continue;
            }

            let tokens = self.connector_tokens(request.user_id, def, record).await?;
            for (name, field) in wanted {
                if let Some(value) = tokens.get(field) {
                    if pool.offer(name, value.clone(), SecretSource::Connector) {
                        debug!(connector = %def.id, secret = %name, "Connector satisfied secret");
                    }
                }
            }
        }
        Ok(())
    }

    /// Current connector tokens, refreshed first when they are about to
    /// expire. A failed refresh keeps the previous token.
    async fn connector_tokens(
        &self,
        user_id: &str,
        def: &ConnectorDef,
        record: &ConnectorRecord,
    ) -> Result<BTreeMap<String, String>> {
        let scope = SecretScope::Connector(def.id.clone());
        let names = vec![ACCESS_TOKEN.to_string(), REFRESH_TOKEN.to_string()];
        let mut tokens = self.secrets.get_secrets(user_id, &scope, &names).await?;

        let expiring = record
            .expires_at
            .is_some_and(|at| at - self.refresh_skew_secs <= now_unix());
        if !(def.rotates() && expiring) {
            return Ok(tokens);
        }
        let Some(refresh_token) = tokens.get(REFRESH_TOKEN).cloned() else {
            warn!(connector = %def.id, "Connector token expiring but no refresh token stored");
            return Ok(tokens);
        };

        match self.refresher.refresh(def, &refresh_token).await {
            Ok(refreshed) => {
                self.secrets
                    .set_secret(user_id, &scope, ACCESS_TOKEN, &refreshed.access_token)
                    .await?;
                if let Some(rotated) = &refreshed.refresh_token {
                    self.secrets
                        .set_secret(user_id, &scope, REFRESH_TOKEN, rotated)
                        .await?;
                }
                self.connectors
                    .update_connector_expiry(user_id, &def.id, refreshed.expires_at)
                    .await?;
                info!(connector = %def.id, "Refreshed connector access token");
                tokens.insert(ACCESS_TOKEN.to_string(), refreshed.access_token);
            }
            Err(err) => {
                warn!(
                    connector = %def.id,
                    error = %err,
                    "Connector token refresh failed; using previous token"
                );
            }
        }
        Ok(tokens)
    }
}

enum ProviderOutcome {
    Injected {
        def: ProviderDef,
        values: BTreeMap<String, String>,
        environment: BTreeMap<String, String>,
    },
    Skipped(ProviderInjection),
}
