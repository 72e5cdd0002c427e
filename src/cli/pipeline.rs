use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;

use agentrun::config::PipelineConfig;
use agentrun::core::blobs::FsBlobStore;
use agentrun::core::checkpoint::{CheckpointEngine, CheckpointRequest, RunCompletion};
use agentrun::core::context::{BuildParams, ExecutionContextBuilder};
use agentrun::core::credentials::CredentialChain;
use agentrun::core::error::PipelineError;
use agentrun::core::oauth::OAuthRefresher;
use agentrun::core::providers::ProviderCatalog;
use agentrun::core::storage::{CommitRequest, StorageCommitter};
use agentrun::core::store::SqliteStore;
use agentrun::core::vault::SecretsVault;
use agentrun::logging::SharedMasker;

use super::CommandArgs;
use super::terminal::{print_status, print_success, print_warn};

/// Long-lived handles opened once per invocation.
pub(crate) struct Services {
    pub store: Arc<SqliteStore>,
    pub vault: Arc<SecretsVault>,
    pub blobs: Arc<FsBlobStore>,
    pub config: PipelineConfig,
}

impl Services {
    pub async fn open(data_dir: &Path, config: PipelineConfig) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("creating data dir {:?}", data_dir))?;
        let store = Arc::new(SqliteStore::open(config.database_path(data_dir))?);
        let vault = Arc::new(SecretsVault::new(
            store.connection(),
            config.vault_key.as_deref(),
        )?);
        vault.initialize().await?;
        let blobs = Arc::new(FsBlobStore::new(config.blob_path(data_dir)).await?);
        Ok(Self {
            store,
            vault,
            blobs,
            config,
        })
    }

    fn context_builder(&self) -> Result<ExecutionContextBuilder> {
        let catalog = Arc::new(ProviderCatalog::load()?);
        let refresher = Arc::new(OAuthRefresher::new(
            self.config.oauth.clone(),
            self.config.refresh_timeout(),
        )?);
        let chain = CredentialChain::new(
            catalog,
            self.vault.clone(),
            self.store.clone(),
            self.store.clone(),
            refresher,
        )
        .with_refresh_skew(self.config.refresh_skew_secs);
        Ok(ExecutionContextBuilder::new(
            self.store.clone(),
            self.store.clone(),
            chain,
        ))
    }
}

async fn read_json<T: DeserializeOwned>(path: &str) -> Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path))
}

/// Keep the error class visible to scripts reading stderr.
fn classified(err: PipelineError) -> anyhow::Error {
    if !err.missing_secrets().is_empty() {
        print_warn(&format!("Missing secrets: {}", err.missing_secrets().join(", ")));
    }
    if !err.missing_vars().is_empty() {
        print_warn(&format!("Missing vars: {}", err.missing_vars().join(", ")));
    }
    anyhow!("[{}] {}", err.status_class(), err)
}

pub(crate) async fn run_pipeline_command(
    cmd: &str,
    args: &CommandArgs,
    services: &Services,
    masker: &SharedMasker,
) -> Result<()> {
    match cmd {
        "build" => build(args, services, masker).await,
        "checkpoint" => {
            let request: CheckpointRequest = read_json(args.positional(0, "webhook.json")?).await?;
            let engine = CheckpointEngine::new(services.store.clone());
            let response = engine
                .create_checkpoint(&request)
                .await
                .map_err(classified)?;
            print_success(&format!("Checkpoint {} recorded", response.checkpoint_id));
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        "complete" => {
            let report: RunCompletion = read_json(args.positional(0, "report.json")?).await?;
            let engine = CheckpointEngine::new(services.store.clone());
            let outcome = engine.complete_run(&report).await.map_err(classified)?;
            print_status("Run", &format!("{} -> {}", report.run_id, outcome.status.as_str()));
            if let Some(checkpoint) = outcome.checkpoint {
                println!("{}", serde_json::to_string_pretty(&checkpoint)?);
            }
            Ok(())
        }
        "commit" => {
            let request: CommitRequest = read_json(args.positional(0, "commit.json")?).await?;
            let committer = StorageCommitter::new(services.store.clone(), services.blobs.clone());
            let outcome = committer
                .commit(&args.user(), &request)
                .await
                .map_err(classified)?;
            if outcome.deduplicated {
                print_status("Storage", "version already existed, HEAD updated");
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        other => Err(anyhow!("Unknown pipeline command '{}'", other)),
    }
}

async fn build(args: &CommandArgs, services: &Services, masker: &SharedMasker) -> Result<()> {
    let params: BuildParams = read_json(args.positional(0, "request.json")?).await?;
    let request = params
        .into_request(&args.user(), services.config.check_env)
        .map_err(classified)?;
    let builder = services.context_builder()?;
    let context = builder.build(&request).await.map_err(classified)?;

    let context_masker = context.masker();
    if let Ok(mut shared) = masker.write() {
        shared.absorb(context_masker.clone());
    }

    if args.switch("--dispatch") {
        builder.dispatch(&context).await.map_err(classified)?;
        print_success(&format!("Run {} dispatched", context.run_id));
    }
    let json = serde_json::to_string_pretty(&context)?;
    println!("{}", context_masker.mask(&json));
    Ok(())
}
