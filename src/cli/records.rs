use anyhow::{Context, Result, anyhow, bail};
use std::path::Path;

use agentrun::core::ports::{ConnectorRecord, ModelProviderRecord, SecretScope, SecretStore};
use agentrun::core::store::VariableScope;

use super::CommandArgs;
use super::pipeline::Services;
use super::terminal::{print_info, print_success};

fn secret_scope(args: &CommandArgs) -> Result<SecretScope> {
    match (args.option("--provider"), args.option("--connector")) {
        (Some(_), Some(_)) => bail!("Use only one of --provider and --connector"),
        (Some(provider), None) => Ok(SecretScope::ModelProvider(provider.to_string())),
        (None, Some(connector)) => Ok(SecretScope::Connector(connector.to_string())),
        (None, None) => Ok(SecretScope::User),
    }
}

pub(crate) async fn run_record_command(
    cmd: &str,
    sub_cmd: &str,
    args: &CommandArgs,
    services: &Services,
) -> Result<()> {
    let user = args.user();
    match (cmd, sub_cmd) {
        ("run", "create") => {
            let prompt = args
                .option("--prompt")
                .ok_or_else(|| anyhow!("--prompt is required"))?;
            let run = services.store.create_run(&user, prompt).await?;
            print_success("Run created");
            println!("{}", run.id);
        }
        ("compose", "save") => {
            let path = args.positional(0, "compose.yaml")?;
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path))?;
            let name = match args.option("--name") {
                Some(name) => name.to_string(),
                None => Path::new(path)
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "compose".to_string()),
            };
            let version = services
                .store
                .save_compose_version(&user, &name, &content)
                .await?;
            print_success(&format!("Compose '{}' saved", name));
            println!("{}", version.id);
        }
        ("secret", "set") => {
            let name = args.positional(0, "NAME")?;
            let value = args.positional(1, "VALUE")?;
            let scope = secret_scope(args)?;
            services.vault.set_secret(&user, &scope, name, value).await?;
            print_success(&format!("Secret {} stored ({})", name, scope.key_prefix()));
        }
        ("secret", "list") => {
            let scope = secret_scope(args)?;
            for name in services.vault.list_names(&user, &scope).await? {
                println!("{}", name);
            }
        }
        ("var", "set") => {
            let name = args.positional(0, "NAME")?;
            let value = args.positional(1, "VALUE")?;
            let scope = if args.switch("--org") {
                VariableScope::Org
            } else {
                VariableScope::User
            };
            services
                .store
                .set_variable(&user, scope, name, value)
                .await?;
            print_success(&format!("Variable {} stored ({})", name, scope.as_str()));
        }
        ("provider", "add") => {
            let provider_type = args.positional(0, "provider type")?;
            let framework = args
                .option("--framework")
                .ok_or_else(|| anyhow!("--framework is required"))?;
            services
                .store
                .add_model_provider(&ModelProviderRecord {
                    user_id: user.clone(),
                    provider_type: provider_type.to_string(),
                    framework: framework.to_string(),
                    is_default: args.switch("--default"),
                })
                .await?;
            print_success(&format!("Model provider {} registered", provider_type));
            print_info("Store its credentials with `agentrun secret set NAME VALUE --provider <type>`");
        }
        ("connector", "add") => {
            let connector_type = args.positional(0, "connector type")?;
            let expires_at = args
                .option("--expires-at")
                .map(|raw| raw.parse::<i64>())
                .transpose()
                .context("--expires-at must be unix seconds")?;
            services
                .store
                .add_connector(&ConnectorRecord {
                    user_id: user.clone(),
                    connector_type: connector_type.to_string(),
                    expires_at,
                })
                .await?;
            print_success(&format!("Connector {} registered", connector_type));
        }
        ("blob", "put") => {
            let path = args.positional(0, "file")?;
            let content = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading {}", path))?;
            let hash = services.blobs.put(&content).await?;
            println!("{}\t{}", hash, content.len());
        }
        _ => bail!("Unknown command '{} {}'", cmd, sub_cmd),
    }
    Ok(())
}
