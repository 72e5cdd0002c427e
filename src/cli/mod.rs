mod pipeline;
mod records;
pub(crate) mod terminal;

use anyhow::{Result, bail};
use console::style;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use agentrun::config::{self, PipelineConfig};
use agentrun::core::masking::SecretMasker;
use agentrun::logging::{self, SharedMasker};

use self::pipeline::Services;
use self::terminal::{GuideSection, print_error};

fn print_help() {
    GuideSection::new("Pipeline")
        .command("build <request.json> [--dispatch]", "Resolve an execution context")
        .command("checkpoint <webhook.json>", "Record a checkpoint for a finished run")
        .command("complete <report.json>", "Apply an executor exit report")
        .command("commit <commit.json>", "Commit a storage version")
        .print();

    GuideSection::new("Records")
        .command("run create --prompt <text>", "Create a pending run")
        .command("compose save <compose.yaml> [--name N]", "Store a compose version")
        .command("secret set <NAME> <VALUE> [--provider P | --connector C]", "Store a secret")
        .command("var set <NAME> <VALUE> [--org]", "Store a variable")
        .command("provider add <type> --framework F [--default]", "Register a model provider")
        .command("connector add <type> [--expires-at UNIX]", "Register a connected account")
        .command("blob put <file>", "Upload file content, print its hash")
        .print();

    println!(
        "\n {} {} <command> [args] [--user <id>]\n",
        style("Usage:").bold(),
        style("agentrun").green()
    );
}

const VALUE_FLAGS: &[&str] = &[
    "--user",
    "--prompt",
    "--name",
    "--provider",
    "--connector",
    "--framework",
    "--expires-at",
];

/// Positional arguments plus `--flag value` options and bare switches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CommandArgs {
    pub positional: Vec<String>,
    pub options: BTreeMap<String, String>,
    pub switches: BTreeSet<String>,
}

impl CommandArgs {
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    pub fn switch(&self, name: &str) -> bool {
        self.switches.contains(name)
    }

    pub fn positional(&self, index: usize, what: &str) -> Result<&str> {
        match self.positional.get(index) {
            Some(value) => Ok(value.as_str()),
            None => bail!("Missing argument: {}", what),
        }
    }

    /// `--user`, else the local account name.
    pub fn user(&self) -> String {
        self.option("--user")
            .map(str::to_string)
            .unwrap_or_else(whoami::username)
    }
}

pub(crate) fn parse_command_args(args: &[String], start: usize) -> CommandArgs {
    let mut parsed = CommandArgs::default();
    let mut i = start;
    while i < args.len() {
        let arg = args[i].as_str();
        if VALUE_FLAGS.contains(&arg) {
            if i + 1 < args.len() {
                parsed.options.insert(arg.to_string(), args[i + 1].clone());
                i += 2;
            } else {
                i += 1;
            }
        } else if arg.starts_with("--") {
            parsed.switches.insert(arg.to_string());
            i += 1;
        } else {
            parsed.positional.push(arg.to_string());
            i += 1;
        }
    }
    parsed
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(String::as_str).unwrap_or("help");
    if matches!(cmd, "help" | "--help" | "-h") {
        print_help();
        return Ok(());
    }

    let data_dir = config::data_dir();
    let config = PipelineConfig::load(&data_dir).await?;
    let masker: SharedMasker = Arc::new(RwLock::new(SecretMasker::default()));
    logging::init(&config.log_level, masker.clone());

    let services = Services::open(&data_dir, config).await?;

    match cmd {
        "build" | "checkpoint" | "complete" | "commit" => {
            let parsed = parse_command_args(&args, 2);
            pipeline::run_pipeline_command(cmd, &parsed, &services, &masker).await
        }
        "run" | "compose" | "secret" | "var" | "provider" | "connector" | "blob" => {
            let sub_cmd = args.get(2).map(String::as_str).unwrap_or("");
            let parsed = parse_command_args(&args, 3);
            records::run_record_command(cmd, sub_cmd, &parsed, &services).await
        }
        _ => {
            print_error(&format!("Unknown command '{}'.", cmd));
            print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_command_args;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_command_args_splits_positionals_options_and_switches() {
        let parsed = parse_command_args(
            &args(&[
                "agentrun",
                "build",
                "request.json",
                "--user",
                "alice",
                "--dispatch",
            ]),
            2,
        );
        assert_eq!(parsed.positional, vec!["request.json"]);
        assert_eq!(parsed.option("--user"), Some("alice"));
        assert!(parsed.switch("--dispatch"));
        assert_eq!(parsed.user(), "alice");
    }

    #[test]
    fn dangling_value_flag_is_ignored() {
        let parsed = parse_command_args(&args(&["agentrun", "var", "set", "A", "--user"]), 3);
        assert_eq!(parsed.positional, vec!["A"]);
        assert!(parsed.option("--user").is_none());
        assert!(parsed.positional(1, "VALUE").is_err());
    }
}
