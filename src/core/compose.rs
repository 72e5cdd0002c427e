//! Compose documents: the declarative agent definition a run executes.

use serde::Deserialize;
use std::collections::BTreeMap;

use super::error::{PipelineError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct ComposeDocument {
    #[serde(default)]
    pub version: Option<String>,
    pub agents: BTreeMap<String, AgentDefinition>,
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeDefinition>,
    #[serde(default)]
    pub dynamic_volumes: BTreeMap<String, VolumeDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentDefinition {
    /// Agent framework, e.g. `claude-code` or `codex`.
    #[serde(alias = "provider")]
    pub framework: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// `name:/mount/path` declarations.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Optional artifact storage mounted at the working directory.
    #[serde(default)]
    pub artifact: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeDefinition {
    pub driver: String,
    #[serde(alias = "url")]
    pub uri: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

impl ComposeDocument {
    pub fn parse(content: &str) -> Result<Self> {
        let doc: ComposeDocument = serde_yaml::from_str(content)
            .map_err(|e| PipelineError::bad_request(format!("Invalid compose content: {}", e)))?;
        if doc.agents.is_empty() {
            return Err(PipelineError::bad_request(
                "Compose must define at least one agent",
            ));
        }
        Ok(doc)
    }

    /// The agent a run executes. Composes carry a single agent; more than one
    /// is ambiguous and rejected.
    pub fn primary_agent(&self) -> Result<(&str, &AgentDefinition)> {
        let mut iter = self.agents.iter();
        match (iter.next(), iter.next()) {
            (Some((name, agent)), None) => Ok((name.as_str(), agent)),
            _ => Err(PipelineError::bad_request(format!(
                "Compose defines {} agents; exactly one is supported per run",
                self.agents.len()
            ))),
        }
    }

    /// Static definitions shadow dynamic ones with the same name.
    pub fn volume_definition(&self, name: &str) -> Option<&VolumeDefinition> {
        self.volumes
            .get(name)
            .or_else(|| self.dynamic_volumes.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: "1.0"
agents:
  coder:
    provider: claude-code
    volumes:
      - "repo:/home/user/repo"
    environment:
      FOO: "${{ vars.env }}"
volumes:
  repo:
    driver: git
    url: "https://github.com/{{org}}/app"
dynamic_volumes:
  repo:
    driver: managed-storage
    uri: "vas://shadowed"
  scratch:
    driver: managed-storage
    uri: "vas://scratch"
"#;

    #[test]
    fn parses_agent_and_volume_definitions() {
        let doc = ComposeDocument::parse(SAMPLE).unwrap();
        let (name, agent) = doc.primary_agent().unwrap();
        assert_eq!(name, "coder");
        assert_eq!(agent.framework, "claude-code");
        assert_eq!(agent.volumes, vec!["repo:/home/user/repo"]);
        assert_eq!(agent.environment["FOO"], "${{ vars.env }}");
    }

    #[test]
    fn static_volume_definitions_take_precedence() {
        let doc = ComposeDocument::parse(SAMPLE).unwrap();
        assert_eq!(doc.volume_definition("repo").unwrap().driver, "git");
        assert_eq!(
            doc.volume_definition("scratch").unwrap().driver,
            "managed-storage"
        );
        assert!(doc.volume_definition("missing").is_none());
    }

    #[test]
    fn rejects_malformed_yaml_as_bad_request() {
        let err = ComposeDocument::parse("agents: [").unwrap_err();
        assert_eq!(err.status_class(), "bad_request");
        let err = ComposeDocument::parse("agents: {}").unwrap_err();
        assert!(err.to_string().contains("at least one agent"));
    }
}
