use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const PROVIDERS_JSON: &str = include_str!("providers.json");

/// Known agent frameworks, model providers and third-party connectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCatalog {
    pub frameworks: Vec<FrameworkDef>,
    /// Env vars that mean "the compose already configures a model provider".
    pub provider_env_vars: Vec<String>,
    pub providers: Vec<ProviderDef>,
    pub connectors: Vec<ConnectorDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkDef {
    pub id: String,
    pub auto_inject: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDef {
    pub id: String,
    pub name: String,
    pub framework: String,
    /// Credential names one auth method needs. More than one makes this a
    /// multi-auth provider: all must be present or nothing is injected.
    pub credentials: Vec<String>,
    /// Env var -> value. `$NAME` refers to a credential, anything else is
    /// a literal.
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorDef {
    pub id: String,
    /// Secret name -> connector credential field it is filled from.
    pub secrets: BTreeMap<String, String>,
    /// Present for connectors whose tokens rotate.
    #[serde(default)]
    pub token_url: Option<String>,
}

impl ProviderDef {
    pub fn is_multi_auth(&self) -> bool {
        self.credentials.len() > 1
    }

    /// Render env injections from credential values. Returns the credential
    /// names that were missing instead when the set is incomplete.
    pub fn render_environment(
        &self,
        values: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, Vec<String>> {
        let missing: Vec<String> = self
            .credentials
            .iter()
            .filter(|name| values.get(*name).is_none_or(|v| v.is_empty()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(missing);
        }
        let mut env = BTreeMap::new();
        for (key, template) in &self.environment {
            let value = match template.strip_prefix('$') {
                Some(name) => values.get(name).cloned().unwrap_or_default(),
                None => template.clone(),
            };
            env.insert(key.clone(), value);
        }
        Ok(env)
    }
}

impl ConnectorDef {
    pub fn rotates(&self) -> bool {
        self.token_url.is_some()
    }
}

impl ProviderCatalog {
    pub fn load() -> Result<Self, serde_json::Error> {
        serde_json::from_str(PROVIDERS_JSON)
    }

    pub fn get_provider(&self, id: &str) -> Option<&ProviderDef> {
        let normalized = id.trim().to_lowercase();
        self.providers.iter().find(|p| p.id == normalized)
    }

    pub fn get_connector(&self, id: &str) -> Option<&ConnectorDef> {
        let normalized = id.trim().to_lowercase();
        self.connectors.iter().find(|c| c.id == normalized)
    }

    pub fn supports_auto_injection(&self, framework: &str) -> bool {
        self.frameworks
            .iter()
            .any(|f| f.id == framework && f.auto_inject)
    }

    pub fn sets_provider_env(&self, environment: &BTreeMap<String, String>) -> bool {
        self.provider_env_vars
            .iter()
            .any(|var| environment.contains_key(var))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_parses() {
        let catalog = ProviderCatalog::load().unwrap();
        assert!(catalog.get_provider("Anthropic-API-Key").is_some());
        assert!(catalog.get_provider("aws-bedrock").unwrap().is_multi_auth());
        assert!(catalog.supports_auto_injection("claude-code"));
        assert!(!catalog.supports_auto_injection("custom"));
        assert!(catalog.get_connector("github").unwrap().rotates());
        assert!(!catalog.get_connector("linear").unwrap().rotates());
    }

    #[test]
    fn render_environment_requires_every_credential() {
        let catalog = ProviderCatalog::load().unwrap();
        let bedrock = catalog.get_provider("aws-bedrock").unwrap();
        let partial = BTreeMap::from([
            ("AWS_ACCESS_KEY_ID".to_string(), "AKIA".to_string()),
            ("AWS_REGION".to_string(), "us-east-1".to_string()),
        ]);
        assert_eq!(
            bedrock.render_environment(&partial).unwrap_err(),
            vec!["AWS_SECRET_ACCESS_KEY"]
        );

        let mut full = partial.clone();
        full.insert("AWS_SECRET_ACCESS_KEY".into(), "s".into());
        let env = bedrock.render_environment(&full).unwrap();
        assert_eq!(env["CLAUDE_CODE_USE_BEDROCK"], "1");
        assert_eq!(env["AWS_SECRET_ACCESS_KEY"], "s");
    }

    #[test]
    fn detects_compose_provider_configuration() {
        let catalog = ProviderCatalog::load().unwrap();
        let env = BTreeMap::from([("ANTHROPIC_API_KEY".to_string(), "x".to_string())]);
        assert!(catalog.sets_provider_env(&env));
        assert!(!catalog.sets_provider_env(&BTreeMap::new()));
    }
}
