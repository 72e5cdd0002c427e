//! Placeholder expansion for compose environments (`${{ vars.X }}`,
//! `${{ secrets.X }}`, `${{ credentials.X }}`) and volume templates (`{{X}}`).

use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use super::error::{PipelineError, Result};

static ENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*(vars|secrets|credentials)\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}")
        .expect("environment reference pattern is valid")
});

static TEMPLATE_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}")
        .expect("template variable pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReferenceKind {
    Vars,
    Secrets,
    Credentials,
}

impl ReferenceKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "vars" => Some(ReferenceKind::Vars),
            "secrets" => Some(ReferenceKind::Secrets),
            "credentials" => Some(ReferenceKind::Credentials),
            _ => None,
        }
    }
}

/// Every name a compose environment references, grouped by pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct References {
    pub vars: BTreeSet<String>,
    pub secrets: BTreeSet<String>,
    pub credentials: BTreeSet<String>,
}

impl References {
    pub fn references_secret(&self, name: &str) -> bool {
        self.secrets.contains(name)
    }

    /// Names to look up in the user's stored secret pool.
    pub fn stored_lookup_names(&self) -> Vec<String> {
        self.secrets
            .iter()
            .chain(self.credentials.iter())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

pub fn extract_references(environment: &BTreeMap<String, String>) -> References {
    let mut refs = References::default();
    for value in environment.values() {
        for caps in ENV_REFERENCE.captures_iter(value) {
            let name = caps[2].to_string();
            match ReferenceKind::parse(&caps[1]) {
                Some(ReferenceKind::Vars) => refs.vars.insert(name),
                Some(ReferenceKind::Secrets) => refs.secrets.insert(name),
                Some(ReferenceKind::Credentials) => refs.credentials.insert(name),
                None => false,
            };
        }
    }
    refs
}

/// Value pools consulted while expanding.
#[derive(Debug, Clone, Copy)]
pub struct ExpansionPools<'a> {
    pub vars: &'a BTreeMap<String, String>,
    pub secrets: &'a BTreeMap<String, String>,
    pub credentials: &'a BTreeMap<String, String>,
}

impl<'a> ExpansionPools<'a> {
    fn lookup(&self, kind: ReferenceKind, name: &str) -> Option<&'a String> {
        match kind {
            ReferenceKind::Vars => self.vars.get(name),
            ReferenceKind::Secrets => self.secrets.get(name),
            // Credentials fall back to the secrets pool: a caller-supplied
            // secret satisfies a credential reference of the same name.
            ReferenceKind::Credentials => self
                .credentials
                .get(name)
                .or_else(|| self.secrets.get(name)),
        }
    }
}

/// Substitute every placeholder in `environment`.
///
/// With `strict`, any reference missing from its pool fails the expansion
/// and the error lists every missing name. Without it, unresolved
/// placeholders are left as written.
pub fn expand_environment(
    environment: &BTreeMap<String, String>,
    pools: ExpansionPools<'_>,
    strict: bool,
) -> Result<BTreeMap<String, String>> {
    let mut missing_secrets = BTreeSet::new();
    let mut missing_vars = BTreeSet::new();
    let mut expanded = BTreeMap::new();

    for (key, template) in environment {
        let value = ENV_REFERENCE.replace_all(template, |caps: &Captures<'_>| {
            let name = &caps[2];
            let Some(kind) = ReferenceKind::parse(&caps[1]) else {
                return caps[0].to_string();
            };
            match pools.lookup(kind, name) {
                Some(value) => value.clone(),
                None => {
                    match kind {
                        ReferenceKind::Vars => missing_vars.insert(name.to_string()),
                        _ => missing_secrets.insert(name.to_string()),
                    };
                    caps[0].to_string()
                }
            }
        });
        expanded.insert(key.clone(), value.into_owned());
    }

    if strict && (!missing_secrets.is_empty() || !missing_vars.is_empty()) {
        return Err(PipelineError::MissingReferences {
            secrets: missing_secrets.into_iter().collect(),
            vars: missing_vars.into_iter().collect(),
        });
    }
    if !missing_secrets.is_empty() || !missing_vars.is_empty() {
        tracing::debug!(
            missing_secrets = missing_secrets.len(),
            missing_vars = missing_vars.len(),
            "Leaving unresolved environment placeholders in place"
        );
    }
    Ok(expanded)
}

/// Replace `{{name}}` placeholders from `vars`. On failure returns every
/// unresolved name, sorted and de-duplicated.
pub fn substitute_template_vars(
    template: &str,
    vars: &BTreeMap<String, String>,
) -> std::result::Result<String, Vec<String>> {
    let mut missing = BTreeSet::new();
    let out = TEMPLATE_VAR.replace_all(template, |caps: &Captures<'_>| {
        let name = &caps[1];
        match vars.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.insert(name.to_string());
                caps[0].to_string()
            }
        }
    });
    if missing.is_empty() {
        Ok(out.into_owned())
    } else {
        Err(missing.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn extracts_references_by_pool() {
        let env = map(&[
            ("A", "${{ vars.env }}-${{secrets.TOKEN}}"),
            ("B", "${{ credentials.GH_TOKEN }}"),
            ("C", "literal"),
        ]);
        let refs = extract_references(&env);
        assert!(refs.vars.contains("env"));
        assert!(refs.references_secret("TOKEN"));
        assert!(refs.credentials.contains("GH_TOKEN"));
        assert_eq!(refs.stored_lookup_names(), vec!["GH_TOKEN", "TOKEN"]);
    }

    #[test]
    fn expands_vars_into_environment() {
        let env = map(&[("FOO", "${{ vars.env }}")]);
        let vars = map(&[("env", "prod")]);
        let empty = BTreeMap::new();
        let pools = ExpansionPools {
            vars: &vars,
            secrets: &empty,
            credentials: &empty,
        };
        let out = expand_environment(&env, pools, true).unwrap();
        assert_eq!(out, map(&[("FOO", "prod")]));
    }

    #[test]
    fn strict_mode_reports_every_missing_name() {
        let env = map(&[
            ("A", "${{ secrets.ONE }}"),
            ("B", "${{ secrets.TWO }} ${{ vars.region }}"),
            ("C", "${{ credentials.THREE }}"),
        ]);
        let empty = BTreeMap::new();
        let pools = ExpansionPools {
            vars: &empty,
            secrets: &empty,
            credentials: &empty,
        };
        let err = expand_environment(&env, pools, true).unwrap_err();
        assert_eq!(err.missing_secrets(), ["ONE", "THREE", "TWO"]);
        assert_eq!(err.missing_vars(), ["region"]);
    }

    #[test]
    fn lenient_mode_keeps_unresolved_placeholders() {
        let env = map(&[("A", "x-${{ secrets.ONE }}")]);
        let empty = BTreeMap::new();
        let pools = ExpansionPools {
            vars: &empty,
            secrets: &empty,
            credentials: &empty,
        };
        let out = expand_environment(&env, pools, false).unwrap();
        assert_eq!(out["A"], "x-${{ secrets.ONE }}");
    }

    #[test]
    fn credential_reference_falls_back_to_secret_pool() {
        let env = map(&[("GH", "${{ credentials.GH_TOKEN }}")]);
        let secrets = map(&[("GH_TOKEN", "ghp_1")]);
        let empty = BTreeMap::new();
        let pools = ExpansionPools {
            vars: &empty,
            secrets: &secrets,
            credentials: &empty,
        };
        assert_eq!(expand_environment(&env, pools, true).unwrap()["GH"], "ghp_1");
    }

    #[test]
    fn template_substitution_collects_all_missing_vars() {
        let vars = map(&[("org", "acme")]);
        assert_eq!(
            substitute_template_vars("https://github.com/{{org}}/{{ repo }}", &map(&[
                ("org", "acme"),
                ("repo", "app")
            ]))
            .unwrap(),
            "https://github.com/acme/app"
        );
        let missing = substitute_template_vars("{{org}}/{{repo}}/{{repo}}/{{tag}}", &vars)
            .unwrap_err();
        assert_eq!(missing, vec!["repo", "tag"]);
    }
}
