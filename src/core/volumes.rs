//! Volume resolution: `name:/mount/path` declarations plus driver definitions
//! and template variables become concrete mount descriptors.
//!
//! Resolution is pure and accumulates errors per declaration, so one bad
//! volume never hides problems with the others.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::debug;

use super::compose::VolumeDefinition;
use super::error::{VolumeError, VolumeErrorKind};
use super::model::{ResolvedVolume, VolumeVersionsSnapshot};
use super::template::substitute_template_vars;

pub const GIT_DRIVER: &str = "git";
pub const MANAGED_STORAGE_DRIVER: &str = "managed-storage";
pub const DEFAULT_GIT_BRANCH: &str = "main";

static STORAGE_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9+.\-]*://([A-Za-z0-9][A-Za-z0-9._\-]*)$")
        .expect("storage uri pattern is valid")
});

#[derive(Debug, Clone, Default)]
pub struct VolumeResolution {
    pub volumes: Vec<ResolvedVolume>,
    pub errors: Vec<VolumeError>,
}

impl VolumeResolution {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Version pins applied on top of the declared definitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeOverrides<'a> {
    /// Checkpoint snapshot when resuming; git branches are taken from here.
    pub snapshot: Option<&'a VolumeVersionsSnapshot>,
    /// Caller-supplied `volumeVersions`; wins over the snapshot.
    pub versions: Option<&'a BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Copy)]
pub struct VolumeDefinitions<'a> {
    pub volumes: &'a BTreeMap<String, VolumeDefinition>,
    pub dynamic_volumes: &'a BTreeMap<String, VolumeDefinition>,
}

impl<'a> VolumeDefinitions<'a> {
    fn lookup(&self, name: &str) -> Option<&'a VolumeDefinition> {
        self.volumes
            .get(name)
            .or_else(|| self.dynamic_volumes.get(name))
    }
}

/// Split `name:/mount/path`. Exactly one colon, both sides non-empty.
pub fn parse_declaration(declaration: &str) -> Result<(&str, &str), VolumeError> {
    let invalid = || {
        VolumeError::new(
            declaration,
            VolumeErrorKind::InvalidDeclaration,
            format!(
                "Invalid volume declaration '{}'; expected 'name:/mount/path'",
                declaration
            ),
        )
    };
    if declaration.matches(':').count() != 1 {
        return Err(invalid());
    }
    let (name, mount_path) = declaration.split_once(':').ok_or_else(invalid)?;
    let (name, mount_path) = (name.trim(), mount_path.trim());
    if name.is_empty() || mount_path.is_empty() {
        return Err(invalid());
    }
    Ok((name, mount_path))
}

/// Canonical HTTPS form of a git remote: lowercase host, no credentials,
/// query or fragment, no trailing slash, always ending in `.git`.
pub fn normalize_git_url(raw: &str) -> Result<String, String> {
    let parsed = url::Url::parse(raw.trim()).map_err(|e| format!("'{}' is not a URL: {}", raw, e))?;
    if parsed.scheme() != "https" {
        return Err(format!(
            "Git URL '{}' must use https (got '{}')",
            raw,
            parsed.scheme()
        ));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(format!(
            "Git URL '{}' must not embed credentials; use the volume token",
            raw
        ));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| format!("Git URL '{}' has no host", raw))?;
    let path = parsed.path().trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path).trim_end_matches('/');
    if path.is_empty() {
        return Err(format!("Git URL '{}' has no repository path", raw));
    }
    let port = parsed.port().map(|p| format!(":{}", p)).unwrap_or_default();
    Ok(format!("https://{}{}/{}.git", host, port, path))
}

pub fn resolve_volumes(
    declarations: &[String],
    definitions: VolumeDefinitions<'_>,
    vars: &BTreeMap<String, String>,
    overrides: VolumeOverrides<'_>,
) -> VolumeResolution {
    let mut resolution = VolumeResolution::default();

    for declaration in declarations {
        let (name, mount_path) = match parse_declaration(declaration) {
            Ok(parsed) => parsed,
            Err(err) => {
                resolution.errors.push(err);
                continue;
            }
        };

        let Some(definition) = definitions.lookup(name) else {
            resolution.errors.push(VolumeError::new(
                name,
                VolumeErrorKind::MissingDefinition,
                format!(
                    "Volume '{}' is declared but has no definition in volumes or dynamic_volumes",
                    name
                ),
            ));
            continue;
        };

        let resolved = match definition.driver.as_str() {
            GIT_DRIVER => resolve_git(name, mount_path, definition, vars, overrides),
            MANAGED_STORAGE_DRIVER => {
                resolve_managed_storage(name, mount_path, definition, vars, overrides)
            }
            other => Err(VolumeError::new(
                name,
                VolumeErrorKind::InvalidUri,
                format!("Volume '{}' uses unsupported driver '{}'", name, other),
            )),
        };

        match resolved {
            Ok(volume) => {
                debug!(volume = name, mount_path, "Resolved volume");
                resolution.volumes.push(volume);
            }
            Err(err) => resolution.errors.push(err),
        }
    }

    resolution
}

fn resolve_git(
    name: &str,
    mount_path: &str,
    definition: &VolumeDefinition,
    vars: &BTreeMap<String, String>,
    overrides: VolumeOverrides<'_>,
) -> Result<ResolvedVolume, VolumeError> {
    let mut missing = Vec::new();
    let mut substitute = |template: &str| match substitute_template_vars(template, vars) {
        Ok(value) => Some(value),
        Err(names) => {
            missing.extend(names);
            None
        }
    };

    let uri = substitute(&definition.uri);
    let branch = substitute(definition.branch.as_deref().unwrap_or(DEFAULT_GIT_BRANCH));
    let token = definition.token.as_deref().map(&mut substitute);

    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(VolumeError::missing_variables(name, missing));
    }
    let (Some(uri), Some(mut branch)) = (uri, branch) else {
        return Err(VolumeError::missing_variables(name, missing));
    };
    let token = token.flatten().filter(|t| !t.is_empty());

    let uri = normalize_git_url(&uri)
        .map_err(|reason| VolumeError::new(name, VolumeErrorKind::InvalidUri, reason))?;

    if let Some(entry) = overrides.snapshot.and_then(|snapshot| snapshot.get(name)) {
        match entry.branch.as_deref().filter(|b| !b.is_empty()) {
            Some(snapshot_branch) => branch = snapshot_branch.to_string(),
            None => {
                return Err(VolumeError::new(
                    name,
                    VolumeErrorKind::MissingSnapshotBranch,
                    format!("Git snapshot missing branch name for volume '{}'", name),
                ));
            }
        }
    }

    Ok(ResolvedVolume::Git {
        name: name.to_string(),
        mount_path: mount_path.to_string(),
        uri,
        branch,
        token,
    })
}

fn resolve_managed_storage(
    name: &str,
    mount_path: &str,
    definition: &VolumeDefinition,
    vars: &BTreeMap<String, String>,
    overrides: VolumeOverrides<'_>,
) -> Result<ResolvedVolume, VolumeError> {
    let uri = substitute_template_vars(&definition.uri, vars)
        .map_err(|missing| VolumeError::missing_variables(name, missing))?;

    let storage_name = STORAGE_URI
        .captures(&uri)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| {
            VolumeError::new(
                name,
                VolumeErrorKind::InvalidUri,
                format!(
                    "Volume '{}' has invalid storage URI '{}'; expected 'scheme://storage-name'",
                    name, uri
                ),
            )
        })?;

    let version = overrides
        .versions
        .and_then(|versions| versions.get(name).cloned())
        .or_else(|| {
            overrides
                .snapshot
                .and_then(|snapshot| snapshot.get(name))
                .and_then(|entry| entry.version_id.clone())
        });

    Ok(ResolvedVolume::ManagedStorage {
        name: name.to_string(),
        mount_path: mount_path.to_string(),
        storage_name,
        version,
    })
}
