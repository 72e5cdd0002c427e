use serde::Serialize;

/// Why a single volume declaration could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeErrorKind {
    MissingDefinition,
    MissingVariable,
    InvalidUri,
    InvalidDeclaration,
    MissingSnapshotBranch,
}

impl VolumeErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VolumeErrorKind::MissingDefinition => "missing_definition",
            VolumeErrorKind::MissingVariable => "missing_variable",
            VolumeErrorKind::InvalidUri => "invalid_uri",
            VolumeErrorKind::InvalidDeclaration => "invalid_declaration",
            VolumeErrorKind::MissingSnapshotBranch => "missing_snapshot_branch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeError {
    pub volume: String,
    pub kind: VolumeErrorKind,
    pub message: String,
    /// Populated for `missing_variable`; every unresolved placeholder.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_vars: Vec<String>,
}

impl VolumeError {
    pub fn new(volume: impl Into<String>, kind: VolumeErrorKind, message: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            kind,
            message: message.into(),
            missing_vars: Vec::new(),
        }
    }

    pub fn missing_variables(volume: impl Into<String>, vars: Vec<String>) -> Self {
        let volume = volume.into();
        let message = format!(
            "Volume '{}' references undefined variables: {}",
            volume,
            vars.join(", ")
        );
        Self {
            volume,
            kind: VolumeErrorKind::MissingVariable,
            message,
            missing_vars: vars,
        }
    }
}

impl std::fmt::Display for VolumeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)
    }
}

fn join_volume_errors(errors: &[VolumeError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn describe_missing(secrets: &[String], vars: &[String]) -> String {
    let mut parts = Vec::new();
    if !secrets.is_empty() {
        parts.push(format!("Missing required secrets: {}", secrets.join(", ")));
    }
    if !vars.is_empty() {
        parts.push(format!("Missing required vars: {}", vars.join(", ")));
    }
    parts.join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// Every unresolved `${{ secrets.* }}` / `${{ credentials.* }}` and
    /// `${{ vars.* }}` reference, collected in a single pass.
    #[error("{}", describe_missing(.secrets, .vars))]
    MissingReferences {
        secrets: Vec<String>,
        vars: Vec<String>,
    },
    #[error("volume resolution failed: {}", join_volume_errors(.0))]
    VolumeResolution(Vec<VolumeError>),
    #[error("checkpoint creation failed for run {run_id}: {reason}")]
    CheckpointFailed { run_id: String, reason: String },
    #[error("storage version {version_id} exists but its content is missing ({} blobs)", .missing.len())]
    StorageConflict {
        version_id: String,
        missing: Vec<String>,
    },
    #[error("storage version {version_id} not visible after insert; concurrent commit in flight")]
    ConcurrencyFailure { version_id: String },
    #[error("files not uploaded: {}", .0.join(", "))]
    NotUploaded(Vec<String>),
    #[error("version id mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("secret store error: {0}")]
    Secret(String),
    #[error("token refresh failed: {0}")]
    Refresh(String),
}

impl PipelineError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        PipelineError::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        PipelineError::NotFound(msg.into())
    }

    /// Coarse class for an outer API layer.
    pub fn status_class(&self) -> &'static str {
        match self {
            PipelineError::BadRequest(_)
            | PipelineError::MissingReferences { .. }
            | PipelineError::VolumeResolution(_)
            | PipelineError::NotUploaded(_)
            | PipelineError::VersionMismatch { .. } => "bad_request",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Conflict(_) | PipelineError::StorageConflict { .. } => "conflict",
            PipelineError::CheckpointFailed { .. }
            | PipelineError::ConcurrencyFailure { .. }
            | PipelineError::Persistence(_)
            | PipelineError::Secret(_)
            | PipelineError::Refresh(_) => "server_error",
        }
    }

    pub fn missing_secrets(&self) -> &[String] {
        match self {
            PipelineError::MissingReferences { secrets, .. } => secrets,
            _ => &[],
        }
    }

    pub fn missing_vars(&self) -> &[String] {
        match self {
            PipelineError::MissingReferences { vars, .. } => vars,
            _ => &[],
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Persistence(format!("json: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
