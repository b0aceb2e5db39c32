//! Error taxonomy for pipeline runs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::store::{ArtifactId, StoreError};

/// Dependency resolution failures (manifest problems, resolver process failures).
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("failed to read manifest {path}: {source}")]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest {path}: {reason}")]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("no dependency manifests configured")]
    NoManifests,

    #[error("resolver exited with code {exit_code}")]
    Command { exit_code: i32, diagnostics: String },

    #[error("resolver exceeded its {budget_secs}s budget")]
    Timeout { budget_secs: u64 },

    #[error("failed to start resolver: {0}")]
    Spawn(String),
}

impl ResolveError {
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            ResolveError::Command { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

/// Build failures. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("toolchain exited with code {exit_code}")]
    Toolchain { exit_code: i32, diagnostics: String },

    #[error("build exceeded its {budget_ms}ms budget; process {pid:?} was terminated")]
    Timeout {
        budget_ms: u64,
        pid: Option<u32>,
        diagnostics: String,
    },

    #[error("failed to start toolchain: {0}")]
    Spawn(String),

    #[error("build produced no usable output: {0}")]
    InvalidOutput(String),
}

impl BuildError {
    /// Toolchain output captured for this failure, verbatim.
    pub fn diagnostics(&self) -> &str {
        match self {
            BuildError::Toolchain { diagnostics, .. } | BuildError::Timeout { diagnostics, .. } => {
                diagnostics
            }
            BuildError::Spawn(msg) | BuildError::InvalidOutput(msg) => msg,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BuildError::Timeout { .. })
    }
}

/// Artifact store failures.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("artifact already exists: {0}")]
    AlreadyExists(ArtifactId),

    #[error("artifact store unavailable: {0}")]
    Unavailable(String),

    #[error("upload exceeded its {budget_secs}s budget")]
    Timeout { budget_secs: u64 },
}

impl PublishError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Unavailable(_) | PublishError::Timeout { .. })
    }
}

impl From<StoreError> for PublishError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists(id) => PublishError::AlreadyExists(ArtifactId(id)),
            other => PublishError::Unavailable(other.to_string()),
        }
    }
}

/// The hosting endpoint refused or failed a promotion. The previous artifact stays live.
#[derive(Debug, thiserror::Error)]
pub enum PromotionError {
    #[error("hosting endpoint rejected promotion: {0}")]
    Rejected(String),

    #[error("artifact content digest mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("promotion exceeded its {budget_ms}ms budget")]
    Timeout { budget_ms: u64 },

    #[error("no earlier deployment to roll back to")]
    NothingToRollBack,

    #[error("deployment already in flight")]
    Busy,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification reported on a failed run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DependencyResolution,
    Build,
    Timeout,
    Publish,
    Promotion,
}

/// Run-level failure. Every variant is fatal for the run that produced it.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("dependency resolution failed: {0}")]
    DependencyResolution(#[from] ResolveError),

    #[error("build failed: {0}")]
    Build(#[from] BuildError),

    #[error("artifact publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("promotion failed: {0}")]
    Promotion(#[from] PromotionError),
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::DependencyResolution(_) => FailureKind::DependencyResolution,
            PipelineError::Build(e) if e.is_timeout() => FailureKind::Timeout,
            PipelineError::Build(_) => FailureKind::Build,
            PipelineError::Publish(_) => FailureKind::Publish,
            PipelineError::Promotion(_) => FailureKind::Promotion,
        }
    }

    /// Full diagnostic text for the triggering caller: the error chain plus any
    /// captured tool output.
    pub fn diagnostics(&self) -> String {
        let captured = match self {
            PipelineError::Build(e) => Some(e.diagnostics()),
            PipelineError::DependencyResolution(e) => e.diagnostics(),
            _ => None,
        };
        match captured {
            Some(output) if !output.is_empty() => format!("{self}\n\n{output}"),
            _ => self.to_string(),
        }
    }
}
