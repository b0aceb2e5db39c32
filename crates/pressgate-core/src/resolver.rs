//! Dependency resolution: turns a manifest into the opaque payload the
//! builder consumes and the cache stores.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::ResolveError;
use crate::exec::{command_from_argv, run_with_budget, ExecError};
use crate::fingerprint::{DependencyManifest, Fingerprint};

/// Resolved dependency state handed to the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependencies {
    pub fingerprint: Fingerprint,
    pub payload: Vec<u8>,
    /// Restored from the cache rather than freshly resolved.
    pub restored: bool,
}

#[async_trait]
pub trait DependencyResolver: Send + Sync {
    /// Resolve `manifest` into an opaque payload.
    async fn resolve(&self, manifest: &DependencyManifest) -> Result<Vec<u8>, ResolveError>;
}

/// Resolves pins straight from the manifests' `[dependencies]` tables.
///
/// The payload is canonical JSON (`BTreeMap` order) so it is stable for
/// identical manifests.
#[derive(Debug, Default, Clone)]
pub struct ManifestResolver;

#[async_trait]
impl DependencyResolver for ManifestResolver {
    async fn resolve(&self, manifest: &DependencyManifest) -> Result<Vec<u8>, ResolveError> {
        let pins = manifest.pins()?;
        serde_json::to_vec(&pins).map_err(|e| ResolveError::InvalidManifest {
            path: Default::default(),
            reason: e.to_string(),
        })
    }
}

/// Runs an external resolver command; its stdout is the payload.
///
/// Manifest paths are passed in `PRESSGATE_MANIFESTS`, separated by the
/// platform path-list separator.
#[derive(Debug, Clone)]
pub struct CommandResolver {
    command: Vec<String>,
    budget: Duration,
}

impl CommandResolver {
    pub fn new(command: Vec<String>, budget: Duration) -> Self {
        Self { command, budget }
    }
}

#[async_trait]
impl DependencyResolver for CommandResolver {
    async fn resolve(&self, manifest: &DependencyManifest) -> Result<Vec<u8>, ResolveError> {
        let mut cmd = command_from_argv(&self.command).map_err(|e| ResolveError::Spawn(e.to_string()))?;
        let joined = std::env::join_paths(manifest.paths())
            .map_err(|e| ResolveError::Spawn(e.to_string()))?;
        cmd.env("PRESSGATE_MANIFESTS", joined);
        if let Some(dir) = manifest.paths().first().and_then(|p| p.parent()) {
            if !dir.as_os_str().is_empty() {
                cmd.current_dir(dir);
            }
        }

        match run_with_budget(cmd, Some(self.budget)).await {
            Ok(out) if out.success => Ok(out.stdout),
            Ok(out) => Err(ResolveError::Command {
                exit_code: out.exit_code,
                diagnostics: out.combined_output(),
            }),
            Err(ExecError::TimedOut { .. }) => Err(ResolveError::Timeout {
                budget_secs: self.budget.as_secs(),
            }),
            Err(e) => Err(ResolveError::Spawn(e.to_string())),
        }
    }
}
