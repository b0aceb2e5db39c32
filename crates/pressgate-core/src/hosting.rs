//! Static hosting endpoint: the live site pointer.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{PromotionError, RunId};
use crate::store::tree::tree_digest;
use crate::store::{Artifact, ArtifactId};

/// Why the live pointer moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployAction {
    Promote,
    Rollback,
}

/// One repoint of the live endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub artifact_id: ArtifactId,
    pub producing_run: RunId,
    pub content_root: PathBuf,
    pub content_digest: String,
    pub action: DeployAction,
    pub deployed_at: DateTime<Utc>,
}

impl Deployment {
    pub(crate) fn promote(artifact: &Artifact) -> Self {
        Self {
            artifact_id: artifact.id.clone(),
            producing_run: artifact.producing_run.clone(),
            content_root: artifact.content_root.clone(),
            content_digest: artifact.content_digest.clone(),
            action: DeployAction::Promote,
            deployed_at: Utc::now(),
        }
    }
}

/// Static hosting endpoint.
///
/// Guarantees:
/// - `promote` is all-or-nothing: on error the previously live artifact keeps
///   serving.
/// - The pointer moves iff `Ok` is returned. A call that cannot commit
///   within `budget` returns [`PromotionError::Timeout`] without moving it,
///   and no work continues after the call returns.
/// - `history` is append-only.
#[async_trait]
pub trait HostingEndpoint: Send + Sync {
    async fn promote(&self, artifact: &Artifact, budget: Duration) -> Result<Deployment, PromotionError>;

    /// The deployment currently serving, if any.
    async fn current(&self) -> Result<Option<Deployment>, PromotionError>;

    /// All deployments, oldest first.
    async fn history(&self) -> Result<Vec<Deployment>, PromotionError>;

    /// Repoint to the deployment that was live before the current one.
    async fn rollback(&self, budget: Duration) -> Result<Deployment, PromotionError>;
}

/// Replay history into the stack of effective deployments: promotions push,
/// rollbacks pop.
pub(crate) fn effective_stack(history: &[Deployment]) -> Vec<&Deployment> {
    let mut stack: Vec<&Deployment> = Vec::new();
    for d in history {
        match d.action {
            DeployAction::Promote => stack.push(d),
            DeployAction::Rollback => {
                stack.pop();
            }
        }
    }
    stack
}

/// Serves the site from a `live` symlink inside `site_dir`.
///
/// Promotion re-verifies the artifact's content digest, creates the new link
/// under a temporary name and renames it over `live`, so the pointer flips
/// atomically. Every repoint is appended to `deployments.jsonl`.
#[derive(Debug, Clone)]
pub struct DirectoryHost {
    site_dir: PathBuf,
}

impl DirectoryHost {
    pub const LIVE_LINK: &'static str = "live";
    const HISTORY_FILE: &'static str = "deployments.jsonl";

    pub fn new(site_dir: impl AsRef<Path>) -> Result<Self, PromotionError> {
        let site_dir = site_dir.as_ref().to_path_buf();
        fs::create_dir_all(&site_dir)?;
        Ok(Self { site_dir })
    }

    pub fn live_path(&self) -> PathBuf {
        self.site_dir.join(Self::LIVE_LINK)
    }

    fn history_path(&self) -> PathBuf {
        self.site_dir.join(Self::HISTORY_FILE)
    }

    fn read_history(&self) -> Result<Vec<Deployment>, PromotionError> {
        let text = match fs::read_to_string(self.history_path()) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            out.push(serde_json::from_str(line)?);
        }
        Ok(out)
    }

    fn append_history(&self, deployment: &Deployment) -> Result<(), PromotionError> {
        let mut line = serde_json::to_string(deployment)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path())?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn verify(content_root: &Path, expected: &str) -> Result<(), PromotionError> {
        let (actual, _) = tree_digest(content_root)?;
        if actual != expected {
            return Err(PromotionError::IntegrityMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Verify, then atomically repoint `live` and record the deployment.
    /// Past `deadline` nothing is renamed.
    fn repoint(
        &self,
        deployment: Deployment,
        deadline: Instant,
        budget: Duration,
    ) -> Result<Deployment, PromotionError> {
        Self::verify(&deployment.content_root, &deployment.content_digest)?;
        if Instant::now() >= deadline {
            return Err(PromotionError::Timeout {
                budget_ms: budget.as_millis() as u64,
            });
        }

        let staged = self
            .site_dir
            .join(format!(".live-{}", uuid::Uuid::new_v4()));
        symlink_dir(&deployment.content_root, &staged)?;
        if let Err(e) = fs::rename(&staged, self.live_path()) {
            let _ = fs::remove_file(&staged);
            return Err(e.into());
        }

        // The pointer already moved; a missing audit line must not report failure.
        if let Err(e) = self.append_history(&deployment) {
            warn!(artifact_id = %deployment.artifact_id, error = %e, "failed to record deployment history");
        }
        Ok(deployment)
    }
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[async_trait]
impl HostingEndpoint for DirectoryHost {
    async fn promote(&self, artifact: &Artifact, budget: Duration) -> Result<Deployment, PromotionError> {
        let deadline = Instant::now() + budget;
        let host = self.clone();
        let deployment = Deployment::promote(artifact);
        tokio::task::spawn_blocking(move || host.repoint(deployment, deadline, budget))
            .await
            .map_err(|e| PromotionError::Rejected(format!("promotion task failed: {e}")))?
    }

    async fn current(&self) -> Result<Option<Deployment>, PromotionError> {
        let history = self.read_history()?;
        Ok(effective_stack(&history).last().map(|d| (*d).clone()))
    }

    async fn history(&self) -> Result<Vec<Deployment>, PromotionError> {
        self.read_history()
    }

    async fn rollback(&self, budget: Duration) -> Result<Deployment, PromotionError> {
        let deadline = Instant::now() + budget;
        let history = self.read_history()?;
        let stack = effective_stack(&history);
        if stack.len() < 2 {
            return Err(PromotionError::NothingToRollBack);
        }
        let mut target = stack[stack.len() - 2].clone();
        target.action = DeployAction::Rollback;
        target.deployed_at = Utc::now();

        let host = self.clone();
        tokio::task::spawn_blocking(move || host.repoint(target, deadline, budget))
            .await
            .map_err(|e| PromotionError::Rejected(format!("rollback task failed: {e}")))?
    }
}
