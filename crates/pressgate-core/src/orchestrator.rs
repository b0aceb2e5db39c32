//! Pipeline orchestration: drives one trigger event to a terminal state.
//!
//! `handle` walks the steps fingerprint, cache lookup, resolve, build, publish
//! and (for pushes to the main branch only) deploy through the shared
//! [`DeployGate`]. It never returns an error; every failure is folded into the
//! returned [`RunOutcome`] together with its diagnostics.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{warn, Instrument};

use crate::builder::{BuildCommand, BuildOutcome, BuildResult, Builder, CommandBuilder};
use crate::config::{ConfigError, PipelineConfig};
use crate::domain::run::Run;
use crate::domain::{
    PipelineError, PromotionError, PublishError, ResolveError, RunId, RunOutcome, TerminalState,
    TriggerEvent, TriggerKind,
};
use crate::fingerprint::{DependencyManifest, Fingerprint};
use crate::gate::{DeployGate, DeployRequest, DeployToken};
use crate::hosting::{Deployment, DirectoryHost, HostingEndpoint};
use crate::obs;
use crate::resolver::{CommandResolver, DependencyResolver, ManifestResolver, ResolvedDependencies};
use crate::store::{
    Artifact, ArtifactId, ArtifactStore, CacheStore, FsArtifactStore, FsCacheStore, StoreError,
};

/// The external systems a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub cache: Arc<dyn CacheStore>,
    pub resolver: Arc<dyn DependencyResolver>,
    pub builder: Arc<dyn Builder>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub host: Arc<dyn HostingEndpoint>,
}

/// Per-orchestrator knobs.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub corpus_root: PathBuf,
    pub manifests: Vec<PathBuf>,
    /// Total attempts per resolution step, manifest read or resolver (first
    /// try plus retries).
    pub resolve_attempts: u32,
    pub publish_attempts: u32,
    pub publish_backoff: Duration,
    pub publish_timeout: Duration,
    pub deploy_timeout: Duration,
    pub honor_pending: bool,
}

impl PipelineSettings {
    pub fn new(corpus_root: impl Into<PathBuf>, manifests: Vec<PathBuf>) -> Self {
        Self {
            corpus_root: corpus_root.into(),
            manifests,
            resolve_attempts: 2,
            publish_attempts: 3,
            publish_backoff: Duration::from_millis(500),
            publish_timeout: Duration::from_secs(300),
            deploy_timeout: Duration::from_secs(120),
            honor_pending: false,
        }
    }

    fn from_config(config: &PipelineConfig) -> Self {
        Self {
            corpus_root: config.pipeline.corpus.clone(),
            manifests: config.pipeline.manifests.clone(),
            resolve_attempts: 2,
            publish_attempts: config.publish.max_attempts,
            publish_backoff: Duration::from_millis(config.publish.initial_backoff_ms),
            publish_timeout: Duration::from_secs(config.publish.timeout_secs),
            deploy_timeout: Duration::from_secs(config.deploy.timeout_secs),
            honor_pending: config.deploy.honor_pending,
        }
    }
}

/// Newest push seen on a branch.
#[derive(Debug, Clone)]
struct BranchHead {
    seq: u64,
    commit: String,
}

pub struct Orchestrator {
    collaborators: Collaborators,
    settings: PipelineSettings,
    gate: Arc<DeployGate>,
    heads: Mutex<HashMap<String, BranchHead>>,
    seq: AtomicU64,
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators, settings: PipelineSettings, gate: Arc<DeployGate>) -> Self {
        Self {
            collaborators,
            settings,
            gate,
            heads: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Wire the filesystem-backed collaborators described by `config`.
    pub fn from_config(config: &PipelineConfig, gate: Arc<DeployGate>) -> Result<Self, ConfigError> {
        let open = |what: &'static str| move |e: StoreError| ConfigError::Open { what, reason: e.to_string() };

        let cache = FsCacheStore::new(config.cache_dir()).map_err(open("cache store"))?;
        let artifacts = FsArtifactStore::new(config.artifacts_dir()).map_err(open("artifact store"))?;
        let host = DirectoryHost::new(&config.deploy.site_dir).map_err(|e| ConfigError::Open {
            what: "hosting endpoint",
            reason: e.to_string(),
        })?;
        let resolver: Arc<dyn DependencyResolver> = match &config.resolve.command {
            Some(command) => Arc::new(CommandResolver::new(
                command.clone(),
                Duration::from_secs(config.resolve.timeout_secs),
            )),
            None => Arc::new(ManifestResolver),
        };
        let builder = CommandBuilder::new(
            BuildCommand::new(config.build.command.clone()),
            config.scratch_dir(),
            config.build_budget(),
        );

        let collaborators = Collaborators {
            cache: Arc::new(cache),
            resolver,
            builder: Arc::new(builder),
            artifacts: Arc::new(artifacts),
            host: Arc::new(host),
        };
        Ok(Self::new(collaborators, PipelineSettings::from_config(config), gate))
    }

    pub fn gate(&self) -> &Arc<DeployGate> {
        &self.gate
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Current dependency fingerprint of the configured manifests.
    pub fn fingerprint(&self) -> Result<Fingerprint, ResolveError> {
        Ok(DependencyManifest::load(&self.settings.manifests)?.fingerprint())
    }

    /// Drive one trigger event to its terminal state.
    pub async fn handle(&self, event: TriggerEvent) -> RunOutcome {
        let run = Run::start(event);
        let span = obs::run_span(run.id.as_str());
        self.handle_run(run).instrument(span).await
    }

    async fn handle_run(&self, mut run: Run) -> RunOutcome {
        obs::emit_run_started(run.id.as_str(), &run.event);
        let seq = self.observe_trigger(&run.event);

        let outcome = match self.drive(&mut run, seq).await {
            Ok(terminal) => run.finish(terminal),
            Err(e) => {
                run.log(format!("run failed: {e}"));
                run.fail(&e)
            }
        };
        obs::emit_run_finished(&outcome);
        outcome
    }

    async fn drive(&self, run: &mut Run, seq: u64) -> Result<TerminalState, PipelineError> {
        let manifests = &self.settings.manifests;
        let manifest = self
            .retry_resolution(run, "manifest read", || {
                std::future::ready(DependencyManifest::load(manifests))
            })
            .await?;
        let fingerprint = manifest.fingerprint();
        run.log(format!("dependency fingerprint {}", fingerprint.short()));
        run.fingerprint = Some(fingerprint.clone());

        let deps = self.resolve_dependencies(run, &manifest, fingerprint).await?;

        let result = self
            .collaborators
            .builder
            .build(&self.settings.corpus_root, &deps)
            .await;
        obs::emit_build_finished(run.id.as_str(), result.output_root().is_some(), result.duration_ms);
        let result = match result.outcome {
            BuildOutcome::Failure(e) => {
                run.log(format!("build failed after {}ms", result.duration_ms));
                return Err(e.into());
            }
            BuildOutcome::Success { output_root } => {
                run.log(format!("build succeeded in {}ms", result.duration_ms));
                BuildResult::success(output_root, result.logs, result.duration_ms)
            }
        };

        let published = self.publish_with_retry(run, &result).await;
        self.collaborators.builder.discard(&result).await;
        let artifact = published?;
        obs::emit_artifact_published(run.id.as_str(), &artifact.id, artifact.file_count);
        run.log(format!("published artifact {}", artifact.id));
        run.artifact_id = Some(artifact.id.clone());

        if !run.event.warrants_deploy() {
            run.log(format!("{} event: check only, no deployment", run.event.kind));
            return Ok(TerminalState::CheckPassed);
        }

        if let Some(newest) = self.newer_push(&run.event, seq) {
            run.stale = true;
            run.log(format!("stale: {} has newer commit {}", run.event.branch, newest));
            obs::emit_run_stale(run.id.as_str(), &run.event.branch, &newest);
        }

        self.deploy(run, &artifact).await
    }

    // -----------------------------------------------------------------------
    // Dependencies
    // -----------------------------------------------------------------------

    async fn resolve_dependencies(
        &self,
        run: &mut Run,
        manifest: &DependencyManifest,
        fingerprint: Fingerprint,
    ) -> Result<ResolvedDependencies, ResolveError> {
        let cache = &self.collaborators.cache;
        let run_id = run.id.clone();

        match cache.lookup(&fingerprint).await {
            Ok(Some(entry)) => {
                obs::emit_cache_hit(run_id.as_str(), &fingerprint);
                run.log("dependency cache hit");
                run.cache_hit = true;
                return Ok(ResolvedDependencies {
                    fingerprint,
                    payload: entry.payload,
                    restored: true,
                });
            }
            Ok(None) => {}
            Err(e @ StoreError::Corrupted { .. }) => {
                obs::emit_cache_corrupted(run_id.as_str(), &fingerprint, &e);
                run.log(format!("cache entry corrupted, resolving fresh: {e}"));
                self.invalidate(run_id.as_str(), &fingerprint).await;
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "cache lookup failed; treating as miss");
                run.log(format!("cache lookup failed, treating as miss: {e}"));
            }
        }
        obs::emit_cache_miss(run_id.as_str(), &fingerprint);
        run.cache_hit = false;

        let resolver = &self.collaborators.resolver;
        let payload = self
            .retry_resolution(run, "dependency resolution", || resolver.resolve(manifest))
            .await?;

        match cache.store(&fingerprint, &payload).await {
            Ok(()) => run.log("stored resolved dependencies in cache"),
            Err(e @ StoreError::Conflict(_)) => {
                obs::emit_cache_corrupted(run_id.as_str(), &fingerprint, &e);
                run.log(format!("conflicting cache entry replaced: {e}"));
                self.invalidate(run_id.as_str(), &fingerprint).await;
                if let Err(e) = cache.store(&fingerprint, &payload).await {
                    obs::emit_cache_store_failed(run_id.as_str(), &fingerprint, &e);
                }
            }
            Err(e) => {
                obs::emit_cache_store_failed(run_id.as_str(), &fingerprint, &e);
                run.log(format!("cache store failed, continuing: {e}"));
            }
        }

        Ok(ResolvedDependencies {
            fingerprint,
            payload,
            restored: false,
        })
    }

    async fn invalidate(&self, run_id: &str, fingerprint: &Fingerprint) {
        if let Err(e) = self.collaborators.cache.invalidate(fingerprint).await {
            warn!(run_id = %run_id, error = %e, "failed to invalidate cache entry");
        }
    }

    /// Run a resolution step, retrying any failure up to `resolve_attempts`.
    async fn retry_resolution<T, F, Fut>(&self, run: &mut Run, step: &str, mut op: F) -> Result<T, ResolveError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResolveError>>,
    {
        let attempts = self.settings.resolve_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    warn!(run_id = %run.id, attempt, step, error = %e, "resolution step failed; retrying");
                    run.log(format!("{step} attempt {attempt} failed: {e}"));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Publish
    // -----------------------------------------------------------------------

    async fn publish_with_retry(&self, run: &mut Run, result: &BuildResult) -> Result<Artifact, PublishError> {
        let artifacts = &self.collaborators.artifacts;
        let max_attempts = self.settings.publish_attempts.max(1);
        let mut backoff = self.settings.publish_backoff;
        let mut attempt = 1;
        loop {
            let published = match tokio::time::timeout(
                self.settings.publish_timeout,
                artifacts.publish(&run.id, result),
            )
            .await
            {
                Ok(published) => published,
                Err(_) => Err(PublishError::Timeout {
                    budget_secs: self.settings.publish_timeout.as_secs(),
                }),
            };
            match published {
                Ok(artifact) => return Ok(artifact),
                // An earlier attempt landed but its response was lost.
                Err(PublishError::AlreadyExists(id)) if attempt > 1 => {
                    run.log(format!("artifact {id} already stored by an earlier attempt"));
                    return artifacts.retrieve(&id).await.map_err(PublishError::from);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(run_id = %run.id, attempt, error = %e, "artifact publish failed; retrying");
                    run.log(format!("publish attempt {attempt} failed: {e}"));
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Deploy
    // -----------------------------------------------------------------------

    async fn deploy(&self, run: &mut Run, artifact: &Artifact) -> Result<TerminalState, PipelineError> {
        let request = DeployRequest::new(run.id.clone(), run.event.commit.clone(), artifact.id.clone());
        let token = match self.gate.try_acquire(request) {
            Ok(token) => token,
            Err(busy) => {
                let holder = busy.holder.as_ref().map(RunId::as_str);
                obs::emit_deploy_skipped_superseded(run.id.as_str(), holder);
                run.log(format!("deployment in flight ({busy}); skipped"));
                return Ok(TerminalState::SkippedSuperseded);
            }
        };

        token.begin_deploying();
        // The host settles before returning, so the slot covers all of its work.
        let promoted = self.promote(artifact).await;
        match &promoted {
            Ok(_) => {
                obs::emit_deploy_promoted(run.id.as_str(), &artifact.id);
                run.log(format!("promoted {} to live", artifact.id));
            }
            Err(e) => {
                token.mark_failed();
                obs::emit_deploy_failed(run.id.as_str(), &artifact.id, e);
                run.log(format!("promotion of {} failed: {e}", artifact.id));
            }
        }

        if self.settings.honor_pending {
            self.drain_pending(run, token).await;
        } else {
            drop(token);
        }
        promoted?;
        Ok(TerminalState::Deployed)
    }

    async fn promote(&self, artifact: &Artifact) -> Result<Deployment, PromotionError> {
        self.collaborators
            .host
            .promote(artifact, self.settings.deploy_timeout)
            .await
    }

    /// Promote the newest request that found the gate busy, keeping the slot
    /// until none is left. Failures here do not change the current run's
    /// outcome.
    async fn drain_pending(&self, run: &mut Run, mut token: DeployToken) {
        while let Some((next, pending)) = token.hand_off() {
            token = next;
            let artifact = match self.collaborators.artifacts.retrieve(&pending.artifact_id).await {
                Ok(artifact) => artifact,
                Err(e) => {
                    warn!(run_id = %run.id, artifact_id = %pending.artifact_id, error = %e, "pending artifact unavailable");
                    token.mark_failed();
                    continue;
                }
            };
            match self.promote(&artifact).await {
                Ok(_) => {
                    obs::emit_deploy_promoted(pending.run_id.as_str(), &artifact.id);
                    run.log(format!("promoted pending {} from run {}", artifact.id, pending.run_id));
                }
                Err(e) => {
                    token.mark_failed();
                    obs::emit_deploy_failed(pending.run_id.as_str(), &artifact.id, &e);
                    run.log(format!("pending {} not promoted: {e}", artifact.id));
                }
            }
        }
    }

    /// Repoint the live site to the previous deployment.
    pub async fn rollback(&self) -> Result<Deployment, PromotionError> {
        let run_id = RunId::new();
        let request = DeployRequest::new(run_id.clone(), "rollback", ArtifactId::for_run(&run_id));
        let token = self
            .gate
            .try_acquire_untracked(request)
            .map_err(|_| PromotionError::Busy)?;
        token.begin_deploying();

        let result = self
            .collaborators
            .host
            .rollback(self.settings.deploy_timeout)
            .await;
        if result.is_err() {
            token.mark_failed();
        }
        result
    }

    // -----------------------------------------------------------------------
    // Staleness
    // -----------------------------------------------------------------------

    /// Record a push as the newest on its branch; returns its sequence number.
    fn observe_trigger(&self, event: &TriggerEvent) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        if event.kind == TriggerKind::Push {
            let mut heads = self.heads.lock().unwrap_or_else(PoisonError::into_inner);
            heads.insert(
                event.branch.clone(),
                BranchHead {
                    seq,
                    commit: event.commit.clone(),
                },
            );
        }
        seq
    }

    /// The commit of a push on the same branch that arrived after `seq`.
    fn newer_push(&self, event: &TriggerEvent, seq: u64) -> Option<String> {
        let heads = self.heads.lock().unwrap_or_else(PoisonError::into_inner);
        heads
            .get(&event.branch)
            .filter(|head| head.seq > seq)
            .map(|head| head.commit.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{MemoryArtifactStore, MemoryCacheStore, RecordingHost, ScriptedBuilder, StaticResolver};

    fn orchestrator(dir: &std::path::Path) -> Orchestrator {
        let manifest = dir.join("book.toml");
        std::fs::write(&manifest, "[dependencies]\nmdbook = \"0.4.40\"\n").unwrap();
        let collaborators = Collaborators {
            cache: Arc::new(MemoryCacheStore::new()),
            resolver: Arc::new(StaticResolver::new("deps")),
            builder: Arc::new(ScriptedBuilder::succeeding()),
            artifacts: Arc::new(MemoryArtifactStore::new()),
            host: Arc::new(RecordingHost::new()),
        };
        Orchestrator::new(
            collaborators,
            PipelineSettings::new(dir, vec![manifest]),
            Arc::new(DeployGate::new()),
        )
    }

    #[test]
    fn later_push_on_same_branch_marks_earlier_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(tmp.path());
        let first = TriggerEvent::push("main", "c1", true);
        let second = TriggerEvent::push("main", "c2", true);
        let other = TriggerEvent::push("docs", "c3", false);

        let s1 = orch.observe_trigger(&first);
        assert!(orch.newer_push(&first, s1).is_none());
        let s2 = orch.observe_trigger(&second);
        orch.observe_trigger(&other);

        assert_eq!(orch.newer_push(&first, s1).as_deref(), Some("c2"));
        assert!(orch.newer_push(&second, s2).is_none());
    }

    #[test]
    fn pull_requests_do_not_move_branch_head() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(tmp.path());
        let push = TriggerEvent::push("main", "c1", true);
        let s1 = orch.observe_trigger(&push);
        orch.observe_trigger(&TriggerEvent::pull_request("main", "c2", true));
        assert!(orch.newer_push(&push, s1).is_none());
    }

    #[tokio::test]
    async fn missing_manifest_fails_as_dependency_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(tmp.path());
        orch.settings.manifests = vec![tmp.path().join("absent.toml")];
        let outcome = orch.handle(TriggerEvent::push("main", "c1", true)).await;
        assert_eq!(outcome.terminal, TerminalState::Failed);
        assert_eq!(
            outcome.failure_kind,
            Some(crate::domain::FailureKind::DependencyResolution)
        );
        assert!(outcome.fingerprint.is_none());
    }

    #[tokio::test]
    async fn unreadable_manifest_is_retried_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(tmp.path());
        orch.settings.manifests = vec![tmp.path().join("absent.toml")];
        let outcome = orch.handle(TriggerEvent::push("main", "c1", true)).await;

        let retries: Vec<_> = outcome
            .logs
            .iter()
            .filter(|l| l.contains("manifest read attempt"))
            .collect();
        assert_eq!(retries.len(), 1, "logs: {:?}", outcome.logs);
        assert!(retries[0].contains("attempt 1"));
        assert_eq!(
            outcome.failure_kind,
            Some(crate::domain::FailureKind::DependencyResolution)
        );

        orch.settings.resolve_attempts = 1;
        let outcome = orch.handle(TriggerEvent::push("main", "c2", true)).await;
        assert!(!outcome.logs.iter().any(|l| l.contains("manifest read attempt")));
    }

    #[tokio::test]
    async fn fingerprint_matches_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(tmp.path());
        let outcome = orch.handle(TriggerEvent::pull_request("feature", "c1", false)).await;
        assert_eq!(outcome.fingerprint, Some(orch.fingerprint().unwrap()));
    }
}
