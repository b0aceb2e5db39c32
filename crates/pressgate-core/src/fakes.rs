//! In-memory fakes for the pipeline's collaborator traits (testing only).
//!
//! Each fake counts the calls it receives so tests can assert on side effects
//! ("no promote happened"), and offers switches for injecting failures.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use crate::builder::{BuildResult, Builder};
use crate::domain::{BuildError, PromotionError, PublishError, ResolveError, RunId};
use crate::fingerprint::{DependencyManifest, Fingerprint};
use crate::hosting::{effective_stack, DeployAction, Deployment, HostingEndpoint};
use crate::resolver::{DependencyResolver, ResolvedDependencies};
use crate::store::{
    payload_digest, Artifact, ArtifactId, ArtifactStore, CacheEntry, CacheStore, StoreError,
    StoreResult,
};

// ---------------------------------------------------------------------------
// MemoryCacheStore
// ---------------------------------------------------------------------------

/// Cache store backed by a `HashMap<fingerprint, CacheEntry>`.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
    fail_lookups: AtomicBool,
    fail_stores: AtomicBool,
    lookups: AtomicUsize,
    stores: AtomicUsize,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `lookup` fail with an I/O error.
    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// Make every `store` fail with an I/O error.
    pub fn fail_stores(&self, fail: bool) {
        self.fail_stores.store(fail, Ordering::SeqCst);
    }

    /// Flip the stored payload without touching its recorded digest.
    pub fn corrupt(&self, key: &Fingerprint) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key.as_str()) {
            entry.payload.push(0xff);
        }
    }

    /// Insert an entry directly, bypassing conflict checks.
    pub fn seed(&self, key: &Fingerprint, payload: &[u8]) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.as_str().to_string(), CacheEntry::new(key.clone(), payload.to_vec()));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }
}

fn injected(op: &str) -> StoreError {
    StoreError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("injected {op} failure"),
    ))
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn lookup(&self, key: &Fingerprint) -> StoreResult<Option<CacheEntry>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(injected("lookup"));
        }
        let entry = self.entries.lock().unwrap().get(key.as_str()).cloned();
        match entry {
            Some(entry) => {
                entry.verify()?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn store(&self, key: &Fingerprint, payload: &[u8]) -> StoreResult<()> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        if self.fail_stores.load(Ordering::SeqCst) {
            return Err(injected("store"));
        }
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(key.as_str()) {
            if existing.payload_digest == payload_digest(payload) {
                return Ok(());
            }
            return Err(StoreError::Conflict(key.to_string()));
        }
        entries.insert(
            key.as_str().to_string(),
            CacheEntry::new(key.clone(), payload.to_vec()),
        );
        Ok(())
    }

    async fn invalidate(&self, key: &Fingerprint) -> StoreResult<()> {
        self.entries.lock().unwrap().remove(key.as_str());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

/// Artifact store backed by a `BTreeMap<id, Artifact>`.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<BTreeMap<String, Artifact>>,
    fail_next: AtomicU32,
    lose_next_ack: AtomicBool,
    publishes: AtomicUsize,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publishes with `Unavailable` before storing anything.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Store the next artifact but report `Unavailable`, as if the response
    /// was lost in transit.
    pub fn lose_next_ack(&self) {
        self.lose_next_ack.store(true, Ordering::SeqCst);
    }

    /// Number of `publish` calls, including failed ones.
    pub fn publish_count(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.artifacts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn publish(&self, run_id: &RunId, result: &BuildResult) -> Result<Artifact, PublishError> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        let Some(output_root) = result.output_root() else {
            return Err(PublishError::InvalidArgument(
                "cannot publish a failed build".to_string(),
            ));
        };
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PublishError::Unavailable("injected outage".to_string()));
        }

        let id = ArtifactId::for_run(run_id);
        let mut artifacts = self.artifacts.lock().unwrap();
        if artifacts.contains_key(id.as_str()) {
            return Err(PublishError::AlreadyExists(id));
        }
        let artifact = Artifact {
            id: id.clone(),
            producing_run: run_id.clone(),
            content_root: output_root.to_path_buf(),
            content_digest: payload_digest(output_root.to_string_lossy().as_bytes()),
            file_count: 1,
            created_at: Utc::now(),
        };
        artifacts.insert(id.0.clone(), artifact.clone());

        if self.lose_next_ack.swap(false, Ordering::SeqCst) {
            return Err(PublishError::Unavailable("response lost".to_string()));
        }
        Ok(artifact)
    }

    async fn retrieve(&self, id: &ArtifactId) -> StoreResult<Artifact> {
        self.artifacts
            .lock()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self) -> StoreResult<Vec<Artifact>> {
        let mut all: Vec<Artifact> = self.artifacts.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// ScriptedBuilder
// ---------------------------------------------------------------------------

/// What a [`ScriptedBuilder`] does when invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedBuild {
    Succeed,
    /// Toolchain failure with the given diagnostics.
    Fail(String),
    Timeout,
}

/// Builder that follows a script instead of running a toolchain.
#[derive(Debug)]
pub struct ScriptedBuilder {
    behaviour: Mutex<ScriptedBuild>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    restored: Mutex<Vec<bool>>,
}

impl ScriptedBuilder {
    pub fn new(behaviour: ScriptedBuild) -> Self {
        Self {
            behaviour: Mutex::new(behaviour),
            delay: None,
            calls: AtomicUsize::new(0),
            restored: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(ScriptedBuild::Succeed)
    }

    pub fn failing(diagnostics: impl Into<String>) -> Self {
        Self::new(ScriptedBuild::Fail(diagnostics.into()))
    }

    /// Sleep before returning, to keep runs overlapping.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set(&self, behaviour: ScriptedBuild) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether each build received dependencies restored from the cache.
    pub fn restored_flags(&self) -> Vec<bool> {
        self.restored.lock().unwrap().clone()
    }
}

#[async_trait]
impl Builder for ScriptedBuilder {
    async fn build(&self, _corpus_root: &Path, deps: &ResolvedDependencies) -> BuildResult {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.restored.lock().unwrap().push(deps.restored);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let behaviour = self.behaviour.lock().unwrap().clone();
        match behaviour {
            ScriptedBuild::Succeed => BuildResult::success(
                PathBuf::from(format!("/memory/build-{n}")),
                "rendered".to_string(),
                1,
            ),
            ScriptedBuild::Fail(diagnostics) => BuildResult::failure(
                BuildError::Toolchain {
                    exit_code: 1,
                    diagnostics: diagnostics.clone(),
                },
                diagnostics,
                1,
            ),
            ScriptedBuild::Timeout => BuildResult::failure(
                BuildError::Timeout {
                    budget_ms: 10,
                    pid: None,
                    diagnostics: String::new(),
                },
                String::new(),
                10,
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// StaticResolver
// ---------------------------------------------------------------------------

/// Resolver returning a fixed payload, optionally failing the first calls.
#[derive(Debug)]
pub struct StaticResolver {
    payload: Vec<u8>,
    fail_first: AtomicU32,
    calls: AtomicUsize,
}

impl StaticResolver {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            fail_first: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` calls with a spawn error.
    pub fn failing_first(self, n: u32) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DependencyResolver for StaticResolver {
    async fn resolve(&self, _manifest: &DependencyManifest) -> Result<Vec<u8>, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ResolveError::Spawn("registry unreachable".to_string()));
        }
        Ok(self.payload.clone())
    }
}

// ---------------------------------------------------------------------------
// RecordingHost
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Hold {
    entered: Notify,
    release: Notify,
}

/// Hosting endpoint that records promotions in memory.
///
/// A gated host parks every promotion until [`RecordingHost::release`] is
/// called, so tests can line up a second run while the first is deploying.
#[derive(Debug, Default)]
pub struct RecordingHost {
    history: Mutex<Vec<Deployment>>,
    promotes: AtomicUsize,
    reject: AtomicBool,
    reject_next: AtomicUsize,
    hold: Option<Arc<Hold>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            hold: Some(Arc::new(Hold {
                entered: Notify::new(),
                release: Notify::new(),
            })),
            ..Self::default()
        }
    }

    /// Reject every promotion.
    pub fn reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Reject only the next `n` promotions.
    pub fn reject_next(&self, n: usize) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    /// Wait until a promotion is parked on the gate.
    pub async fn wait_entered(&self) {
        if let Some(hold) = &self.hold {
            hold.entered.notified().await;
        }
    }

    /// Let one parked promotion proceed.
    pub fn release(&self) {
        if let Some(hold) = &self.hold {
            hold.release.notify_one();
        }
    }

    /// Number of `promote` calls, including rejected ones.
    pub fn promote_count(&self) -> usize {
        self.promotes.load(Ordering::SeqCst)
    }

    /// Artifacts successfully promoted, in order.
    pub fn promoted(&self) -> Vec<ArtifactId> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.action == DeployAction::Promote)
            .map(|d| d.artifact_id.clone())
            .collect()
    }
}

#[async_trait]
impl HostingEndpoint for RecordingHost {
    async fn promote(&self, artifact: &Artifact, budget: Duration) -> Result<Deployment, PromotionError> {
        self.promotes.fetch_add(1, Ordering::SeqCst);
        if let Some(hold) = &self.hold {
            hold.entered.notify_one();
            if tokio::time::timeout(budget, hold.release.notified()).await.is_err() {
                return Err(PromotionError::Timeout {
                    budget_ms: budget.as_millis() as u64,
                });
            }
        }
        let one_shot = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if one_shot || self.reject.load(Ordering::SeqCst) {
            return Err(PromotionError::Rejected("injected rejection".to_string()));
        }
        let deployment = Deployment::promote(artifact);
        self.history.lock().unwrap().push(deployment.clone());
        Ok(deployment)
    }

    async fn current(&self) -> Result<Option<Deployment>, PromotionError> {
        let history = self.history.lock().unwrap();
        Ok(effective_stack(&history).last().map(|d| (*d).clone()))
    }

    async fn history(&self) -> Result<Vec<Deployment>, PromotionError> {
        Ok(self.history.lock().unwrap().clone())
    }

    async fn rollback(&self, _budget: Duration) -> Result<Deployment, PromotionError> {
        let mut history = self.history.lock().unwrap();
        let mut target = {
            let stack = effective_stack(&history);
            if stack.len() < 2 {
                return Err(PromotionError::NothingToRollBack);
            }
            stack[stack.len() - 2].clone()
        };
        target.action = DeployAction::Rollback;
        target.deployed_at = Utc::now();
        history.push(target.clone());
        Ok(target)
    }
}
