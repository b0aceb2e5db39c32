//! Run lifecycle events.
//!
//! Each function emits one structured event with a stable `event` field, so
//! log pipelines can follow a run without parsing messages. Everything a run
//! emits sits inside the span returned by [`run_span`].

use tracing::{info, warn};

use crate::domain::{FailureKind, RunOutcome, TriggerEvent};
use crate::fingerprint::Fingerprint;
use crate::store::ArtifactId;

/// Span that scopes every event of one run.
///
/// # Example
///
/// ```ignore
/// let span = run_span(run.id.as_str());
/// self.handle_run(run).instrument(span).await
/// ```
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("pressgate.run", run_id = %run_id)
}

/// Emit event: a trigger was accepted and a run began.
///
/// # Example
///
/// ```ignore
/// emit_run_started("run-123", &TriggerEvent::push("main", "abc123", true));
/// // logs: event=run.started run_id=run-123 kind=push branch=main commit=abc123 is_main=true
/// ```
pub fn emit_run_started(run_id: &str, event: &TriggerEvent) {
    info!(
        event = "run.started",
        run_id = %run_id,
        kind = %event.kind,
        branch = %event.branch,
        commit = %event.commit,
        is_main = event.is_main,
    );
}

/// Emit event: resolved dependencies restored from the cache.
pub fn emit_cache_hit(run_id: &str, fingerprint: &Fingerprint) {
    info!(event = "cache.hit", run_id = %run_id, fingerprint = %fingerprint.short());
}

/// Emit event: no usable cache entry; dependencies will be resolved fresh.
pub fn emit_cache_miss(run_id: &str, fingerprint: &Fingerprint) {
    info!(event = "cache.miss", run_id = %run_id, fingerprint = %fingerprint.short());
}

/// Emit event: caching resolved dependencies failed (warning level). The run
/// continues.
pub fn emit_cache_store_failed(run_id: &str, fingerprint: &Fingerprint, error: &dyn std::fmt::Display) {
    warn!(
        event = "cache.store_failed",
        run_id = %run_id,
        fingerprint = %fingerprint.short(),
        error = %error,
    );
}

/// Emit event: a cache entry failed verification or conflicted with a fresh
/// payload and was invalidated (warning level).
pub fn emit_cache_corrupted(run_id: &str, fingerprint: &Fingerprint, error: &dyn std::fmt::Display) {
    warn!(
        event = "cache.corrupted",
        run_id = %run_id,
        fingerprint = %fingerprint.short(),
        error = %error,
    );
}

/// Emit event: the toolchain finished, successfully or not.
pub fn emit_build_finished(run_id: &str, success: bool, duration_ms: u64) {
    info!(event = "build.finished", run_id = %run_id, success = success, duration_ms = duration_ms);
}

/// Emit event: build output stored as an immutable artifact.
pub fn emit_artifact_published(run_id: &str, artifact_id: &ArtifactId, file_count: u64) {
    info!(
        event = "artifact.published",
        run_id = %run_id,
        artifact_id = %artifact_id,
        file_count = file_count,
    );
}

/// Emit event: another deployment held the gate, so this run did not promote.
///
/// ```ignore
/// emit_deploy_skipped_superseded("run-124", Some("run-123"));
/// // logs: event=deploy.skipped_superseded run_id=run-124 holder=run-123
/// ```
pub fn emit_deploy_skipped_superseded(run_id: &str, holder: Option<&str>) {
    info!(
        event = "deploy.skipped_superseded",
        run_id = %run_id,
        holder = holder.unwrap_or("unknown"),
    );
}

/// Emit event: the live site now serves `artifact_id`.
pub fn emit_deploy_promoted(run_id: &str, artifact_id: &ArtifactId) {
    info!(event = "deploy.promoted", run_id = %run_id, artifact_id = %artifact_id);
}

/// Emit event: promotion failed and the previous site stayed live (warning level).
pub fn emit_deploy_failed(run_id: &str, artifact_id: &ArtifactId, error: &dyn std::fmt::Display) {
    warn!(event = "deploy.failed", run_id = %run_id, artifact_id = %artifact_id, error = %error);
}

pub fn emit_run_stale(run_id: &str, branch: &str, newest_commit: &str) {
    info!(event = "run.stale", run_id = %run_id, branch = %branch, newest_commit = %newest_commit);
}

/// Emit event: run reached its terminal state. Carries the summary fields of
/// the [`RunOutcome`].
pub fn emit_run_finished(outcome: &RunOutcome) {
    let failure_kind = outcome.failure_kind.map(failure_kind_str).unwrap_or("none");
    info!(
        event = "run.finished",
        run_id = %outcome.run_id,
        terminal = ?outcome.terminal,
        failure_kind = failure_kind,
        cache_hit = outcome.cache_hit,
        deployed = outcome.deployed,
        stale = outcome.stale,
        duration_ms = outcome.duration_ms,
    );
}

fn failure_kind_str(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::DependencyResolution => "dependency_resolution",
        FailureKind::Build => "build",
        FailureKind::Timeout => "timeout",
        FailureKind::Publish => "publish",
        FailureKind::Promotion => "promotion",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn run_started_carries_event_fields() {
        let event = TriggerEvent::push("main", "abc123", true);
        emit_run_started("run-1", &event);
        assert!(logs_contain("run.started"));
        assert!(logs_contain("abc123"));
    }

    #[test]
    #[traced_test]
    fn events_inside_span_are_tagged_with_run_id() {
        let span = run_span("run-span-7");
        let _entered = span.enter();
        emit_build_finished("run-span-7", false, 12);
        assert!(logs_contain("build.finished"));
        assert!(logs_contain("run-span-7"));
    }

    #[test]
    #[traced_test]
    fn cache_failures_are_warnings() {
        let fp = Fingerprint::compute([("book.toml", b"x".as_slice())]);
        emit_cache_store_failed("run-2", &fp, &"disk full");
        assert!(logs_contain("WARN"));
        assert!(logs_contain("cache.store_failed"));
        assert!(logs_contain("disk full"));
    }
}
