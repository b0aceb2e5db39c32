//! A build over budget is killed and reported as a timeout.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pressgate_core::fakes::{MemoryArtifactStore, MemoryCacheStore, RecordingHost, StaticResolver};
use pressgate_core::{
    BuildCommand, BuildError, Builder, Collaborators, CommandBuilder, DeployGate, FailureKind,
    Fingerprint, Orchestrator, PipelineSettings, ResolvedDependencies, RunStatus, TriggerEvent,
};

fn sleeper(pid_file: &Path) -> BuildCommand {
    BuildCommand::new(vec![
        "sh".into(),
        "-c".into(),
        format!("echo $$ > '{}'; exec sleep 30", pid_file.display()),
    ])
}

fn process_exists(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// Alive and not merely a zombie awaiting its new parent.
fn process_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat
            .rsplit(')')
            .next()
            .unwrap_or("")
            .trim_start()
            .starts_with('Z'),
        Err(_) => false,
    }
}

async fn wait_until_gone(pid: u32) -> bool {
    for _ in 0..40 {
        if !process_running(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn deps() -> ResolvedDependencies {
    ResolvedDependencies {
        fingerprint: Fingerprint::compute([("book.toml", b"x".as_slice())]),
        payload: Vec::new(),
        restored: false,
    }
}

#[tokio::test]
async fn builder_kills_and_reaps_process_over_budget() {
    let tmp = tempfile::tempdir().unwrap();
    let pid_file = tmp.path().join("build.pid");
    let builder = CommandBuilder::new(
        sleeper(&pid_file),
        tmp.path().join("scratch"),
        Duration::from_millis(300),
    );
    let started = Instant::now();
    let result = builder.build(tmp.path(), &deps()).await;
    assert!(started.elapsed() < Duration::from_secs(10));

    let Some(BuildError::Timeout { pid, budget_ms, .. }) = result.error() else {
        panic!("expected timeout, got {:?}", result.outcome);
    };
    assert_eq!(*budget_ms, 300);
    let pid = pid.expect("child pid");

    let recorded: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    assert_eq!(recorded, pid);
    if cfg!(target_os = "linux") {
        assert!(!process_exists(pid), "build process {pid} still present");
    }
}

#[tokio::test]
async fn timeout_kills_processes_the_toolchain_started() {
    let tmp = tempfile::tempdir().unwrap();
    let helper_file = tmp.path().join("helper.pid");
    let wrapper = BuildCommand::new(vec![
        "sh".into(),
        "-c".into(),
        format!("sleep 30 & echo $! > '{}'; wait", helper_file.display()),
    ]);
    let builder = CommandBuilder::new(wrapper, tmp.path().join("scratch"), Duration::from_millis(300));

    let started = Instant::now();
    let result = builder.build(tmp.path(), &deps()).await;
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(matches!(result.error(), Some(BuildError::Timeout { .. })));

    let helper: u32 = std::fs::read_to_string(&helper_file).unwrap().trim().parse().unwrap();
    if cfg!(target_os = "linux") {
        assert!(wait_until_gone(helper).await, "toolchain helper {helper} still running");
    }
}

#[tokio::test]
async fn orchestrated_timeout_fails_run_without_publishing() {
    let tmp = tempfile::tempdir().unwrap();
    let manifest = tmp.path().join("book.toml");
    std::fs::write(&manifest, "[dependencies]\n").unwrap();
    let pid_file = tmp.path().join("build.pid");

    let artifacts = Arc::new(MemoryArtifactStore::new());
    let host = Arc::new(RecordingHost::new());
    let collaborators = Collaborators {
        cache: Arc::new(MemoryCacheStore::new()),
        resolver: Arc::new(StaticResolver::new("deps")),
        builder: Arc::new(CommandBuilder::new(
            sleeper(&pid_file),
            tmp.path().join("scratch"),
            Duration::from_millis(300),
        )),
        artifacts: artifacts.clone(),
        host: host.clone(),
    };
    let orch = Orchestrator::new(
        collaborators,
        PipelineSettings::new(tmp.path(), vec![manifest]),
        Arc::new(DeployGate::new()),
    );

    let outcome = orch.handle(TriggerEvent::push("main", "c1", true)).await;
    assert_eq!(outcome.status, RunStatus::Failure);
    assert_eq!(outcome.failure_kind, Some(FailureKind::Timeout));
    assert!(outcome.diagnostics.unwrap().contains("300ms"));
    assert_eq!(artifacts.publish_count(), 0);
    assert_eq!(host.promote_count(), 0);

    let pid: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    if cfg!(target_os = "linux") {
        assert!(!process_exists(pid));
    }
}
